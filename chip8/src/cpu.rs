//! CPU and memory state.
use crate::{bytecode::fetch, constants::*, timer::Timers};

/// Whether the machine is executing normally, or stalled on `Fx0A (LD Vx, K)`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum MachineStatus {
    #[default]
    Normal,
    WaitingForKey,
}

/// Core state for a chip8 interpreter.
///
/// The display and keyboard are not stored here. They are shared with
/// other threads through [`Chip8Handle`](crate::shared::Chip8Handle).
pub struct Chip8Cpu {
    // ------------------------------------------------------------------------
    // Registers
    /// Program counter pointing to the current position in the bytecode.
    pub(crate) pc: Address,
    /// Stack pointer, indicating the top of the stack.
    pub(crate) sp: u8,
    /// General purpose registers for temporary values.
    ///
    /// Register 16 (VF) is used for either the carry flag or borrow switch depending on opcode.
    pub(crate) registers: [u8; REGISTER_COUNT],
    /// Pointer register used for temporarily storing an address.
    pub(crate) address: Address,
    /// Delay and sound timers.
    pub(crate) timers: Timers,
    pub(crate) status: MachineStatus,

    // ------------------------------------------------------------------------
    // Memory
    /// Main memory storage space.
    pub(crate) ram: Box<[u8; MEM_SIZE]>,
    /// Stack of return pointers used for jumping when a routine call finishes.
    pub(crate) stack: [Address; STACK_SIZE],
}

impl Default for Chip8Cpu {
    fn default() -> Self {
        Self {
            pc: 0,
            sp: 0,
            registers: [0; REGISTER_COUNT],
            address: 0,
            timers: Timers::new(),
            status: MachineStatus::Normal,

            ram: Box::new([0; MEM_SIZE]),
            stack: [0; STACK_SIZE],
        }
    }
}

impl Chip8Cpu {
    /// Create an initialised CPU, ready for a program to be loaded.
    pub fn new() -> Self {
        let mut cpu = Self::default();
        cpu.init();
        cpu
    }

    /// Zero all state, load the font and point the program counter at
    /// the start of program memory.
    pub fn init(&mut self) {
        self.pc = MEM_START as Address;
        self.sp = 0;
        self.registers.fill(0);
        self.address = 0;
        self.timers = Timers::new();
        self.status = MachineStatus::Normal;

        self.ram.fill(0);
        self.stack.fill(0);

        let font = FONTSET_START as usize;
        self.ram[font..font + FONTSET_DATA_LENGTH].copy_from_slice(&FONTSET);
    }

    /// Erase the program region of memory.
    pub(crate) fn clear_program(&mut self) {
        self.ram[MEM_START..].fill(0);
    }

    /// Read a byte from memory. The address wraps at the end of memory.
    #[inline(always)]
    pub fn read(&self, address: usize) -> u8 {
        self.ram[address & MEM_MASK]
    }

    /// Write a byte to memory. The address wraps at the end of memory.
    #[inline(always)]
    pub(crate) fn write(&mut self, address: usize, value: u8) {
        self.ram[address & MEM_MASK] = value;
    }

    /// Extract the instruction word at the current program counter.
    #[inline(always)]
    pub fn instr(&self) -> u16 {
        fetch(&*self.ram, self.pc as usize)
    }

    /// Push a return address onto the stack.
    ///
    /// The stack pointer is incremented first, so slot 0 is never written
    /// by a call. Overflow wraps around instead of failing.
    #[inline]
    pub(crate) fn push(&mut self, address: Address) {
        self.sp = ((self.sp as usize + 1) & STACK_MASK) as u8;
        self.stack[self.sp as usize] = address;
    }

    /// Pop the return address at the top of the stack.
    ///
    /// At stack pointer 0 the pointer stays put and slot 0 is returned.
    #[inline]
    pub(crate) fn pop(&mut self) -> Address {
        let address = self.stack[self.sp as usize & STACK_MASK];
        self.sp = self.sp.saturating_sub(1);
        address
    }

    // ------------------------------------------------------------------------
    // Read access for front-ends and tests.

    pub fn pc(&self) -> Address {
        self.pc
    }

    pub fn sp(&self) -> u8 {
        self.sp
    }

    pub fn registers(&self) -> &[u8; REGISTER_COUNT] {
        &self.registers
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn stack(&self) -> &[Address; STACK_SIZE] {
        &self.stack
    }

    pub fn ram(&self) -> &[u8; MEM_SIZE] {
        &self.ram
    }

    pub fn status(&self) -> MachineStatus {
        self.status
    }

    /// Current value of the delay timer.
    pub fn delay_timer(&self) -> u8 {
        self.timers.delay.value()
    }

    /// Current value of the sound timer.
    pub fn sound_timer(&self) -> u8 {
        self.timers.sound.value()
    }
}
