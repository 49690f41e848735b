//! Virtual machine.
use std::{
    fmt::{self, Write},
    io::Read,
    time::Duration,
};

use rand::prelude::*;

use crate::{
    constants::*,
    cpu::{Chip8Cpu, MachineStatus},
    devices::KeyCode,
    error::{Chip8Error, Chip8Result},
    op::Op,
    shared::{Chip8Handle, Frame},
};

pub struct Chip8Vm {
    cpu: Chip8Cpu,
    handle: Chip8Handle,
    conf: Chip8Conf,
}

impl Chip8Vm {
    pub fn new(conf: Chip8Conf) -> Self {
        let handle = Chip8Handle::new(&conf);
        Chip8Vm {
            cpu: Chip8Cpu::new(),
            handle,
            conf,
        }
    }

    /// Configuration that was used to instantiate the VM.
    pub fn config(&self) -> &Chip8Conf {
        &self.conf
    }

    /// Thread-safe handle for front-ends.
    pub fn handle(&self) -> Chip8Handle {
        self.handle.clone()
    }

    pub fn cpu(&self) -> &Chip8Cpu {
        &self.cpu
    }

    pub fn status(&self) -> MachineStatus {
        self.cpu.status
    }

    /// Copy of the display buffer.
    pub fn frame(&self) -> Frame {
        self.handle.frame()
    }

    /// Re-initialise the machine, discarding the loaded program.
    pub fn reset(&mut self) {
        self.cpu.init();
        self.handle.with_display(Frame::clear);
        self.handle.with_debug_text(String::clear);
        self.handle.clear_keys();
    }

    /// Copy a program into memory at `MEM_START`.
    ///
    /// An oversized program is rejected without touching memory. Otherwise
    /// the remainder of the program region is zeroed.
    pub fn load_bytecode(&mut self, bytecode: &[u8]) -> Chip8Result<()> {
        if !check_program_size(bytecode) {
            log::warn!("rejected program of {} bytes", bytecode.len());
            return Err(Chip8Error::LargeProgram {
                size: bytecode.len(),
            });
        }

        // Start with clean memory to avoid leaking previous program.
        self.cpu.clear_program();

        // Load program into virtual RAM
        self.cpu.ram[MEM_START..MEM_START + bytecode.len()].copy_from_slice(bytecode);

        log::info!("loaded program of {} bytes", bytecode.len());

        Ok(())
    }

    /// Read a program from the given source, then load it.
    ///
    /// Memory is left untouched when the source can't be read in full.
    pub fn load_program(&mut self, reader: impl Read) -> Chip8Result<()> {
        let bytecode = read_program(reader)?;
        self.load_bytecode(&bytecode)
    }
}

/// Check whether the given program fits in the program region of memory.
#[inline]
pub fn check_program_size(bytecode: &[u8]) -> bool {
    bytecode.len() <= PROGRAM_CAPACITY
}

/// Read a whole program from the source.
///
/// Reading stops one byte past the program capacity, so an oversized or
/// endless source is rejected without being consumed entirely.
pub(crate) fn read_program(reader: impl Read) -> Chip8Result<Vec<u8>> {
    let mut bytecode = Vec::with_capacity(PROGRAM_CAPACITY);
    reader
        .take(PROGRAM_CAPACITY as u64 + 1)
        .read_to_end(&mut bytecode)?;

    if !check_program_size(&bytecode) {
        log::warn!("rejected program larger than {PROGRAM_CAPACITY} bytes");
        return Err(Chip8Error::LargeProgram {
            size: bytecode.len(),
        });
    }

    Ok(bytecode)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Ok,
    /// Program counter has jumped to a new address.
    ///
    /// This is returned when the interpreter encounters:
    ///
    /// - 1nnn (`JP addr`)
    /// - 2nnn (`CALL addr`)
    /// - 00EE (`RET`)
    /// - Bnnn (`JP V0, addr`)
    Jump,
    Draw,
    Sound,
    /// Wait for a keypress.
    ///
    /// This is triggered by the opcode `Fx0A` (`LD Vx, K`), which stops
    /// execution until a key is pressed, and loads the key value into `Vx`.
    KeyWait,
    /// The word at the program counter is zero.
    ///
    /// Nothing was executed. This usually means the program ran off
    /// the end of its code into empty memory.
    Halt,
    /// The word at the program counter is not a known instruction.
    ///
    /// It is skipped over without moving the program counter.
    Unknown,
}

/// VM Configuration Parameters.
#[derive(Debug, Default, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize), serde(default))]
pub struct Chip8Conf {
    /// Initial instruction rate.
    pub clock_frequency: Option<Hz>,
    /// Upper bound for instruction rate changes at runtime.
    pub max_clock_frequency: Option<Hz>,
    pub shift_quirk: ShiftQuirk,
}

impl Chip8Conf {
    pub fn max_clock_frequency(&self) -> Hz {
        let max = self
            .max_clock_frequency
            .unwrap_or(Hz(DEFAULT_MAX_CLOCK_FREQUENCY));
        Hz(max.0.max(MIN_CLOCK_FREQUENCY))
    }

    /// Initial clock frequency, within the configured bounds.
    pub fn clock_frequency(&self) -> Hz {
        let freq = self
            .clock_frequency
            .unwrap_or(Hz(DEFAULT_CLOCK_FREQUENCY));
        Hz(freq
            .0
            .clamp(MIN_CLOCK_FREQUENCY, self.max_clock_frequency().0))
    }
}

/// CPU clock frequency, in hertz (per second)
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize), serde(transparent))]
pub struct Hz(pub u64);

impl From<Hz> for Duration {
    fn from(freq: Hz) -> Self {
        if freq.0 == 0 {
            Duration::from_nanos(0)
        } else {
            Duration::from_nanos(NANOS_IN_SECOND / freq.0)
        }
    }
}

impl fmt::Display for Hz {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Hz", self.0)
    }
}

/// Operand selection of the shift instructions `8xy6` and `8xyE`.
///
/// Historical documents disagree on whether `Vy` is shifted into `Vx`,
/// or `Vx` is shifted in place. Which one is correct depends on the program.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum ShiftQuirk {
    /// Shift `Vx` in place and ignore `Vy`. Most programs expect this.
    #[default]
    InPlace,
    /// Shift `Vy` and store the result in `Vx`.
    Source,
}

/// Interpreter
impl Chip8Vm {
    /// Evaluate the sound timer, returning the buzzer edge if any.
    pub fn update_timers(&mut self) -> Option<bool> {
        self.cpu.timers.update()
    }

    /// Execute instructions until the step count is reached, or the
    /// machine halts on an empty word.
    ///
    /// Timers are evaluated once before stepping.
    pub fn run_steps(&mut self, step_count: usize) -> Flow {
        if let Some(state) = self.update_timers() {
            self.handle.set_buzzing(state);
        }

        let mut flow = Flow::Ok;
        for _ in 0..step_count {
            flow = self.step();
            if flow == Flow::Halt {
                break;
            }
        }
        flow
    }

    /// Fetch, decode and execute exactly one instruction.
    pub fn step(&mut self) -> Flow {
        // Each instruction is two bytes, with the opcode identity in the first 4-bit nibble.
        let word = self.cpu.instr();

        if word == 0 {
            return Flow::Halt;
        }

        let op = Op::decode(word);
        self.write_debug_text(word, op);

        match op {
            Some(op) => {
                op_trace(&self.cpu, op);
                self.exec(op)
            }
            None => {
                log::trace!("{:04X}: unknown instruction {word:04X}", self.cpu.pc);
                Flow::Unknown
            }
        }
    }

    /// Skip the next instruction.
    #[inline(always)]
    fn skip(&mut self) {
        self.cpu.pc = (self.cpu.pc + 2) & MEM_MASK as Address;
    }

    #[inline(always)]
    fn reg(&self, index: u8) -> u8 {
        self.cpu.registers[index as usize & 0xF]
    }

    #[inline(always)]
    fn set_reg(&mut self, index: u8, value: u8) {
        self.cpu.registers[index as usize & 0xF] = value;
    }

    #[inline(always)]
    fn set_flag(&mut self, flag: bool) {
        self.cpu.registers[FLAG_REGISTER] = flag as u8;
    }

    /// Select the operand of a shift instruction.
    #[inline(always)]
    fn shift_operand(&self, vx: u8, vy: u8) -> u8 {
        match self.conf.shift_quirk {
            ShiftQuirk::InPlace => self.reg(vx),
            ShiftQuirk::Source => self.reg(vy),
        }
    }

    fn exec(&mut self, op: Op) -> Flow {
        let mut control_flow = Flow::Ok;

        // Straight-line instructions continue at the next word. Control
        // flow instructions overwrite the program counter below.
        self.skip();

        match op {
            // ----------------------------------------------------------------
            // 00E0 (CLS)
            //
            // Clear display
            Op::ClearScreen => {
                self.handle.with_display(Frame::clear);
                control_flow = Flow::Draw;
            }
            // 00EE (RET)
            //
            // Return from a subroutine.
            // Set the program counter to the value at the top of the stack.
            // Subtract 1 from the stack pointer.
            Op::Return => {
                self.cpu.pc = self.cpu.pop() & MEM_MASK as Address;
                control_flow = Flow::Jump;
            }
            // 1nnn (JP addr)
            //
            // Jump to address.
            Op::Jump { address } => {
                self.cpu.pc = address;
                control_flow = Flow::Jump;
            }
            // 2nnn (CALL addr)
            //
            // Call subroutine at NNN. The address of the next
            // instruction is the return address.
            Op::Call { address } => {
                let ret = self.cpu.pc;
                self.cpu.push(ret);
                self.cpu.pc = address;
                control_flow = Flow::Jump;
            }
            // 3xnn (SE Vx, byte)
            //
            // Skip the next instruction if register VX equals value NN.
            Op::Skip_Eq_Byte { vx, nn } => {
                if self.reg(vx) == nn {
                    self.skip();
                }
            }
            // 4xnn (SNE Vx, byte)
            //
            // Skip the next instruction if register VX does not equal value NN.
            Op::Skip_NotEq_Byte { vx, nn } => {
                if self.reg(vx) != nn {
                    self.skip();
                }
            }
            // 5xy0 (SE Vx, Vy)
            //
            // Skip the next instruction if register VX equals value VY.
            Op::Skip_Eq { vx, vy } => {
                if self.reg(vx) == self.reg(vy) {
                    self.skip();
                }
            }
            // 6xnn (LD Vx, byte)
            //
            // Set register VX to value NN.
            Op::Load_Byte { vx, nn } => {
                self.set_reg(vx, nn);
            }
            // 7xnn (ADD Vx, byte)
            //
            // Add value NN to register VX. Carry flag is not set.
            Op::Add_Byte { vx, nn } => {
                let x = self.reg(vx);
                self.set_reg(vx, x.wrapping_add(nn));
            }
            // 9xy0 (SNE Vx, Vy)
            //
            // Skip next instruction if Vx != Vy.
            Op::Skip_NotEq { vx, vy } => {
                if self.reg(vx) != self.reg(vy) {
                    self.skip();
                }
            }
            // Annn (LD I, addr)
            //
            // Set address register I to value NNN.
            Op::Load_Address { address } => {
                self.cpu.address = address;
            }
            // Bnnn (JP V0, addr)
            //
            // Jump to location NNN plus the value of V0.
            Op::Jump_V0 { address } => {
                let target = address as usize + self.reg(0) as usize;
                self.cpu.pc = (target & MEM_MASK) as Address;
                control_flow = Flow::Jump;
            }
            // Cxnn (RND Vx, byte)
            //
            // Generate random number.
            // Set register VX to the result of bitwise AND between a random number and NN.
            Op::Random { vx, nn } => {
                self.set_reg(vx, nn & thread_rng().gen::<u8>());
            }
            // Dxyn (DRW Vx, Vy, nibble)
            //
            // Draw sprite to the display buffer, at coordinate as per registers Vx and Vy.
            // Sprite is encoded as 8 pixels wide, N pixels high, stored in bits located in
            // memory pointed to by address register I.
            //
            // If the sprite is drawn outside of the display area, it is wrapped around to the other side.
            //
            // If the drawing operation erases existing pixels in the display buffer, register VF is set to
            // 1, and set to 0 if no display bits are unset. This is used for collision detection.
            Op::Draw { vx, vy, n } => {
                let (x, y) = (self.reg(vx) as usize, self.reg(vy) as usize);

                let mut sprite = [0; 0x10];
                let rows = &mut sprite[..n as usize];
                for (r, row) in rows.iter_mut().enumerate() {
                    *row = self.cpu.read(self.cpu.address as usize + r);
                }

                let is_erased = self
                    .handle
                    .with_display(|frame| frame.draw_sprite(x, y, rows));

                // If a pixel was erased, then a collision occurred.
                self.set_flag(is_erased);
                control_flow = Flow::Draw;
            }
            // Arithmetic instructions
            Op::Load_Vx_Vy { .. }
            | Op::Or_Vx_Vy { .. }
            | Op::And_Vx_Vy { .. }
            | Op::Xor_Vx_Vy { .. }
            | Op::Add_Vx_Vy { .. }
            | Op::Sub_Vx_Vy { .. }
            | Op::ShiftRight { .. }
            | Op::SubReverse_Vx_Vy { .. }
            | Op::ShiftLeft { .. } => self.exec_math(op),
            // Keyboard, timer and memory instructions
            _ => control_flow = self.exec_misc(op),
        }

        control_flow
    }

    /// Execute an arithmetic instruction
    #[inline]
    fn exec_math(&mut self, op: Op) {
        match op {
            // 8xy0 (LD Vx, Vy)
            //
            // Store the value of register VY in register VX.
            Op::Load_Vx_Vy { vx, vy } => {
                self.set_reg(vx, self.reg(vy));
            }
            // 8xy1 (OR Vx, Vy)
            //
            // Performs bitwise OR on VX and VY, and stores the result in VX.
            Op::Or_Vx_Vy { vx, vy } => {
                self.set_reg(vx, self.reg(vx) | self.reg(vy));
            }
            // 8xy2 (AND Vx, Vy)
            //
            // Performs bitwise AND on VX and VY, and stores the result in VX.
            Op::And_Vx_Vy { vx, vy } => {
                self.set_reg(vx, self.reg(vx) & self.reg(vy));
            }
            // 8xy3 (XOR Vx, Vy)
            //
            // Performs bitwise XOR on VX and VY, and stores the result in VX.
            Op::Xor_Vx_Vy { vx, vy } => {
                self.set_reg(vx, self.reg(vx) ^ self.reg(vy));
            }
            // 8xy4 (ADD Vx, Vy)
            //
            // ADDs VX to VY, and stores the result in VX.
            // Overflow is wrapped.
            // If overflow, set VF to 1, else 0.
            //
            // The flag is written last, so it wins when Vx is VF.
            Op::Add_Vx_Vy { vx, vy } => {
                let result = self.reg(vx) as u16 + self.reg(vy) as u16;
                self.set_reg(vx, (result & 0xFF) as u8); // Overflow wrap
                self.set_flag(result > 0xFF);
            }
            // 8xy5 (SUB Vx, Vy)
            //
            // Subtracts VY from VX, and stores the result in VX.
            // VF is set to 1 when VX > VY, before the subtraction.
            Op::Sub_Vx_Vy { vx, vy } => {
                let (x, y) = (self.reg(vx), self.reg(vy));
                self.set_flag(x > y);
                self.set_reg(vx, x.wrapping_sub(y));
            }
            // 8xy6 (SHR Vx {, Vy})
            //
            // VF is set to the least-significant bit of the operand,
            // then the operand shifted right by 1 is stored in VX.
            Op::ShiftRight { vx, vy } => {
                let value = self.shift_operand(vx, vy);
                self.set_flag(value & 1 == 1);
                self.set_reg(vx, value >> 1);
            }
            // 8xy7 (SUBN Vx, Vy)
            //
            // Subtracts VX from VY, and stores the result in VX.
            // VF is set to 1 when VY > VX, before the subtraction.
            Op::SubReverse_Vx_Vy { vx, vy } => {
                let (x, y) = (self.reg(vx), self.reg(vy));
                self.set_flag(y > x);
                self.set_reg(vx, y.wrapping_sub(x));
            }
            // 8xyE (SHL Vx {, Vy})
            //
            // VF is set to the most-significant bit of the operand,
            // then the operand shifted left by 1 is stored in VX.
            Op::ShiftLeft { vx, vy } => {
                let value = self.shift_operand(vx, vy);
                self.set_flag(value & 0x80 == 0x80);
                self.set_reg(vx, value << 1);
            }
            _ => unreachable!("not an arithmetic instruction: {op}"),
        }
    }

    /// Execute a miscellaneous instruction
    #[inline]
    fn exec_misc(&mut self, op: Op) -> Flow {
        let mut control_flow = Flow::Ok;

        match op {
            // ----------------------------------------------------------------
            // Ex9E (SKP Vx)
            //
            // Skip the next instruction if the key in Vx is pressed.
            Op::Skip_Key { vx } => {
                if self.handle.key_state(self.reg(vx)) {
                    self.skip();
                }
            }
            // ExA1 (SKNP Vx)
            //
            // Skip the next instruction if the key in Vx is not pressed.
            Op::Skip_NotKey { vx } => {
                if !self.handle.key_state(self.reg(vx)) {
                    self.skip();
                }
            }
            // ----------------------------------------------------------------
            // Fx07 (LD Vx, DT)
            //
            // Set Vx = delay timer value.
            Op::Load_Delay { vx } => {
                let delay = self.cpu.timers.delay.value();
                self.set_reg(vx, delay);
            }
            // Fx0A (LD Vx, K)
            //
            // Wait for a key press, store the value of the key in Vx.
            // All execution stops until a key is pressed, then the value of that key is stored in Vx.
            Op::WaitKey { vx } => {
                if let Some(k) = self.handle.first_key() {
                    self.set_reg(vx, k);
                    self.cpu.status = MachineStatus::Normal;
                } else {
                    // rewind the program counter to stall the machine
                    self.cpu.pc = self.cpu.pc.wrapping_sub(2) & MEM_MASK as Address;
                    self.cpu.status = MachineStatus::WaitingForKey;
                    control_flow = Flow::KeyWait;
                }
            }
            // Fx15 (LD DT, Vx)
            //
            // Set delay timer = Vx.
            Op::Set_Delay { vx } => {
                let x = self.reg(vx);
                self.cpu.timers.delay.set(x);
            }
            // Fx18 (LD ST, Vx)
            //
            // Set sound timer = Vx.
            Op::Set_Sound { vx } => {
                let x = self.reg(vx);
                self.cpu.timers.sound.set(x);
                control_flow = Flow::Sound;
            }
            // Fx1E (ADD I, Vx)
            //
            // Add Vx to I
            Op::Add_Address { vx } => {
                let x = self.reg(vx) as Address;
                self.cpu.address = self.cpu.address.wrapping_add(x);
            }
            // Fx29 (LD F, Vx)
            //
            // Set I = location of sprite for digit Vx.
            Op::Load_Font { vx } => {
                let x = self.reg(vx) as Address;
                self.cpu.address = FONTSET_START + x * FONTSET_HEIGHT as Address;
            }
            // Fx33 (LD B, Vx)
            //
            // Store the binary-coded decimal representation of Vx
            // in the memory locations I, I+1, and I+2.
            #[rustfmt::skip]
            Op::Store_Bcd { vx } => {
                let addr = self.cpu.address as usize;
                let x = self.reg(vx);
                self.cpu.write(addr,     x / 100 % 10);
                self.cpu.write(addr + 1, x / 10  % 10);
                self.cpu.write(addr + 2, x       % 10);
            }
            // Fx55 (LD [I], Vx)
            //
            // Store registers V0 through Vx in memory starting at location I.
            Op::Store_Registers { vx } => {
                let addr = self.cpu.address as usize;
                for v in 0..=vx as usize {
                    let x = self.cpu.registers[v];
                    self.cpu.write(addr + v, x);
                }
            }
            // Fx65 (LD Vx, [I])
            //
            // Read registers V0 through Vx from memory starting at location I.
            Op::Load_Registers { vx } => {
                let addr = self.cpu.address as usize;
                for v in 0..=vx as usize {
                    self.cpu.registers[v] = self.cpu.read(addr + v);
                }
            }
            _ => unreachable!("not a miscellaneous instruction: {op}"),
        }

        control_flow
    }
}

/// Troubleshooting
impl Chip8Vm {
    /// Regenerate the register dump shared with front-ends.
    fn write_debug_text(&self, word: u16, op: Option<Op>) {
        let keys = self.handle.keys();
        let result = self.handle.with_debug_text(|buf| {
            buf.clear();
            write_registers(buf, &self.cpu, &keys, word, op)
        });

        if let Err(err) = result {
            log::warn!("failed to write register dump: {err}");
        }
    }

    /// Returns the machine state as a human readable string.
    pub fn dump_registers(&self) -> Result<String, fmt::Error> {
        let word = self.cpu.instr();
        let mut buf = String::new();
        write_registers(
            &mut buf,
            &self.cpu,
            &self.handle.keys(),
            word,
            Op::decode(word),
        )?;
        Ok(buf)
    }

    /// Returns the contents of the memory as a human readable string.
    pub fn dump_ram(&self, count: usize) -> Result<String, fmt::Error> {
        let iter = self
            .cpu
            .ram
            .iter()
            .enumerate()
            .skip(MEM_START)
            .take(count)
            .step_by(2);
        let mut buf = String::new();

        for (i, op) in iter {
            writeln!(buf, "{:04X}: {:02X}{:02X}", i, op, self.cpu.read(i + 1))?;
        }

        Ok(buf)
    }

    pub fn dump_display(&self) -> Result<String, fmt::Error> {
        let mut buf = String::new();
        write!(buf, "{}", self.handle.frame())?;
        Ok(buf)
    }

    pub fn dump_keys(&self) -> Result<String, fmt::Error> {
        let mut buf = String::new();
        let mut pressed = KeyCode::all().filter(|key| self.handle.key(*key)).peekable();

        if pressed.peek().is_some() {
            write!(buf, "keys:")?;
            for key in pressed {
                write!(buf, " {key}")?;
            }
        }

        Ok(buf)
    }
}

/// Write the register table for the instruction about to be executed.
fn write_registers<W: Write>(
    w: &mut W,
    cpu: &Chip8Cpu,
    keys: &[bool; KEY_COUNT as usize],
    word: u16,
    op: Option<Op>,
) -> fmt::Result {
    write!(w, "{:>16}", "")?;
    for i in 0..REGISTER_COUNT {
        write!(w, "{i:>6X}")?;
    }
    writeln!(w)?;

    write!(w, "{:>16}", "GENERAL")?;
    for v in cpu.registers.iter() {
        write!(w, "    {v:02X}")?;
    }
    writeln!(w)?;

    write!(w, "{:>16}", "STACK")?;
    for addr in cpu.stack.iter() {
        write!(w, "  {addr:04X}")?;
    }
    writeln!(w)?;

    write!(w, "{:>16}", "KEYBOARD")?;
    for k in keys.iter() {
        write!(w, "{:>6}", *k as u8)?;
    }
    writeln!(w)?;

    writeln!(w, "{:>16}  {:04X}", "I", cpu.address)?;
    writeln!(w, "{:>16}  {:02X}", "DELAY TIMER", cpu.delay_timer())?;
    writeln!(w, "{:>16}  {:02X}", "SOUND TIMER", cpu.sound_timer())?;
    writeln!(w, "{:>16}  {:04X}", "PROGRAM COUNTER", cpu.pc)?;
    writeln!(w, "{:>16}  {:02X}", "STACK POINTER", cpu.sp)?;
    match op {
        Some(op) => writeln!(w, "{:>16}  {word:04X} {op}", "INSTRUCTION"),
        None => writeln!(w, "{:>16}  {word:04X} UNKNOWN", "INSTRUCTION"),
    }
}

#[cfg(feature = "op_trace")]
#[inline]
fn op_trace(cpu: &Chip8Cpu, op: Op) {
    log::trace!("{:04X}: {}", cpu.pc, op);
}

#[cfg(not(feature = "op_trace"))]
#[inline]
fn op_trace(_: &Chip8Cpu, _: Op) {}
