//! State shared between the execution thread and front-ends.
//!
//! The display buffer and the register dump are the only resources behind
//! a lock. They are written by the interpreter and copied out wholesale by
//! a renderer. Keys, flags and the clock rate are plain atomics; no
//! invariant spans more than one of them.
use std::{
    fmt::{self, Write},
    io::Read,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use crate::{
    constants::*,
    devices::KeyCode,
    error::Chip8Result,
    vm::{read_program, Chip8Conf, Hz},
};

/// Monochrome display buffer.
///
/// Pixels are stored row-major, so the pixel at `(x, y)` lives at
/// index `x + y * DISPLAY_WIDTH`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pixels: Box<[bool; DISPLAY_BUFFER_SIZE]>,
}

impl Default for Frame {
    fn default() -> Self {
        Self {
            pixels: Box::new([false; DISPLAY_BUFFER_SIZE]),
        }
    }
}

impl Frame {
    pub fn new() -> Self {
        Default::default()
    }

    /// State of the pixel at the given coordinate.
    ///
    /// Coordinates wrap around the edges of the screen.
    #[inline]
    pub fn pixel(&self, x: usize, y: usize) -> bool {
        self.pixels[(x & DISPLAY_WIDTH_MASK) + (y & DISPLAY_HEIGHT_MASK) * DISPLAY_WIDTH]
    }

    #[inline(always)]
    pub fn pixels(&self) -> &[bool; DISPLAY_BUFFER_SIZE] {
        &self.pixels
    }

    /// Number of pixels that are switched on.
    pub fn lit_count(&self) -> usize {
        self.pixels.iter().filter(|px| **px).count()
    }

    pub(crate) fn clear(&mut self) {
        self.pixels.fill(false);
    }

    /// XOR a sprite onto the buffer with its top left corner at `(x, y)`.
    ///
    /// Each byte in `rows` is one row of 8 pixels, most significant bit
    /// on the left. Both axes wrap independently per pixel.
    ///
    /// Returns `true` when any pixel was switched from on to off.
    pub(crate) fn draw_sprite(&mut self, x: usize, y: usize, rows: &[u8]) -> bool {
        let mut is_erased = false;

        for (r, row) in rows.iter().enumerate() {
            // Each row is 8 bits representing the 8 pixels of the sprite.
            for c in 0..8 {
                if (row >> (7 - c)) & 1 == 0 {
                    // Zero bits leave the display untouched.
                    continue;
                }

                let d = ((x + c) & DISPLAY_WIDTH_MASK) + ((y + r) & DISPLAY_HEIGHT_MASK) * DISPLAY_WIDTH;

                // XOR erases a pixel when both the old and new values are both 1.
                is_erased |= self.pixels[d];
                self.pixels[d] ^= true;
            }
        }

        is_erased
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in self.pixels.chunks(DISPLAY_WIDTH) {
            for px in row {
                f.write_char(if *px { '#' } else { '.' })?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

struct Shared {
    display: Mutex<Frame>,
    /// Register dump of the most recently executed instruction.
    debug_text: Mutex<String>,
    /// Keyboard input state, written by the input adapter.
    keys: [AtomicBool; KEY_COUNT as usize],
    clock_hz: AtomicU64,
    max_clock_hz: u64,
    running: AtomicBool,
    reset: AtomicBool,
    single_step: AtomicBool,
    step_request: AtomicBool,
    buzzing: AtomicBool,
    halted: AtomicBool,
    instruction_count: AtomicU64,
    /// Validated program image waiting to be installed by the driver.
    pending_program: Mutex<Option<Vec<u8>>>,
}

/// Thread-safe handle to a running machine.
///
/// Cloning the handle is cheap, and every clone observes the same machine.
#[derive(Clone)]
pub struct Chip8Handle {
    shared: Arc<Shared>,
}

impl fmt::Debug for Chip8Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chip8Handle")
            .field("clock_rate", &self.clock_rate())
            .field("running", &self.is_running())
            .field("single_step", &self.single_step())
            .finish()
    }
}

/// Recover the guard of a poisoned lock.
///
/// The guarded data are plain buffers, which stay usable after a panic
/// on another thread.
#[inline]
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Chip8Handle {
    pub(crate) fn new(conf: &Chip8Conf) -> Self {
        Self {
            shared: Arc::new(Shared {
                display: Mutex::new(Frame::new()),
                debug_text: Mutex::new(String::new()),
                keys: Default::default(),
                clock_hz: AtomicU64::new(conf.clock_frequency().0),
                max_clock_hz: conf.max_clock_frequency().0,
                running: AtomicBool::new(true),
                reset: AtomicBool::new(false),
                single_step: AtomicBool::new(false),
                step_request: AtomicBool::new(false),
                buzzing: AtomicBool::new(false),
                halted: AtomicBool::new(false),
                instruction_count: AtomicU64::new(0),
                pending_program: Mutex::new(None),
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Display

    /// Copy of the current display buffer.
    pub fn frame(&self) -> Frame {
        lock(&self.shared.display).clone()
    }

    /// Copy of the register dump taken before the last executed instruction.
    pub fn debug_text(&self) -> String {
        lock(&self.shared.debug_text).clone()
    }

    pub(crate) fn with_display<R>(&self, f: impl FnOnce(&mut Frame) -> R) -> R {
        f(&mut lock(&self.shared.display))
    }

    pub(crate) fn with_debug_text<R>(&self, f: impl FnOnce(&mut String) -> R) -> R {
        f(&mut lock(&self.shared.debug_text))
    }

    // ------------------------------------------------------------------------
    // Keyboard

    /// Sets the keyboard key input state.
    pub fn set_key(&self, key: KeyCode, pressed: bool) {
        self.shared.keys[key.as_u8() as usize].store(pressed, Ordering::Relaxed);
    }

    pub fn key(&self, key: KeyCode) -> bool {
        self.key_state(key.as_u8())
    }

    /// State of the key with the given value. Values outside the keypad
    /// are never pressed.
    pub fn key_state(&self, key_id: u8) -> bool {
        self.shared
            .keys
            .get(key_id as usize)
            .map(|key| key.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Snapshot of all key states, ordered by key value.
    pub fn keys(&self) -> [bool; KEY_COUNT as usize] {
        let mut keys = [false; KEY_COUNT as usize];
        for (state, key) in keys.iter_mut().zip(self.shared.keys.iter()) {
            *state = key.load(Ordering::Relaxed);
        }
        keys
    }

    /// Retrieve the value of the first key that is pressed down.
    pub fn first_key(&self) -> Option<u8> {
        (0..KEY_COUNT).find(|k| self.key_state(*k))
    }

    /// Clear the keyboard input state, setting all keys to up.
    pub fn clear_keys(&self) {
        for key in self.shared.keys.iter() {
            key.store(false, Ordering::Relaxed);
        }
    }

    // ------------------------------------------------------------------------
    // Live controls

    /// Ask the driver to re-initialise the machine at the start of its next tick.
    pub fn request_reset(&self) {
        self.shared.reset.store(true, Ordering::Relaxed);
    }

    pub(crate) fn take_reset(&self) -> bool {
        self.shared.reset.swap(false, Ordering::Relaxed)
    }

    /// Read and validate a program, then queue it for the driver.
    ///
    /// Errors are reported here, and nothing is queued when the program
    /// can't be read in full or does not fit in memory. The machine is
    /// re-initialised before the program is installed.
    pub fn load_program(&self, reader: impl Read) -> Chip8Result<()> {
        let program = read_program(reader)?;
        log::info!("queued program of {} bytes", program.len());
        *lock(&self.shared.pending_program) = Some(program);
        Ok(())
    }

    pub(crate) fn take_program(&self) -> Option<Vec<u8>> {
        lock(&self.shared.pending_program).take()
    }

    pub fn clock_rate(&self) -> Hz {
        Hz(self.shared.clock_hz.load(Ordering::Relaxed))
    }

    /// Change the instruction rate. Takes effect on the next tick.
    ///
    /// The rate is clamped between 1 Hz and the configured maximum,
    /// and the effective rate is returned.
    pub fn set_clock_rate(&self, rate: Hz) -> Hz {
        let hz = rate.0.clamp(MIN_CLOCK_FREQUENCY, self.shared.max_clock_hz);
        self.shared.clock_hz.store(hz, Ordering::Relaxed);
        log::debug!("clock rate set to {hz} Hz");
        Hz(hz)
    }

    pub fn max_clock_rate(&self) -> Hz {
        Hz(self.shared.max_clock_hz)
    }

    pub fn single_step(&self) -> bool {
        self.shared.single_step.load(Ordering::Relaxed)
    }

    /// Enable or disable single-step mode.
    pub fn set_single_step(&self, enabled: bool) {
        self.shared.single_step.store(enabled, Ordering::Relaxed);
        log::debug!("single step {}", if enabled { "enabled" } else { "disabled" });
    }

    /// Allow exactly one instruction to run while in single-step mode.
    pub fn request_step(&self) {
        self.shared.step_request.store(true, Ordering::Relaxed);
    }

    pub(crate) fn take_step_request(&self) -> bool {
        self.shared.step_request.swap(false, Ordering::Relaxed)
    }

    /// Ask the driver loop to stop at the top of its next tick.
    pub fn shutdown(&self) {
        self.shared.running.store(false, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------------
    // Status

    /// Whether the sound tone should currently be playing.
    pub fn is_buzzing(&self) -> bool {
        self.shared.buzzing.load(Ordering::Relaxed)
    }

    pub(crate) fn set_buzzing(&self, state: bool) {
        self.shared.buzzing.store(state, Ordering::Relaxed);
    }

    /// Whether the program ran into an empty instruction word.
    ///
    /// Cleared when a program is installed or an instruction executes.
    pub fn is_halted(&self) -> bool {
        self.shared.halted.load(Ordering::Relaxed)
    }

    pub(crate) fn set_halted(&self, halted: bool) {
        self.shared.halted.store(halted, Ordering::Relaxed);
    }

    /// Total number of instructions executed by the driver.
    pub fn instruction_count(&self) -> u64 {
        self.shared.instruction_count.load(Ordering::Relaxed)
    }

    pub(crate) fn add_instructions(&self, count: u64) {
        self.shared
            .instruction_count
            .fetch_add(count, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_sprite_wraps_both_axes() {
        let mut frame = Frame::new();

        // Bottom right corner, 2x2 block of pixels.
        let erased = frame.draw_sprite(63, 31, &[0b1100_0000, 0b1100_0000]);
        assert!(!erased);
        assert!(frame.pixel(63, 31));
        assert!(frame.pixel(0, 31));
        assert!(frame.pixel(63, 0));
        assert!(frame.pixel(0, 0));
        assert_eq!(frame.lit_count(), 4);
    }

    #[test]
    fn test_sprite_collision() {
        let mut frame = Frame::new();
        assert!(!frame.draw_sprite(0, 0, &[0b1000_0000]));
        assert!(frame.draw_sprite(0, 0, &[0b1000_0000]));
        assert_eq!(frame.lit_count(), 0);
    }

    #[test]
    fn test_frame_text() {
        let mut frame = Frame::new();
        frame.draw_sprite(1, 0, &[0b1000_0000]);
        let text = frame.to_string();
        let first = text.lines().next().unwrap();
        assert_eq!(first.len(), DISPLAY_WIDTH);
        assert!(first.starts_with(".#.."));
        assert_eq!(text.lines().count(), DISPLAY_HEIGHT);
    }

    #[test]
    fn test_key_state() {
        let handle = Chip8Handle::new(&Chip8Conf::default());

        handle.set_key(KeyCode::Key0, true);
        assert!(handle.key(KeyCode::Key0));
        assert!(!handle.key(KeyCode::Key1));
        assert_eq!(handle.first_key(), Some(0));

        handle.set_key(KeyCode::Key7, true);
        handle.set_key(KeyCode::Key0, false);
        assert_eq!(handle.first_key(), Some(7));
        assert!(!handle.key_state(200));

        handle.clear_keys();
        assert_eq!(handle.first_key(), None);
    }

    #[test]
    fn test_clock_rate_bounds() {
        let handle = Chip8Handle::new(&Chip8Conf {
            max_clock_frequency: Some(Hz(1000)),
            ..Default::default()
        });

        assert_eq!(handle.clock_rate(), Hz(DEFAULT_CLOCK_FREQUENCY));
        assert_eq!(handle.set_clock_rate(Hz(0)), Hz(1));
        assert_eq!(handle.set_clock_rate(Hz(700)), Hz(700));
        assert_eq!(handle.set_clock_rate(Hz(100_000)), Hz(1000));
        assert_eq!(handle.clock_rate(), Hz(1000));
    }

    #[test]
    fn test_oversized_program_not_queued() {
        let handle = Chip8Handle::new(&Chip8Conf::default());
        let program = vec![0x12; PROGRAM_CAPACITY + 1];

        assert!(handle.load_program(program.as_slice()).is_err());
        assert!(handle.take_program().is_none());

        handle.load_program(&[0x00, 0xE0][..]).unwrap();
        assert_eq!(handle.take_program(), Some(vec![0x00, 0xE0]));
        assert!(handle.take_program().is_none());
    }

    #[test]
    fn test_pulse_flags_clear() {
        let handle = Chip8Handle::new(&Chip8Conf::default());
        handle.request_reset();
        assert!(handle.take_reset());
        assert!(!handle.take_reset());

        handle.request_step();
        assert!(handle.take_step_request());
        assert!(!handle.take_step_request());
    }
}
