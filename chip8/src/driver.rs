//! Execution driver.
//!
//! Paces the virtual machine against wall-clock time, and applies the
//! requests front-ends post through the [`Chip8Handle`].
use std::{
    fmt,
    io::Read,
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{
    clock::Clock,
    constants::*,
    cpu::MachineStatus,
    devices::{Buzzer, SilentBuzzer},
    error::{Chip8Error, Chip8Result},
    shared::Chip8Handle,
    vm::{check_program_size, read_program, Chip8Conf, Chip8Vm, Flow},
};

/// Outcome of a single driver tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    /// Number of instructions executed during the tick.
    pub executed: u64,
    /// The budget was cut short by an empty instruction word.
    pub halted: bool,
    /// The machine is stalled waiting for a key press.
    pub waiting: bool,
}

pub struct Chip8Driver {
    vm: Chip8Vm,
    handle: Chip8Handle,
    clock: Clock,
    buzzer: Box<dyn Buzzer + Send>,
    /// Image of the last loaded program, re-installed on reset.
    program: Vec<u8>,
}

impl fmt::Debug for Chip8Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chip8Driver")
            .field("handle", &self.handle)
            .field("program_len", &self.program.len())
            .finish_non_exhaustive()
    }
}

impl Chip8Driver {
    pub fn new(conf: Chip8Conf) -> Self {
        let vm = Chip8Vm::new(conf);
        let handle = vm.handle();
        Self {
            vm,
            handle,
            clock: Clock::new(),
            buzzer: Box::new(SilentBuzzer),
            program: Vec::new(),
        }
    }

    /// Replace the audio device notified of buzzer edges.
    pub fn with_buzzer(mut self, buzzer: impl Buzzer + Send + 'static) -> Self {
        self.buzzer = Box::new(buzzer);
        self
    }

    pub fn handle(&self) -> Chip8Handle {
        self.handle.clone()
    }

    pub fn vm(&self) -> &Chip8Vm {
        &self.vm
    }

    /// Read a program and install it immediately.
    ///
    /// On failure the machine and the previously loaded program are kept.
    pub fn load_program(&mut self, reader: impl Read) -> Chip8Result<()> {
        let program = read_program(reader)?;
        self.install(program)
    }

    pub fn load_bytecode(&mut self, bytecode: &[u8]) -> Chip8Result<()> {
        self.install(bytecode.to_vec())
    }

    /// Re-initialise the machine and load the given program image.
    fn install(&mut self, program: Vec<u8>) -> Chip8Result<()> {
        if !check_program_size(&program) {
            return Err(Chip8Error::LargeProgram {
                size: program.len(),
            });
        }

        // The fresh timers of the re-initialised machine know nothing
        // of the tone, so it must be stopped here.
        if self.handle.is_buzzing() {
            log::debug!("buzzer off");
            self.handle.set_buzzing(false);
            self.buzzer.buzz(false);
        }

        self.vm.reset();
        self.vm.load_bytecode(&program)?;
        self.program = program;
        self.handle.set_halted(false);
        self.clock.reset();
        Ok(())
    }

    /// Re-initialise the machine, restarting the last loaded program.
    fn restart(&mut self) {
        log::info!("reset machine");
        let program = std::mem::take(&mut self.program);
        if let Err(err) = self.install(program) {
            log::error!("failed to reload program after reset: {err}");
        }
    }

    /// Run one iteration of the driver loop, without the pacing sleep.
    ///
    /// The instructions owed are `floor(elapsed * clock rate)`, capped at
    /// one second worth. Time beyond that, from a stalled thread or a
    /// suspended process, is dropped rather than caught up on.
    pub fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();

        if let Some(program) = self.handle.take_program() {
            if let Err(err) = self.install(program) {
                log::error!("failed to install program: {err}");
            }
        }

        if self.handle.take_reset() {
            self.restart();
        }

        // Timers are evaluated once per tick, regardless of how many
        // instructions are executed.
        if let Some(state) = self.vm.update_timers() {
            log::debug!("buzzer {}", if state { "on" } else { "off" });
            self.handle.set_buzzing(state);
            self.buzzer.buzz(state);
        }

        let mut budget = self.clock.budget(self.handle.clock_rate());

        if self.handle.single_step() {
            if self.handle.take_step_request() {
                budget = 1;
            } else {
                // Time spent idle is not owed to the program.
                self.clock.reset();
                budget = 0;
            }
        }

        for _ in 0..budget {
            let flow = self.vm.step();
            if flow == Flow::Halt {
                report.halted = true;
                break;
            }

            report.executed += 1;
            self.clock.reset();

            if self.vm.status() == MachineStatus::WaitingForKey {
                break;
            }
        }

        if report.halted {
            self.handle.set_halted(true);
        } else if report.executed > 0 {
            self.handle.set_halted(false);
        }

        report.waiting = self.vm.status() == MachineStatus::WaitingForKey;
        self.handle.add_instructions(report.executed);

        report
    }

    /// Tick until shutdown is requested through a handle.
    pub fn run(&mut self) {
        log::info!("driver started at {}", self.handle.clock_rate());

        while self.handle.is_running() {
            thread::sleep(Duration::from_millis(TICK_SLICE_MILLIS));
            self.tick();
        }

        if self.handle.is_buzzing() {
            self.handle.set_buzzing(false);
            self.buzzer.buzz(false);
        }

        log::info!(
            "driver stopped after {} instructions",
            self.handle.instruction_count()
        );
    }

    /// Move the driver onto its own thread.
    ///
    /// The driver is handed back when the thread joins, after shutdown.
    pub fn spawn(mut self) -> Chip8Result<JoinHandle<Self>> {
        let join = thread::Builder::new()
            .name("chip8-driver".to_string())
            .spawn(move || {
                self.run();
                self
            })?;
        Ok(join)
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{Arc, Mutex},
        time::Instant,
    };

    use super::*;
    use crate::{devices::KeyCode, vm::Hz};

    /// Backdate the clock so a full second of instructions is owed.
    fn overdue(driver: &mut Chip8Driver) {
        driver.clock = Clock::new_at(Instant::now() - Duration::from_secs(2));
    }

    fn driver_with(bytecode: &[u8]) -> Chip8Driver {
        let mut driver = Chip8Driver::new(Chip8Conf {
            clock_frequency: Some(Hz(100)),
            ..Default::default()
        });
        driver.load_bytecode(bytecode).unwrap();
        driver
    }

    #[test]
    fn test_budget_capped_at_rate() {
        // ADD v0, 1 ; JP 0x200
        let mut driver = driver_with(&[0x70, 0x01, 0x12, 0x00]);
        overdue(&mut driver);

        let report = driver.tick();
        assert_eq!(report.executed, 100);
        assert!(!report.halted);
        assert_eq!(driver.handle().instruction_count(), 100);
        assert_eq!(driver.vm().cpu().registers()[0], 50);
    }

    #[test]
    fn test_halt_stops_budget() {
        let mut driver = driver_with(&[0x60, 0x07, 0x61, 0x08]);
        overdue(&mut driver);

        let report = driver.tick();
        assert_eq!(report.executed, 2);
        assert!(report.halted);
        assert!(driver.handle().is_halted());
        assert_eq!(driver.vm().cpu().pc(), 0x204);

        // Stays halted while nothing is owed.
        assert_eq!(driver.tick().executed, 0);
        assert!(driver.handle().is_halted());

        driver.handle().request_reset();
        driver.tick();
        assert!(!driver.handle().is_halted());
    }

    #[test]
    fn test_key_wait_stops_budget() {
        // LD v1, K ; JP self
        let mut driver = driver_with(&[0xF1, 0x0A, 0x12, 0x02]);
        overdue(&mut driver);

        let report = driver.tick();
        assert_eq!(report.executed, 1);
        assert!(report.waiting);

        driver.handle().set_key(KeyCode::Key4, true);
        overdue(&mut driver);
        let report = driver.tick();
        assert!(!report.waiting);
        assert_eq!(driver.vm().cpu().registers()[1], 4);
    }

    #[test]
    fn test_single_step() {
        let mut driver = driver_with(&[0x70, 0x01, 0x12, 0x00]);
        let handle = driver.handle();
        handle.set_single_step(true);

        overdue(&mut driver);
        assert_eq!(driver.tick().executed, 0);

        // Idle time is dropped, and a step runs even with no time owed.
        handle.request_step();
        assert_eq!(driver.tick().executed, 1);
        assert_eq!(driver.tick().executed, 0);

        handle.set_single_step(false);
        assert!(driver.tick().executed <= 1);
    }

    #[test]
    fn test_reset_restarts_program() {
        let mut driver = driver_with(&[0x70, 0x01, 0x12, 0x00]);
        overdue(&mut driver);
        driver.tick();
        assert_ne!(driver.vm().cpu().registers()[0], 0);

        driver.handle().request_reset();
        driver.tick();
        assert_eq!(driver.vm().cpu().registers()[0], 0);
        assert_eq!(driver.vm().cpu().pc(), 0x200);
        assert_eq!(driver.vm().cpu().ram()[0x200], 0x70);
    }

    #[test]
    fn test_pending_program_installed() {
        let mut driver = driver_with(&[0x70, 0x01, 0x12, 0x00]);
        overdue(&mut driver);
        driver.tick();

        driver.handle().load_program(&[0x6A, 0x2B][..]).unwrap();
        // Installing restarts the clock, so nothing is owed yet.
        assert_eq!(driver.tick().executed, 0);

        overdue(&mut driver);
        let report = driver.tick();
        assert!(report.halted);
        assert_eq!(driver.vm().cpu().registers()[0], 0);
        assert_eq!(driver.vm().cpu().registers()[0xA], 0x2B);
        assert_eq!(driver.vm().cpu().ram()[0x202], 0);
    }

    #[test]
    fn test_failed_load_keeps_program() {
        let mut driver = driver_with(&[0x6A, 0x2B]);
        let program = vec![0x12; PROGRAM_CAPACITY + 1];
        assert!(driver.load_program(program.as_slice()).is_err());
        assert!(driver.load_bytecode(&program).is_err());
        assert_eq!(driver.vm().cpu().ram()[0x200], 0x6A);
        assert_eq!(driver.program, vec![0x6A, 0x2B]);
    }

    #[test]
    fn test_buzzer_edges() {
        let edges = Arc::new(Mutex::new(vec![]));
        let sink = edges.clone();

        // LD v0, 2 ; LD ST, v0 ; JP self
        let mut driver = Chip8Driver::new(Chip8Conf::default())
            .with_buzzer(move |state: bool| sink.lock().unwrap().push(state));
        driver.load_bytecode(&[0x60, 0x02, 0xF0, 0x18, 0x12, 0x04]).unwrap();
        overdue(&mut driver);

        // Timers are evaluated before the instructions run.
        driver.tick();
        assert!(edges.lock().unwrap().is_empty());
        driver.tick();
        assert_eq!(*edges.lock().unwrap(), vec![true]);
        assert!(driver.handle().is_buzzing());

        // Two 60 Hz ticks later the tone stops.
        thread::sleep(Duration::from_millis(50));
        driver.tick();
        assert_eq!(*edges.lock().unwrap(), vec![true, false]);
        assert!(!driver.handle().is_buzzing());
    }

    #[test]
    fn test_spawn_shutdown() {
        let driver = driver_with(&[0x12, 0x00]);
        let handle = driver.handle();
        let join = driver.spawn().unwrap();

        thread::sleep(Duration::from_millis(50));
        handle.shutdown();
        let driver = join.join().unwrap();
        assert!(!driver.handle().is_running());
    }

    #[test]
    fn test_reset_stops_tone() {
        let edges = Arc::new(Mutex::new(vec![]));
        let sink = edges.clone();

        // LD v0, 0xFF ; LD ST, v0 ; JP self
        let mut driver = Chip8Driver::new(Chip8Conf {
            clock_frequency: Some(Hz(100)),
            ..Default::default()
        })
        .with_buzzer(move |state: bool| sink.lock().unwrap().push(state));
        driver.load_bytecode(&[0x60, 0xFF, 0xF0, 0x18, 0x12, 0x04]).unwrap();
        overdue(&mut driver);

        driver.tick();
        driver.tick();
        assert_eq!(*edges.lock().unwrap(), vec![true]);
        assert!(driver.handle().is_buzzing());

        driver.handle().request_reset();
        driver.tick();
        driver.tick();
        assert_eq!(*edges.lock().unwrap(), vec![true, false]);
        assert!(!driver.handle().is_buzzing());
        assert_eq!(driver.vm().cpu().sound_timer(), 0);

        // Loading a new program stops the tone as well.
        overdue(&mut driver);
        driver.tick();
        driver.tick();
        assert_eq!(*edges.lock().unwrap(), vec![true, false, true]);
        driver.handle().load_program(&[0x12, 0x00][..]).unwrap();
        driver.tick();
        assert_eq!(*edges.lock().unwrap(), vec![true, false, true, false]);
        assert!(!driver.handle().is_buzzing());
    }

    #[test]
    fn test_clock_rate_change_between_ticks() {
        // ADD v0, 1 ; JP 0x200
        let mut driver = driver_with(&[0x70, 0x01, 0x12, 0x00]);
        let handle = driver.handle();

        overdue(&mut driver);
        assert_eq!(driver.tick().executed, 100);
        assert_eq!(driver.vm().cpu().registers()[0], 50);

        assert_eq!(handle.set_clock_rate(Hz(10)), Hz(10));
        overdue(&mut driver);
        assert_eq!(driver.tick().executed, 10);

        // The machine carried on where it was.
        assert_eq!(driver.vm().cpu().registers()[0], 55);
        assert_eq!(handle.instruction_count(), 110);

        handle.set_clock_rate(Hz(300));
        overdue(&mut driver);
        assert_eq!(driver.tick().executed, 300);
        assert_eq!(driver.vm().cpu().registers()[0], 205);
    }
}
