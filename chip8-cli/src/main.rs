//! Entrypoint for CLI
use std::{
    env,
    error::Error,
    fs,
    io::{self, Write},
    thread,
    time::Instant,
};

use chip8::{constants::*, prelude::*};
use log::{error, info};

use crate::{error::AppError, settings::Settings};

mod error;
mod settings;

static USAGE: &str = r#"
usage: chip8 CMD ROM [ARG]

commands:
    run     Run the target ROM file, printing the display to the terminal
    dump    Step the target ROM, then print the machine state

examples:
    chip8 run maze.rom
    chip8 run breakout.rom settings.yaml
    chip8 dump maze.rom 1000
"#;

/// Steps executed by `dump` when no count is given.
const DEFAULT_DUMP_STEPS: usize = 1000;

/// Rings the terminal bell when the tone starts.
struct TerminalBell;

impl Buzzer for TerminalBell {
    fn buzz(&mut self, state: bool) {
        if state {
            let mut stdout = io::stdout();
            let _ = stdout.write_all(b"\x07").and_then(|_| stdout.flush());
        }
    }
}

fn run_rom(filepath: &str, settings: Settings) -> Result<(), AppError> {
    info!("load rom: {filepath}");

    let file = fs::File::open(filepath)?;
    let mut driver = Chip8Driver::new(settings.machine.clone()).with_buzzer(TerminalBell);
    driver.load_program(file)?;

    let handle = driver.handle();
    let join = driver.spawn()?;

    let interval = settings.refresh_interval();
    let deadline = settings.run_for().map(|run_for| Instant::now() + run_for);
    let mut last_frame = Frame::new();

    while handle.is_running() {
        thread::sleep(interval);

        // The renderer only ever sees whole frames.
        let frame = handle.frame();
        if frame != last_frame {
            print!("\x1B[2J\x1B[H{frame}");
            io::stdout().flush()?;
            last_frame = frame;
        }

        let timed_out = deadline.map(|d| Instant::now() >= d).unwrap_or(false);
        if timed_out || (deadline.is_none() && handle.is_halted()) {
            handle.shutdown();
        }
    }

    match join.join() {
        Ok(driver) => {
            println!("{}", handle.debug_text());
            info!(
                "executed {} instructions, stopped at {:04X}",
                handle.instruction_count(),
                driver.vm().cpu().pc()
            );
        }
        Err(_) => error!("driver thread panicked"),
    }

    Ok(())
}

fn dump_rom(filepath: &str, steps: usize) -> Result<(), AppError> {
    let bytecode = fs::read(filepath)?;

    let mut vm = Chip8Vm::new(Chip8Conf::default());
    vm.load_bytecode(bytecode.as_slice())?;

    println!("{}", vm.dump_ram(bytecode.len())?);

    let start = Instant::now();
    let flow = vm.run_steps(steps);
    let end = Instant::now();

    println!(
        "time taken: {}ms, last flow: {flow:?}",
        end.duration_since(start).as_nanos() as f64 / 1000000.0
    ); // to millis
    println!("{}", vm.dump_registers()?);
    println!("{}", vm.dump_display()?);

    let keys = vm.dump_keys()?;
    if !keys.is_empty() {
        println!("{keys}");
    }

    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    simple_logger::SimpleLogger::new().env().init()?;

    let result = match parse_args() {
        Some(Cmd::Run { filepath, settings }) => {
            let settings = match settings {
                Some(path) => Settings::from_file(&path)?,
                None => Settings::default(),
            };
            run_rom(&filepath, settings)
        }
        Some(Cmd::Dump { filepath, steps }) => dump_rom(&filepath, steps),
        None => {
            print_usage();
            // FreeBSD EX_USAGE (64)
            std::process::exit(64)
        }
    };

    if let Err(err) = result {
        error!("{err}");
        std::process::exit(1);
    }

    Ok(())
}

fn parse_args() -> Option<Cmd> {
    let mut args = env::args().skip(1);
    match args.next() {
        Some(cmd) => {
            // don't format me T.T
            match cmd.as_str() {
                "run" => Some(Cmd::Run {
                    filepath: args.next()?,
                    settings: args.next(),
                }),
                "dump" => Some(Cmd::Dump {
                    filepath: args.next()?,
                    steps: match args.next() {
                        Some(arg) => arg.parse().ok()?,
                        None => DEFAULT_DUMP_STEPS,
                    },
                }),
                _ => None,
            }
        }
        None => None,
    }
}

fn print_usage() {
    println!("Chip8 v{}", env!("CARGO_PKG_VERSION"));
    println!("{USAGE}");
    println!("programs up to {PROGRAM_CAPACITY} bytes are loaded at 0x{MEM_START:03X}");
}

enum Cmd {
    /// Run file
    Run {
        filepath: String,
        settings: Option<String>,
    },
    /// Step file and print state
    Dump { filepath: String, steps: usize },
}
