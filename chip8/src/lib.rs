mod bytecode;
mod clock;
pub mod constants;
mod cpu;
mod devices;
mod driver;
mod error;
mod op;
mod shared;
mod timer;
mod vm;

pub use self::{
    error::{Chip8Error, Chip8Result},
    vm::Hz,
};

pub mod prelude {
    pub use super::{
        cpu::{Chip8Cpu, MachineStatus},
        devices::{Buzzer, InvalidKeyCode, KeyCode, SilentBuzzer},
        driver::{Chip8Driver, TickReport},
        error::{Chip8Error, Chip8Result},
        op::Op,
        shared::{Chip8Handle, Frame},
        timer::{CountdownTimer, Timers},
        vm::{Chip8Conf, Chip8Vm, Flow, Hz, ShiftQuirk},
    };
}
