//! Result and errors.
use std::fmt::{self, Display, Formatter};

use crate::constants::PROGRAM_CAPACITY;

pub type Chip8Result<T> = std::result::Result<T, Chip8Error>;

#[derive(Debug)]
pub enum Chip8Error {
    /// Program source could not be read in full.
    Io(std::io::Error),
    /// Attempt to load a bytecode program that can't fit in memory.
    LargeProgram { size: usize },
    Fmt(fmt::Error),
}

impl Display for Chip8Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "failed to read program: {}", err),
            Self::LargeProgram { size } => write!(
                f,
                "program too large for VM memory: {size} bytes, capacity is {PROGRAM_CAPACITY}"
            ),
            Self::Fmt(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for Chip8Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Fmt(err) => Some(err),
            Self::LargeProgram { .. } => None,
        }
    }
}

impl From<std::io::Error> for Chip8Error {
    fn from(err: std::io::Error) -> Self {
        Chip8Error::Io(err)
    }
}

impl From<fmt::Error> for Chip8Error {
    fn from(err: fmt::Error) -> Self {
        Chip8Error::Fmt(err)
    }
}
