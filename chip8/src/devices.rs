//! IO device interface
use crate::constants::*;

/// Hook for the external audio device.
///
/// The machine only reports edges: the tone starts when the sound timer
/// becomes non-zero and stops when it runs out.
pub trait Buzzer {
    /// Turn the sound buzzer on or off.
    fn buzz(&mut self, state: bool);
}

/// Buzzer that ignores all edges.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentBuzzer;

impl Buzzer for SilentBuzzer {
    fn buzz(&mut self, _state: bool) {}
}

impl<F> Buzzer for F
where
    F: FnMut(bool),
{
    fn buzz(&mut self, state: bool) {
        self(state)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeyCode {
    Key0 = 0,
    Key1,
    Key2,
    Key3,
    Key4,
    Key5,
    Key6,
    Key7,
    Key8,
    Key9,
    KeyA,
    KeyB,
    KeyC,
    KeyD,
    KeyE,
    KeyF = 0xF,
}

impl KeyCode {
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// All keys, ordered by their value.
    pub fn all() -> impl Iterator<Item = KeyCode> {
        (0..KEY_COUNT).filter_map(|key_id| KeyCode::try_from(key_id).ok())
    }
}

impl std::fmt::Display for KeyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let key_id = self.as_u8();
        write!(f, "k{key_id:x}")
    }
}

impl From<KeyCode> for u8 {
    fn from(keycode: KeyCode) -> Self {
        keycode.as_u8()
    }
}

impl TryFrom<u8> for KeyCode {
    type Error = InvalidKeyCode;

    fn try_from(key_id: u8) -> Result<Self, Self::Error> {
        match key_id {
            0 => Ok(Self::Key0),
            1 => Ok(Self::Key1),
            2 => Ok(Self::Key2),
            3 => Ok(Self::Key3),
            4 => Ok(Self::Key4),
            5 => Ok(Self::Key5),
            6 => Ok(Self::Key6),
            7 => Ok(Self::Key7),
            8 => Ok(Self::Key8),
            9 => Ok(Self::Key9),
            10 => Ok(Self::KeyA),
            11 => Ok(Self::KeyB),
            12 => Ok(Self::KeyC),
            13 => Ok(Self::KeyD),
            14 => Ok(Self::KeyE),
            15 => Ok(Self::KeyF),
            _ => Err(InvalidKeyCode),
        }
    }
}

#[derive(Debug)]
pub struct InvalidKeyCode;

impl std::error::Error for InvalidKeyCode {}

impl std::fmt::Display for InvalidKeyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "keycode must be in range 0 <= keycode < 16")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_keycode_conversion() {
        assert_eq!(KeyCode::try_from(0xA).unwrap(), KeyCode::KeyA);
        assert_eq!(u8::from(KeyCode::KeyF), 15);
        assert!(KeyCode::try_from(16).is_err());
        assert_eq!(KeyCode::all().count(), 16);
        assert_eq!(KeyCode::Key7.to_string(), "k7");
    }

    #[test]
    fn test_closure_buzzer() {
        let mut edges = vec![];
        {
            let mut buzzer = |state: bool| edges.push(state);
            buzzer.buzz(true);
            buzzer.buzz(false);
        }
        assert_eq!(edges, vec![true, false]);
    }
}
