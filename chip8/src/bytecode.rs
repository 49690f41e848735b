//! Helpers for extracting data from opcodes.
use crate::constants::{Address, MEM_MASK};

/// Read the big-endian instruction word at the cursor.
///
/// Both bytes are wrapped into memory, so a cursor at the very
/// last byte reads its second half from address zero.
#[inline(always)]
pub fn fetch(ram: &[u8], cursor: usize) -> u16 {
    let a = ram[cursor & MEM_MASK] as u16;
    let b = ram[(cursor + 1) & MEM_MASK] as u16;
    (a << 8) | b
}

/// Extract opcode identity from the upper nibble.
#[inline(always)]
pub fn op_code(word: u16) -> u8 {
    ((word & 0xF000) >> 12) as u8
}

/// Extract operand NNN, the lower 12 bits.
#[inline(always)]
pub fn op_nnn(word: u16) -> Address {
    word & 0x0FFF
}

/// Extract operand NN, the lower byte.
#[inline(always)]
pub fn op_nn(word: u16) -> u8 {
    (word & 0x00FF) as u8
}

/// Extract operand VX, the destination register index.
#[inline(always)]
pub fn op_x(word: u16) -> u8 {
    ((word & 0x0F00) >> 8) as u8
}

/// Extract operand VY, the source register index.
#[inline(always)]
pub fn op_y(word: u16) -> u8 {
    ((word & 0x00F0) >> 4) as u8
}

/// Extract operand N, the lowest nibble.
#[inline(always)]
pub fn op_n(word: u16) -> u8 {
    (word & 0x000F) as u8
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fields() {
        let word = 0xD12F;
        assert_eq!(op_code(word), 0xD);
        assert_eq!(op_x(word), 0x1);
        assert_eq!(op_y(word), 0x2);
        assert_eq!(op_n(word), 0xF);
        assert_eq!(op_nn(word), 0x2F);
        assert_eq!(op_nnn(word), 0x12F);
    }

    #[test]
    fn test_fetch_big_endian() {
        let mut ram = vec![0; 0x1000];
        ram[0x200] = 0x12;
        ram[0x201] = 0x34;
        assert_eq!(fetch(&ram, 0x200), 0x1234);

        // Second byte wraps to the start of memory.
        ram[0xFFF] = 0xAB;
        ram[0x000] = 0xCD;
        assert_eq!(fetch(&ram, 0xFFF), 0xABCD);
    }
}
