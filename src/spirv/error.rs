// Decoding errors for raw SPIR-V word streams

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpirvError {
    #[error("module is {0} words long, shorter than the 5-word header")]
    TruncatedHeader(usize),

    #[error("bad magic number {0:#010x}")]
    BadMagic(u32),

    #[error("literal string in instruction at word {offset} is unterminated or not UTF-8")]
    UnterminatedString { offset: usize },

    #[error("instruction at word {offset} has a zero length field")]
    ZeroLength { offset: usize },

    #[error("instruction at word {offset} (opcode {opcode}) claims {length} words but only {available} remain")]
    Overrun {
        offset: usize,
        opcode: u16,
        length: usize,
        available: usize,
    },
}
