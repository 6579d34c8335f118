// SPIR-V instruction editor
//
// Bytecode is a validated read-only view of a word stream. MutableBytecode
// is an owned, editable module built from one, with section-aware insertion
// and deduplicating declaration helpers. Emitter threads a write position
// and the id counter through code generation.

pub mod bytecode;
pub mod emit;
pub mod error;
pub mod instruction;
pub mod mutable;
pub mod section;

pub use bytecode::{Bytecode, Header, OpCode, HEADER_WORDS, MAGIC};
pub use emit::Emitter;
pub use error::SpirvError;
pub use instruction::{decode_string, encode_string, Instruction};
pub use mutable::{Cursor, MutableBytecode, TraverseOrder, TypeNode};
pub use section::Section;

/// Assemble a module from a header and an instruction list.
pub fn assemble(header: Header, instructions: &[Instruction]) -> Vec<u32> {
    let mut out = header.words().to_vec();
    for inst in instructions {
        inst.encode_into(&mut out);
    }
    out
}

/// SPIR-V version word for `major.minor`.
pub const fn version(major: u8, minor: u8) -> u32 {
    ((major as u32) << 16) | ((minor as u32) << 8)
}
