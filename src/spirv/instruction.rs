// SPIR-V instruction record
//
// Instructions are kept in structured form: an opcode plus its operand words.
// The packed `(length << 16) | opcode` header only exists at the encode/decode
// boundary, so nothing else in the crate touches raw word layout.

use spirv::Op;

use super::error::SpirvError;

/// Header word of a single-word `OpNop`.
pub const NOP_WORD: u32 = 1 << 16;

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Instruction {
    pub opcode: u16,
    pub operands: Vec<u32>,
}

impl Instruction {
    pub fn new(op: Op, operands: Vec<u32>) -> Self {
        Self {
            opcode: op as u16,
            operands,
        }
    }

    pub fn from_slice(op: Op, operands: &[u32]) -> Self {
        Self::new(op, operands.to_vec())
    }

    /// Placeholder covering `words` words.
    ///
    /// Encodes as `words` consecutive single-word Nops, so replacing an
    /// instruction with a span of the same size keeps the module length intact.
    pub fn nop_span(words: usize) -> Self {
        assert!(words > 0, "a Nop span covers at least one word");
        Self {
            opcode: Op::Nop as u16,
            operands: vec![0; words - 1],
        }
    }

    pub fn is(&self, op: Op) -> bool {
        self.opcode == op as u16
    }

    pub fn is_nop(&self) -> bool {
        self.opcode == Op::Nop as u16
    }

    /// Length field of the encoded instruction: `1 + operand count`.
    pub fn word_count(&self) -> usize {
        1 + self.operands.len()
    }

    pub fn header_word(&self) -> u32 {
        let len = self.word_count();
        assert!(len <= u16::MAX as usize, "instruction too long to encode: {len} words");
        ((len as u32) << 16) | self.opcode as u32
    }

    pub fn encode_into(&self, out: &mut Vec<u32>) {
        if self.is_nop() {
            out.extend(std::iter::repeat(NOP_WORD).take(self.word_count()));
            return;
        }
        out.push(self.header_word());
        out.extend_from_slice(&self.operands);
    }

    /// Decode the instruction starting at `words[offset]`.
    pub fn decode(words: &[u32], offset: usize) -> Result<Self, SpirvError> {
        let (opcode, len) = split_header(words[offset]);
        if len == 0 {
            return Err(SpirvError::ZeroLength { offset });
        }
        let available = words.len() - offset;
        if len > available {
            return Err(SpirvError::Overrun {
                offset,
                opcode,
                length: len,
                available,
            });
        }
        Ok(Self {
            opcode,
            operands: words[offset + 1..offset + len].to_vec(),
        })
    }

    pub fn result_type(&self) -> Option<u32> {
        let (has_type, _) = result_layout(self.opcode);
        has_type.then(|| self.operands.first().copied()).flatten()
    }

    pub fn result_id(&self) -> Option<u32> {
        let (has_type, has_result) = result_layout(self.opcode);
        if !has_result {
            return None;
        }
        self.operands.get(usize::from(has_type)).copied()
    }

    /// Literal string starting at operand `start`, and the index of the
    /// first operand after it.
    pub fn string_at(&self, start: usize) -> Option<(String, usize)> {
        let (s, used) = decode_string(self.operands.get(start..)?)?;
        Some((s, start + used))
    }
}

/// Operand index of the literal string carried by `opcode`, if it has one.
pub fn string_operand(opcode: u16) -> Option<usize> {
    const AT_0: &[Op] = &[Op::Extension, Op::SourceExtension, Op::ModuleProcessed];
    const AT_1: &[Op] = &[Op::ExtInstImport, Op::String, Op::Name];
    const AT_2: &[Op] = &[Op::EntryPoint, Op::MemberName];
    let is = |ops: &[Op]| ops.iter().any(|op| *op as u16 == opcode);
    if is(AT_0) {
        Some(0)
    } else if is(AT_1) {
        Some(1)
    } else if is(AT_2) {
        Some(2)
    } else {
        None
    }
}

/// Split a header word into `(opcode, word count)`.
pub fn split_header(word: u32) -> (u16, usize) {
    ((word & 0xffff) as u16, (word >> 16) as usize)
}

/// Encode a nul-terminated, zero-padded UTF-8 literal.
pub fn encode_string(s: &str) -> Vec<u32> {
    let bytes = s.as_bytes();
    let mut words = Vec::with_capacity(bytes.len() / 4 + 1);
    for chunk in bytes.chunks(4) {
        let mut buf = [0u8; 4];
        buf[..chunk.len()].copy_from_slice(chunk);
        words.push(u32::from_le_bytes(buf));
    }
    if bytes.len() % 4 == 0 {
        words.push(0);
    }
    words
}

/// Decode a literal string, returning it with the number of words it spans.
pub fn decode_string(words: &[u32]) -> Option<(String, usize)> {
    let mut bytes = Vec::new();
    for (i, w) in words.iter().enumerate() {
        for b in w.to_le_bytes() {
            if b == 0 {
                return String::from_utf8(bytes).ok().map(|s| (s, i + 1));
            }
            bytes.push(b);
        }
    }
    None
}

const RESULT_ONLY: &[Op] = &[
    Op::String,
    Op::ExtInstImport,
    Op::DecorationGroup,
    Op::Label,
    Op::TypeVoid,
    Op::TypeBool,
    Op::TypeInt,
    Op::TypeFloat,
    Op::TypeVector,
    Op::TypeMatrix,
    Op::TypeImage,
    Op::TypeSampler,
    Op::TypeSampledImage,
    Op::TypeArray,
    Op::TypeRuntimeArray,
    Op::TypeStruct,
    Op::TypeOpaque,
    Op::TypePointer,
    Op::TypeFunction,
    Op::TypeEvent,
    Op::TypeDeviceEvent,
    Op::TypeReserveId,
    Op::TypeQueue,
    Op::TypePipe,
];

const NO_RESULT: &[Op] = &[
    Op::Nop,
    Op::SourceContinued,
    Op::Source,
    Op::SourceExtension,
    Op::Name,
    Op::MemberName,
    Op::Line,
    Op::NoLine,
    Op::ModuleProcessed,
    Op::Extension,
    Op::MemoryModel,
    Op::EntryPoint,
    Op::ExecutionMode,
    Op::ExecutionModeId,
    Op::Capability,
    Op::TypeForwardPointer,
    Op::Decorate,
    Op::MemberDecorate,
    Op::GroupDecorate,
    Op::GroupMemberDecorate,
    Op::DecorateId,
    Op::DecorateString,
    Op::MemberDecorateString,
    Op::Store,
    Op::CopyMemory,
    Op::CopyMemorySized,
    Op::FunctionEnd,
    Op::Return,
    Op::ReturnValue,
    Op::Branch,
    Op::BranchConditional,
    Op::Switch,
    Op::Kill,
    Op::TerminateInvocation,
    Op::Unreachable,
    Op::SelectionMerge,
    Op::LoopMerge,
    Op::ControlBarrier,
    Op::MemoryBarrier,
    Op::AtomicStore,
    Op::EmitVertex,
    Op::EndPrimitive,
    Op::ImageWrite,
    Op::SetMeshOutputsEXT,
    Op::EmitMeshTasksEXT,
];

/// `(has result type, has result id)` for an opcode.
///
/// Opcodes not listed in either table are treated as value-producing
/// (`<type> <id> ...`), which covers the arithmetic, memory and composite
/// families.
pub fn result_layout(opcode: u16) -> (bool, bool) {
    if NO_RESULT.iter().any(|op| *op as u16 == opcode) {
        (false, false)
    } else if RESULT_ONLY.iter().any(|op| *op as u16 == opcode) {
        (false, true)
    } else {
        (true, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_literals_are_nul_terminated_and_padded() {
        assert_eq!(encode_string("main"), vec![0x6e69_616d, 0]);
        assert_eq!(encode_string("ab").len(), 1);
        let words = encode_string("SPV_EXT_mesh_shader");
        assert_eq!(decode_string(&words), Some(("SPV_EXT_mesh_shader".to_string(), words.len())));
    }

    #[test]
    fn nop_span_keeps_word_count() {
        let store = Instruction::new(Op::Store, vec![10, 11]);
        let nop = Instruction::nop_span(store.word_count());
        let mut out = Vec::new();
        nop.encode_into(&mut out);
        assert_eq!(out, vec![NOP_WORD; 3]);
    }

    #[test]
    fn decode_rejects_overrun() {
        let words = [(4 << 16) | Op::Store as u32, 1];
        assert!(matches!(
            Instruction::decode(&words, 0),
            Err(SpirvError::Overrun { length: 4, available: 2, .. })
        ));
        assert_eq!(
            Instruction::decode(&[Op::Store as u32], 0),
            Err(SpirvError::ZeroLength { offset: 0 })
        );
    }

    #[test]
    fn result_ids_follow_layout() {
        let var = Instruction::new(Op::Variable, vec![7, 8, 3]);
        assert_eq!(var.result_type(), Some(7));
        assert_eq!(var.result_id(), Some(8));

        let ty = Instruction::new(Op::TypeInt, vec![5, 32, 0]);
        assert_eq!(ty.result_type(), None);
        assert_eq!(ty.result_id(), Some(5));

        let store = Instruction::new(Op::Store, vec![1, 2]);
        assert_eq!(store.result_id(), None);
    }
}
