// Read-only SPIR-V decoder
//
// Validates the header and instruction framing once up front, after which
// iteration is infallible.

use super::error::SpirvError;
use super::instruction::{decode_string, result_layout, split_header, string_operand, Instruction};
use super::section::{self, Section};

pub const MAGIC: u32 = spirv::MAGIC_NUMBER;
pub const HEADER_WORDS: usize = 5;

/// The five fixed header words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: u32,
    pub version: u32,
    pub generator: u32,
    /// Next free id.
    pub bound: u32,
    pub schema: u32,
}

impl Header {
    pub fn new(version: u32, generator: u32) -> Self {
        Self {
            magic: MAGIC,
            version,
            generator,
            bound: 1,
            schema: 0,
        }
    }

    pub fn words(&self) -> [u32; HEADER_WORDS] {
        [self.magic, self.version, self.generator, self.bound, self.schema]
    }

    /// `(major, minor)` of the version word.
    pub fn version_pair(&self) -> (u8, u8) {
        ((self.version >> 16) as u8, (self.version >> 8) as u8)
    }
}

/// A borrowed view of one instruction inside the word stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpCode<'a> {
    /// Word offset of the instruction header.
    pub offset: usize,
    pub opcode: u16,
    pub operands: &'a [u32],
}

impl<'a> OpCode<'a> {
    pub fn is(&self, op: spirv::Op) -> bool {
        self.opcode == op as u16
    }

    pub fn word_count(&self) -> usize {
        1 + self.operands.len()
    }

    pub fn result_id(&self) -> Option<u32> {
        let (has_type, has_result) = result_layout(self.opcode);
        if !has_result {
            return None;
        }
        self.operands.get(usize::from(has_type)).copied()
    }

    pub fn to_instruction(&self) -> Instruction {
        Instruction {
            opcode: self.opcode,
            operands: self.operands.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Bytecode<'a> {
    words: &'a [u32],
}

impl<'a> Bytecode<'a> {
    pub fn new(words: &'a [u32]) -> Result<Self, SpirvError> {
        if words.len() < HEADER_WORDS {
            return Err(SpirvError::TruncatedHeader(words.len()));
        }
        if words[0] != MAGIC {
            return Err(SpirvError::BadMagic(words[0]));
        }

        let mut offset = HEADER_WORDS;
        while offset < words.len() {
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
            if let Some(start) = string_operand(opcode) {
                let operands = &words[offset + 1..offset + len];
                if operands.get(start..).and_then(decode_string).is_none() {
                    return Err(SpirvError::UnterminatedString { offset });
                }
            }
            offset += len;
        }

        Ok(Self { words })
    }

    pub fn header(&self) -> Header {
        Header {
            magic: self.words[0],
            version: self.words[1],
            generator: self.words[2],
            bound: self.words[3],
            schema: self.words[4],
        }
    }

    pub fn bound(&self) -> u32 {
        self.words[3]
    }

    pub fn words(&self) -> &'a [u32] {
        self.words
    }

    pub fn iter(&self) -> Iter<'a> {
        Iter {
            words: self.words,
            offset: HEADER_WORDS,
        }
    }

    pub fn instructions(&self) -> Vec<Instruction> {
        self.iter().map(|op| op.to_instruction()).collect()
    }

    /// Section of every instruction, in stream order.
    pub fn sections(&self) -> Vec<Section> {
        let opcodes: Vec<u16> = self.iter().map(|op| op.opcode).collect();
        section::classify(&opcodes)
    }

    /// Instruction index where `section` begins.
    pub fn find_section(&self, s: Section) -> usize {
        section::section_start(&self.sections(), s)
    }

    /// Instruction index one past the end of `section`.
    pub fn find_section_end(&self, s: Section) -> usize {
        section::section_end(&self.sections(), s)
    }

    /// The instruction defining `id`, if any.
    pub fn find_def(&self, id: u32) -> Option<OpCode<'a>> {
        self.iter().find(|op| op.result_id() == Some(id))
    }
}

impl<'a> IntoIterator for &Bytecode<'a> {
    type Item = OpCode<'a>;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}

pub struct Iter<'a> {
    words: &'a [u32],
    offset: usize,
}

impl<'a> Iterator for Iter<'a> {
    type Item = OpCode<'a>;

    fn next(&mut self) -> Option<OpCode<'a>> {
        if self.offset >= self.words.len() {
            return None;
        }
        let (opcode, len) = split_header(self.words[self.offset]);
        let op = OpCode {
            offset: self.offset,
            opcode,
            operands: &self.words[self.offset + 1..self.offset + len],
        };
        self.offset += len;
        Some(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spirv::Op;

    fn module(body: &[u32]) -> Vec<u32> {
        let mut words = Header::new(0x0001_0400, 0).words().to_vec();
        words[3] = 10;
        words.extend_from_slice(body);
        words
    }

    #[test]
    fn decodes_instruction_stream() {
        let words = module(&[
            (2 << 16) | Op::Capability as u32,
            1,
            (3 << 16) | Op::TypeFloat as u32,
        ]);
        // TypeFloat claims 3 words but only its header is present.
        assert!(matches!(Bytecode::new(&words), Err(SpirvError::Overrun { .. })));

        let words = module(&[
            (2 << 16) | Op::Capability as u32,
            1,
            (2 << 16) | Op::TypeVoid as u32,
            2,
        ]);
        let code = Bytecode::new(&words).unwrap();
        let ops: Vec<_> = code.iter().collect();
        assert_eq!(ops.len(), 2);
        assert!(ops[1].is(Op::TypeVoid));
        assert_eq!(ops[1].offset, HEADER_WORDS + 2);
        assert_eq!(code.find_def(2).map(|op| op.offset), Some(HEADER_WORDS + 2));
        assert_eq!(code.find_section(Section::Types), 1);
        assert_eq!(code.bound(), 10);
    }

    #[test]
    fn rejects_bad_header() {
        assert_eq!(Bytecode::new(&[MAGIC, 0]).unwrap_err(), SpirvError::TruncatedHeader(2));
        assert_eq!(
            Bytecode::new(&[0xdead_beef, 0, 0, 1, 0]).unwrap_err(),
            SpirvError::BadMagic(0xdead_beef)
        );
    }

    #[test]
    fn rejects_unterminated_strings() {
        // OpName %1 "abcd" with the padding word missing.
        let words = module(&[(3 << 16) | Op::Name as u32, 1, u32::from_le_bytes(*b"abcd")]);
        assert_eq!(
            Bytecode::new(&words).unwrap_err(),
            SpirvError::UnterminatedString { offset: HEADER_WORDS }
        );

        let words = module(&[(4 << 16) | Op::Name as u32, 1, u32::from_le_bytes(*b"abcd"), 0]);
        assert!(Bytecode::new(&words).is_ok());
    }
}
