// Logical module sections
//
// A well-formed module lays its instructions out in 11 ordered sections.
// Module-scope opcodes map to a section through one lookup table; everything
// inside an OpFunction .. OpFunctionEnd range belongs to the section of its
// enclosing function (declaration if it has no body, definition otherwise).

use spirv::Op;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Section {
    Capability,
    Extension,
    ExtInstImport,
    MemoryModel,
    EntryPoint,
    ExecutionMode,
    Debug,
    Annotations,
    Types,
    FuncDeclarations,
    FuncDefinitions,
}

impl Section {
    pub const ALL: [Section; 11] = [
        Section::Capability,
        Section::Extension,
        Section::ExtInstImport,
        Section::MemoryModel,
        Section::EntryPoint,
        Section::ExecutionMode,
        Section::Debug,
        Section::Annotations,
        Section::Types,
        Section::FuncDeclarations,
        Section::FuncDefinitions,
    ];
}

const SECTION_TABLE: &[(Op, Section)] = &[
    (Op::Capability, Section::Capability),
    (Op::Extension, Section::Extension),
    (Op::ExtInstImport, Section::ExtInstImport),
    (Op::MemoryModel, Section::MemoryModel),
    (Op::EntryPoint, Section::EntryPoint),
    (Op::ExecutionMode, Section::ExecutionMode),
    (Op::ExecutionModeId, Section::ExecutionMode),
    (Op::String, Section::Debug),
    (Op::SourceExtension, Section::Debug),
    (Op::Source, Section::Debug),
    (Op::SourceContinued, Section::Debug),
    (Op::Name, Section::Debug),
    (Op::MemberName, Section::Debug),
    (Op::ModuleProcessed, Section::Debug),
    (Op::Decorate, Section::Annotations),
    (Op::MemberDecorate, Section::Annotations),
    (Op::DecorationGroup, Section::Annotations),
    (Op::GroupDecorate, Section::Annotations),
    (Op::GroupMemberDecorate, Section::Annotations),
    (Op::DecorateId, Section::Annotations),
    (Op::DecorateString, Section::Annotations),
    (Op::MemberDecorateString, Section::Annotations),
    (Op::TypeVoid, Section::Types),
    (Op::TypeBool, Section::Types),
    (Op::TypeInt, Section::Types),
    (Op::TypeFloat, Section::Types),
    (Op::TypeVector, Section::Types),
    (Op::TypeMatrix, Section::Types),
    (Op::TypeImage, Section::Types),
    (Op::TypeSampler, Section::Types),
    (Op::TypeSampledImage, Section::Types),
    (Op::TypeArray, Section::Types),
    (Op::TypeRuntimeArray, Section::Types),
    (Op::TypeStruct, Section::Types),
    (Op::TypeOpaque, Section::Types),
    (Op::TypePointer, Section::Types),
    (Op::TypeFunction, Section::Types),
    (Op::TypeEvent, Section::Types),
    (Op::TypeDeviceEvent, Section::Types),
    (Op::TypeReserveId, Section::Types),
    (Op::TypeQueue, Section::Types),
    (Op::TypePipe, Section::Types),
    (Op::TypeForwardPointer, Section::Types),
    (Op::ConstantTrue, Section::Types),
    (Op::ConstantFalse, Section::Types),
    (Op::Constant, Section::Types),
    (Op::ConstantComposite, Section::Types),
    (Op::ConstantSampler, Section::Types),
    (Op::ConstantNull, Section::Types),
    (Op::SpecConstantTrue, Section::Types),
    (Op::SpecConstantFalse, Section::Types),
    (Op::SpecConstant, Section::Types),
    (Op::SpecConstantComposite, Section::Types),
    (Op::SpecConstantOp, Section::Types),
    (Op::Variable, Section::Types),
    (Op::Undef, Section::Types),
];

/// Section of a module-scope opcode, `None` for opcodes that may appear
/// anywhere (Nop, Line, NoLine, ExtInst) or only inside functions.
pub fn section_of(opcode: u16) -> Option<Section> {
    SECTION_TABLE
        .iter()
        .find(|(op, _)| *op as u16 == opcode)
        .map(|(_, section)| *section)
}

/// Classify every instruction of a stream, given its opcodes in order.
///
/// Opcodes without a table entry outside of functions inherit the section
/// of the previous instruction.
pub fn classify(opcodes: &[u16]) -> Vec<Section> {
    let mut out = Vec::with_capacity(opcodes.len());
    let mut current = Section::Capability;
    let mut i = 0;
    while i < opcodes.len() {
        if opcodes[i] == Op::Function as u16 {
            let end = opcodes[i..]
                .iter()
                .position(|op| *op == Op::FunctionEnd as u16)
                .map_or(opcodes.len(), |p| i + p + 1);
            let has_body = opcodes[i..end].iter().any(|op| *op == Op::Label as u16);
            current = if has_body {
                Section::FuncDefinitions
            } else {
                Section::FuncDeclarations
            };
            out.extend(std::iter::repeat(current).take(end - i));
            i = end;
            continue;
        }
        if let Some(section) = section_of(opcodes[i]) {
            current = section;
        }
        out.push(current);
        i += 1;
    }
    out
}

/// Index of the first instruction whose section is at or after `section`.
pub fn section_start(sections: &[Section], section: Section) -> usize {
    sections.partition_point(|s| *s < section)
}

/// Index one past the last instruction of `section`.
pub fn section_end(sections: &[Section], section: Section) -> usize {
    sections.partition_point(|s| *s <= section)
}
