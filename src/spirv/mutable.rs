// Mutable SPIR-V editor
//
// Instructions live in an arena of structured records. Cursors are indices
// into that arena stamped with the generation they were created in; every
// edit that moves instructions (insert, remove_nops) bumps the generation,
// and using a cursor from an older generation panics.
//
// In-place edits (set_to_nop, append, get_mut) never move records, so they
// leave outstanding cursors valid.

use std::collections::HashMap;

use spirv::{Decoration, Op, StorageClass};

use super::bytecode::{Bytecode, Header, HEADER_WORDS};
use super::instruction::{encode_string, Instruction};
use super::section::{self, Section};

/// Position of an instruction inside a [`MutableBytecode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    index: usize,
    generation: u64,
}

impl Cursor {
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Which nodes of a type tree `traverse_type` reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraverseOrder {
    /// Every node, parents before children.
    PreOrder,
    /// Every node, children before parents.
    PostOrder,
    /// Scalar leaves only.
    Leaves,
}

/// A node reached by `traverse_type`.
#[derive(Debug, Clone, Copy)]
pub struct TypeNode<'a> {
    /// Literal access-chain indices from the root type to this node.
    pub chain: &'a [u32],
    pub type_id: u32,
}

impl TypeNode<'_> {
    pub fn depth(&self) -> usize {
        self.chain.len()
    }
}

#[derive(Debug, Clone)]
pub struct MutableBytecode {
    header: Header,
    code: Vec<Instruction>,
    generation: u64,
}

impl MutableBytecode {
    /// Seed an editable copy of `bytecode`.
    pub fn new(bytecode: &Bytecode<'_>) -> Self {
        Self {
            header: bytecode.header(),
            code: bytecode.instructions(),
            generation: 0,
        }
    }

    /// An empty module with bound 1.
    pub fn empty(version: u32, generator: u32) -> Self {
        Self {
            header: Header::new(version, generator),
            code: Vec::new(),
            generation: 0,
        }
    }

    pub fn header(&self) -> Header {
        self.header
    }

    pub fn bound(&self) -> u32 {
        self.header.bound
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.code
    }

    /// Header plus the length of every instruction.
    pub fn total_words(&self) -> usize {
        HEADER_WORDS + self.code.iter().map(Instruction::word_count).sum::<usize>()
    }

    /// Word offset the instruction at `index` would have once encoded.
    pub fn word_offset(&self, index: usize) -> usize {
        HEADER_WORDS + self.code[..index].iter().map(Instruction::word_count).sum::<usize>()
    }

    pub fn to_words(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.total_words());
        out.extend_from_slice(&self.header.words());
        for inst in &self.code {
            inst.encode_into(&mut out);
        }
        out
    }

    pub fn into_words(self) -> Vec<u32> {
        self.to_words()
    }

    // -------------------------------------------------------------------------
    // Cursors
    // -------------------------------------------------------------------------

    fn cursor(&self, index: usize) -> Cursor {
        Cursor {
            index,
            generation: self.generation,
        }
    }

    fn check(&self, at: Cursor) {
        assert_eq!(
            at.generation, self.generation,
            "stale cursor at instruction {} used after a structural edit",
            at.index
        );
        assert!(at.index <= self.code.len(), "cursor {} past end of module", at.index);
    }

    pub fn begin(&self) -> Cursor {
        self.cursor(0)
    }

    pub fn end(&self) -> Cursor {
        self.cursor(self.code.len())
    }

    pub fn is_end(&self, at: Cursor) -> bool {
        self.check(at);
        at.index == self.code.len()
    }

    pub fn next(&self, at: Cursor) -> Cursor {
        self.check(at);
        self.cursor((at.index + 1).min(self.code.len()))
    }

    pub fn at(&self, index: usize) -> Cursor {
        assert!(index <= self.code.len(), "index {index} past end of module");
        self.cursor(index)
    }

    pub fn get(&self, at: Cursor) -> &Instruction {
        self.check(at);
        &self.code[at.index]
    }

    pub fn get_mut(&mut self, at: Cursor) -> &mut Instruction {
        self.check(at);
        &mut self.code[at.index]
    }

    /// First instruction matching `pred`.
    pub fn find(&self, mut pred: impl FnMut(&Instruction) -> bool) -> Option<Cursor> {
        self.code.iter().position(|inst| pred(inst)).map(|i| self.cursor(i))
    }

    /// Instruction defining `id`.
    pub fn find_def(&self, id: u32) -> Option<&Instruction> {
        self.code.iter().find(|inst| inst.result_id() == Some(id))
    }

    /// Map of result id to instruction index, valid until the next structural edit.
    pub fn def_index(&self) -> HashMap<u32, usize> {
        self.code
            .iter()
            .enumerate()
            .filter_map(|(i, inst)| inst.result_id().map(|id| (id, i)))
            .collect()
    }

    // -------------------------------------------------------------------------
    // Structural edits
    // -------------------------------------------------------------------------

    /// Splice a new instruction before `at`, returning a cursor just past it.
    pub fn insert(&mut self, at: Cursor, op: Op, operands: &[u32]) -> Cursor {
        self.insert_instruction(at, Instruction::from_slice(op, operands))
    }

    pub fn insert_instruction(&mut self, at: Cursor, inst: Instruction) -> Cursor {
        self.check(at);
        self.code.insert(at.index, inst);
        self.generation += 1;
        self.cursor(at.index + 1)
    }

    /// Overwrite the instruction at `at` with Nops of the same total length.
    pub fn set_to_nop(&mut self, at: Cursor) {
        let len = self.get(at).word_count();
        self.code[at.index] = Instruction::nop_span(len);
    }

    /// Add one trailing operand to the instruction at `at`.
    pub fn append(&mut self, at: Cursor, word: u32) {
        self.get_mut(at).operands.push(word);
    }

    /// Delete every Nop in one compacting sweep.
    pub fn remove_nops(&mut self) {
        self.code.retain(|inst| !inst.is_nop());
        self.generation += 1;
    }

    /// Allocate one fresh id.
    pub fn fetch_add_bound(&mut self) -> u32 {
        self.fetch_add_bound_n(1)
    }

    /// Allocate `n` consecutive fresh ids, returning the first.
    pub fn fetch_add_bound_n(&mut self, n: u32) -> u32 {
        let first = self.header.bound;
        self.header.bound = first
            .checked_add(n)
            .expect("id bound overflowed u32");
        first
    }

    // -------------------------------------------------------------------------
    // Sections
    // -------------------------------------------------------------------------

    pub fn sections(&self) -> Vec<Section> {
        let opcodes: Vec<u16> = self.code.iter().map(|inst| inst.opcode).collect();
        section::classify(&opcodes)
    }

    /// Cursor at the first instruction of section `s` (or where it would start).
    pub fn find_section(&self, s: Section) -> Cursor {
        self.cursor(section::section_start(&self.sections(), s))
    }

    /// Cursor one past the last instruction of section `s`.
    pub fn find_section_end(&self, s: Section) -> Cursor {
        self.cursor(section::section_end(&self.sections(), s))
    }

    // -------------------------------------------------------------------------
    // Declarations
    // -------------------------------------------------------------------------

    /// Find a type declaration `op %id rest...` in the Types section.
    fn find_type(&self, op: Op, rest: &[u32]) -> Option<u32> {
        let start = self.find_section(Section::Types).index;
        let end = self.find_section_end(Section::Types).index;
        self.code[start..end]
            .iter()
            .find(|inst| inst.is(op) && inst.operands.get(1..) == Some(rest))
            .map(|inst| inst.operands[0])
    }

    fn declare_type(&mut self, op: Op, rest: &[u32]) -> u32 {
        if let Some(id) = self.find_type(op, rest) {
            return id;
        }
        self.declare_type_unique(op, rest)
    }

    fn declare_type_unique(&mut self, op: Op, rest: &[u32]) -> u32 {
        let id = self.fetch_add_bound();
        let mut operands = Vec::with_capacity(rest.len() + 1);
        operands.push(id);
        operands.extend_from_slice(rest);
        let end = self.find_section_end(Section::Types);
        self.insert(end, op, &operands);
        id
    }

    pub fn op_type_void(&mut self) -> u32 {
        self.declare_type(Op::TypeVoid, &[])
    }

    pub fn op_type_bool(&mut self) -> u32 {
        self.declare_type(Op::TypeBool, &[])
    }

    pub fn op_type_int(&mut self, width: u32, signed: bool) -> u32 {
        self.declare_type(Op::TypeInt, &[width, u32::from(signed)])
    }

    pub fn op_type_float(&mut self, width: u32) -> u32 {
        self.declare_type(Op::TypeFloat, &[width])
    }

    pub fn op_type_vector(&mut self, component: u32, count: u32) -> u32 {
        self.declare_type(Op::TypeVector, &[component, count])
    }

    pub fn op_type_matrix(&mut self, column: u32, count: u32) -> u32 {
        self.declare_type(Op::TypeMatrix, &[column, count])
    }

    /// `length` is the id of a constant.
    pub fn op_type_array(&mut self, element: u32, length: u32) -> u32 {
        self.declare_type(Op::TypeArray, &[element, length])
    }

    pub fn op_type_runtime_array(&mut self, element: u32) -> u32 {
        self.declare_type(Op::TypeRuntimeArray, &[element])
    }

    pub fn op_type_pointer(&mut self, storage: StorageClass, pointee: u32) -> u32 {
        self.declare_type(Op::TypePointer, &[storage as u32, pointee])
    }

    pub fn op_type_struct(&mut self, members: &[u32]) -> u32 {
        self.declare_type(Op::TypeStruct, members)
    }

    /// A struct that is never merged with an existing one, for blocks that
    /// carry their own layout decorations.
    pub fn op_type_struct_unique(&mut self, members: &[u32]) -> u32 {
        self.declare_type_unique(Op::TypeStruct, members)
    }

    pub fn op_type_function(&mut self, ret: u32, params: &[u32]) -> u32 {
        let mut rest = Vec::with_capacity(params.len() + 1);
        rest.push(ret);
        rest.extend_from_slice(params);
        self.declare_type(Op::TypeFunction, &rest)
    }

    /// Scalar 32-bit constant of type `ty`.
    pub fn op_constant(&mut self, ty: u32, value: u32) -> u32 {
        let start = self.find_section(Section::Types).index;
        let end = self.find_section_end(Section::Types).index;
        let existing = self.code[start..end].iter().find(|inst| {
            inst.is(Op::Constant) && inst.operands[0] == ty && inst.operands[2..] == [value]
        });
        if let Some(inst) = existing {
            return inst.operands[1];
        }
        let id = self.fetch_add_bound();
        let end = self.find_section_end(Section::Types);
        self.insert(end, Op::Constant, &[ty, id, value]);
        id
    }

    /// Module-scope variable. Every call declares a distinct variable.
    pub fn op_variable(&mut self, pointer_type: u32, storage: StorageClass) -> u32 {
        let id = self.fetch_add_bound();
        let end = self.find_section_end(Section::Types);
        self.insert(end, Op::Variable, &[pointer_type, id, storage as u32]);
        id
    }

    pub fn op_capability(&mut self, capability: spirv::Capability) {
        let cap = capability as u32;
        if self.find(|inst| inst.is(Op::Capability) && inst.operands[0] == cap).is_none() {
            let at = self.find_section(Section::Capability);
            self.insert(at, Op::Capability, &[cap]);
        }
    }

    /// `OpDecorate`, skipped if the same decoration is already present.
    pub fn op_decorate(&mut self, target: u32, decoration: Decoration, literals: &[u32]) {
        let mut operands = vec![target, decoration as u32];
        operands.extend_from_slice(literals);
        self.insert_annotation(Op::Decorate, operands);
    }

    pub fn op_member_decorate(&mut self, target: u32, member: u32, decoration: Decoration, literals: &[u32]) {
        let mut operands = vec![target, member, decoration as u32];
        operands.extend_from_slice(literals);
        self.insert_annotation(Op::MemberDecorate, operands);
    }

    /// Insert a raw `OpDecorate`/`OpMemberDecorate` unless the target already
    /// carries that decoration.
    pub fn insert_annotation(&mut self, op: Op, operands: Vec<u32>) {
        let key = if op == Op::Decorate { 2 } else { 3 };
        let exists = self.code.iter().any(|inst| {
            inst.is(op) && inst.operands.len() >= key && inst.operands[..key] == operands[..key]
        });
        if !exists {
            let end = self.find_section_end(Section::Annotations);
            self.insert(end, op, &operands);
        }
    }

    /// `OpName`, placed ahead of any `OpModuleProcessed`.
    pub fn op_name(&mut self, target: u32, name: &str) {
        let mut operands = vec![target];
        operands.extend(encode_string(name));
        let at = self
            .find(|inst| inst.is(Op::ModuleProcessed))
            .unwrap_or_else(|| self.find_section_end(Section::Debug));
        self.insert(at, Op::Name, &operands);
    }

    pub fn op_member_name(&mut self, target: u32, member: u32, name: &str) {
        let mut operands = vec![target, member];
        operands.extend(encode_string(name));
        let at = self
            .find(|inst| inst.is(Op::ModuleProcessed))
            .unwrap_or_else(|| self.find_section_end(Section::Debug));
        self.insert(at, Op::MemberName, &operands);
    }

    // -------------------------------------------------------------------------
    // Type queries
    // -------------------------------------------------------------------------

    /// Void, Bool, Int and Float: the scalar leaves of every type tree.
    pub fn is_basic_type_decl(opcode: u16) -> bool {
        [Op::TypeVoid, Op::TypeBool, Op::TypeInt, Op::TypeFloat]
            .iter()
            .any(|op| *op as u16 == opcode)
    }

    /// Value of a 32-bit `OpConstant`. Spec constants and anything else
    /// yield `None`.
    pub fn constant_value(&self, id: u32) -> Option<u32> {
        let def = self.find_def(id)?;
        (def.is(Op::Constant) && def.operands.len() == 3).then(|| def.operands[2])
    }

    /// Walk the shape of type `id`, reporting nodes to `visitor` according
    /// to `order`. Pointers are dereferenced once, at the root.
    ///
    /// # Panics
    /// On shapes with no static layout (runtime arrays, nested pointers,
    /// opaque types) or arrays whose length is not a plain constant.
    pub fn traverse_type<F>(&self, id: u32, order: TraverseOrder, mut visitor: F)
    where
        F: FnMut(TypeNode<'_>),
    {
        let mut chain = Vec::new();
        self.traverse_node(id, order, &mut chain, true, &mut visitor);
    }

    fn traverse_node(
        &self,
        id: u32,
        order: TraverseOrder,
        chain: &mut Vec<u32>,
        root: bool,
        visitor: &mut dyn FnMut(TypeNode<'_>),
    ) {
        let decl = self
            .find_def(id)
            .unwrap_or_else(|| panic!("type %{id} has no declaration"));

        if Self::is_basic_type_decl(decl.opcode) {
            visitor(TypeNode { chain: chain.as_slice(), type_id: id });
            return;
        }
        if decl.is(Op::TypePointer) {
            assert!(root, "pointer %{id} nested inside an aggregate has no static shape");
            self.traverse_node(decl.operands[2], order, chain, false, visitor);
            return;
        }

        if order == TraverseOrder::PreOrder {
            visitor(TypeNode { chain: chain.as_slice(), type_id: id });
        }

        let mut descend = |index: u32, child: u32, chain: &mut Vec<u32>| {
            chain.push(index);
            self.traverse_node(child, order, chain, false, visitor);
            chain.pop();
        };

        match decl.opcode {
            op if op == Op::TypeVector as u16 || op == Op::TypeMatrix as u16 => {
                for i in 0..decl.operands[2] {
                    descend(i, decl.operands[1], chain);
                }
            }
            op if op == Op::TypeArray as u16 => {
                let len = self.constant_value(decl.operands[2]).unwrap_or_else(|| {
                    panic!("array %{id} length %{} is not a constant", decl.operands[2])
                });
                for i in 0..len {
                    descend(i, decl.operands[1], chain);
                }
            }
            op if op == Op::TypeStruct as u16 => {
                for (i, member) in decl.operands[1..].iter().enumerate() {
                    descend(i as u32, *member, chain);
                }
            }
            op if op == Op::TypeRuntimeArray as u16 => {
                panic!("runtime array %{id} has no static shape")
            }
            other => panic!("type %{id} (opcode {other}) has no modeled shape"),
        }

        if order == TraverseOrder::PostOrder {
            visitor(TypeNode { chain: chain.as_slice(), type_id: id });
        }
    }

    /// Number of scalar leaves in type `id`.
    pub fn scalar_leaf_count(&self, id: u32) -> u32 {
        let mut count = 0;
        self.traverse_type(id, TraverseOrder::Leaves, |_| count += 1);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed() -> MutableBytecode {
        let mut code = MutableBytecode::empty(0x0001_0400, 0);
        let at = code.begin();
        let at = code.insert(at, Op::Capability, &[spirv::Capability::Shader as u32]);
        code.insert(at, Op::MemoryModel, &[0, 1]);
        code
    }

    #[test]
    fn declarations_are_deduplicated() {
        let mut code = seed();
        let uint = code.op_type_int(32, false);
        assert_eq!(code.op_type_int(32, false), uint);
        let int = code.op_type_int(32, true);
        assert_ne!(int, uint);

        let v4 = code.op_type_vector(uint, 4);
        assert_eq!(code.op_type_vector(uint, 4), v4);
        let c3 = code.op_constant(uint, 3);
        assert_eq!(code.op_constant(uint, 3), c3);
        assert_ne!(code.op_constant(int, 3), c3);

        let sa = code.op_type_struct(&[uint, v4]);
        assert_eq!(code.op_type_struct(&[uint, v4]), sa);
        assert_ne!(code.op_type_struct_unique(&[uint, v4]), sa);

        let ptr = code.op_type_pointer(StorageClass::Output, v4);
        assert_ne!(code.op_variable(ptr, StorageClass::Output), code.op_variable(ptr, StorageClass::Output));
        assert!(code.sections().windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn insert_invalidates_old_cursors() {
        let mut code = seed();
        let first = code.begin();
        let after = code.insert(first, Op::Capability, &[spirv::Capability::Int64 as u32]);
        assert_eq!(after.index(), 1);
        assert!(code.get(after).is(Op::Capability));
        let stale = std::panic::catch_unwind(move || {
            let _ = code.get(first);
        });
        assert!(stale.is_err());
    }

    #[test]
    fn nop_edits_keep_size_and_compact() {
        let mut code = seed();
        let uint = code.op_type_int(32, false);
        code.op_constant(uint, 7);
        let before = code.total_words();
        let at = code.find(|inst| inst.is(Op::Constant)).unwrap();
        code.set_to_nop(at);
        assert_eq!(code.total_words(), before);
        // Still valid: set_to_nop does not move instructions.
        assert!(code.get(at).is_nop());

        code.remove_nops();
        assert_eq!(code.total_words(), before - 4);
        let once = code.to_words();
        code.remove_nops();
        assert_eq!(code.to_words(), once);
    }

    #[test]
    fn append_grows_the_instruction() {
        let mut code = seed();
        let at = code.find(|inst| inst.is(Op::MemoryModel)).unwrap();
        code.append(at, 42);
        assert_eq!(code.get(at).operands, vec![0, 1, 42]);
        assert_eq!(code.get(at).word_count(), 4);
    }

    #[test]
    fn fresh_ids_are_sequential() {
        let mut code = seed();
        let a = code.fetch_add_bound();
        let b = code.fetch_add_bound_n(3);
        let c = code.fetch_add_bound();
        assert_eq!((a, b, c), (1, 2, 5));
        assert_eq!(code.bound(), 6);
    }

    #[test]
    fn traversal_builds_access_chains() {
        let mut code = seed();
        let float = code.op_type_float(32);
        let uint = code.op_type_int(32, false);
        let vec2 = code.op_type_vector(float, 2);
        let two = code.op_constant(uint, 2);
        let arr = code.op_type_array(uint, two);
        let st = code.op_type_struct(&[vec2, arr, float]);
        let ptr = code.op_type_pointer(StorageClass::Output, st);

        let mut leaves = Vec::new();
        code.traverse_type(ptr, TraverseOrder::Leaves, |node| {
            leaves.push((node.chain.to_vec(), node.type_id))
        });
        assert_eq!(
            leaves,
            vec![
                (vec![0, 0], float),
                (vec![0, 1], float),
                (vec![1, 0], uint),
                (vec![1, 1], uint),
                (vec![2], float),
            ]
        );
        assert_eq!(code.scalar_leaf_count(st), 5);

        let mut pre = Vec::new();
        code.traverse_type(st, TraverseOrder::PreOrder, |node| pre.push(node.type_id));
        assert_eq!(pre[..2], [st, vec2]);
        let mut post = Vec::new();
        code.traverse_type(st, TraverseOrder::PostOrder, |node| post.push(node.depth()));
        assert_eq!(post.last(), Some(&0));
    }

    #[test]
    #[should_panic(expected = "runtime array")]
    fn runtime_arrays_abort_traversal() {
        let mut code = seed();
        let uint = code.op_type_int(32, false);
        let rt = code.op_type_runtime_array(uint);
        code.traverse_type(rt, TraverseOrder::Leaves, |_| {});
    }
}
