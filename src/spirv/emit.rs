// Code emission context
//
// An Emitter owns the write position inside a function body. Each emitted
// instruction is spliced before the position, which then advances past it,
// so a sequence comes out in program order. The cursor is handed back by
// value when emission ends; the one held by the caller before emission
// started is stale by then.

use spirv::Op;

use super::mutable::{Cursor, MutableBytecode};

pub struct Emitter<'a> {
    code: &'a mut MutableBytecode,
    at: Cursor,
}

impl<'a> Emitter<'a> {
    pub fn new(code: &'a mut MutableBytecode, at: Cursor) -> Self {
        Self { code, at }
    }

    pub fn fresh_id(&mut self) -> u32 {
        self.code.fetch_add_bound()
    }

    /// Emit an instruction without a result.
    pub fn op(&mut self, op: Op, operands: &[u32]) {
        self.at = self.code.insert(self.at, op, operands);
    }

    /// Emit `op %ty %new operands...`, returning the new id.
    pub fn value(&mut self, op: Op, ty: u32, operands: &[u32]) -> u32 {
        let id = self.fresh_id();
        let mut words = Vec::with_capacity(operands.len() + 2);
        words.push(ty);
        words.push(id);
        words.extend_from_slice(operands);
        self.op(op, &words);
        id
    }

    /// Emit `OpLabel %id` for a previously reserved id.
    pub fn label(&mut self, id: u32) {
        self.op(Op::Label, &[id]);
    }

    pub fn load(&mut self, ty: u32, pointer: u32) -> u32 {
        self.value(Op::Load, ty, &[pointer])
    }

    pub fn store(&mut self, pointer: u32, object: u32) {
        self.op(Op::Store, &[pointer, object]);
    }

    pub fn access_chain(&mut self, ty: u32, base: u32, indices: &[u32]) -> u32 {
        let mut operands = Vec::with_capacity(indices.len() + 1);
        operands.push(base);
        operands.extend_from_slice(indices);
        self.value(Op::AccessChain, ty, &operands)
    }

    pub fn iadd(&mut self, ty: u32, a: u32, b: u32) -> u32 {
        self.value(Op::IAdd, ty, &[a, b])
    }

    pub fn imul(&mut self, ty: u32, a: u32, b: u32) -> u32 {
        self.value(Op::IMul, ty, &[a, b])
    }

    pub fn composite_extract(&mut self, ty: u32, composite: u32, indices: &[u32]) -> u32 {
        let mut operands = Vec::with_capacity(indices.len() + 1);
        operands.push(composite);
        operands.extend_from_slice(indices);
        self.value(Op::CompositeExtract, ty, &operands)
    }

    /// Read-only access to the module being edited.
    pub fn code(&self) -> &MutableBytecode {
        &*self.code
    }

    /// End emission and hand back the write position.
    pub fn finish(self) -> Cursor {
        self.at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_in_program_order() {
        let mut code = MutableBytecode::empty(0x0001_0400, 0);
        let uint = code.op_type_int(32, false);
        let one = code.op_constant(uint, 1);
        let end = code.end();

        let mut em = Emitter::new(&mut code, end);
        let a = em.iadd(uint, one, one);
        let b = em.imul(uint, a, one);
        let at = em.finish();

        assert!(code.is_end(at));
        let tail: Vec<_> = code.instructions()[2..].to_vec();
        assert!(tail[0].is(Op::IAdd));
        assert_eq!(tail[1].operands, vec![uint, b, a, one]);
    }
}
