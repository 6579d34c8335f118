// Vertex module emission
//
// Builds a fresh module whose only job is to fetch one vertex record from the
// scratch heap and write it to the stage outputs. Output types are copied from
// the mesh module node by node; the per-vertex array around each mesh output
// is dropped, since a vertex invocation writes a single vertex.

use std::collections::HashMap;

use spirv::{BuiltIn, Capability, Decoration, ExecutionModel, FunctionControl, Op, StorageClass};

use super::analysis::{debug_names, Decorations, MeshInterface};
use super::engine::{self, HEAP_DATA_MEMBER};
use super::LowerOptions;
use crate::spirv::{encode_string, Emitter, MutableBytecode, Section, TraverseOrder};

/// Copies types from the mesh module into the vertex module.
struct TypeRemap<'a> {
    src: &'a MutableBytecode,
    decorations: &'a Decorations,
    names: &'a HashMap<u32, String>,
    map: HashMap<u32, u32>,
}

impl<'a> TypeRemap<'a> {
    fn new(src: &'a MutableBytecode, decorations: &'a Decorations, names: &'a HashMap<u32, String>) -> Self {
        Self {
            src,
            decorations,
            names,
            map: HashMap::new(),
        }
    }

    fn remap(&mut self, dst: &mut MutableBytecode, id: u32) -> u32 {
        if let Some(mapped) = self.map.get(&id) {
            return *mapped;
        }
        let decl = self
            .src
            .find_def(id)
            .unwrap_or_else(|| panic!("type %{id} has no declaration"))
            .clone();
        let ops = &decl.operands;

        let mapped = if decl.is(Op::TypeVoid) {
            dst.op_type_void()
        } else if decl.is(Op::TypeBool) {
            dst.op_type_bool()
        } else if decl.is(Op::TypeInt) {
            dst.op_type_int(ops[1], ops[2] != 0)
        } else if decl.is(Op::TypeFloat) {
            dst.op_type_float(ops[1])
        } else if decl.is(Op::TypeVector) {
            let component = self.remap(dst, ops[1]);
            dst.op_type_vector(component, ops[2])
        } else if decl.is(Op::TypeMatrix) {
            let column = self.remap(dst, ops[1]);
            dst.op_type_matrix(column, ops[2])
        } else if decl.is(Op::TypeArray) {
            let element = self.remap(dst, ops[1]);
            let length = self.remap_constant(dst, ops[2]);
            dst.op_type_array(element, length)
        } else if decl.is(Op::TypePointer) {
            let storage = pointer_storage(ops[1]);
            let pointee = self.pointee_of(ops[2]);
            let pointee = self.remap(dst, pointee);
            dst.op_type_pointer(storage, pointee)
        } else if decl.is(Op::TypeStruct) {
            let members: Vec<u32> = ops[1..].iter().map(|m| self.remap(dst, *m)).collect();
            let mapped = dst.op_type_struct_unique(&members);
            self.copy_struct_annotations(dst, id, mapped, members.len() as u32);
            mapped
        } else {
            panic!("type %{id} (opcode {}) cannot appear in a vertex output", decl.opcode)
        };
        self.map.insert(id, mapped);
        mapped
    }

    /// Per-vertex arrays collapse to their element.
    fn pointee_of(&self, pointee: u32) -> u32 {
        match self.src.find_def(pointee) {
            Some(decl) if decl.is(Op::TypeArray) => decl.operands[1],
            _ => pointee,
        }
    }

    fn remap_constant(&mut self, dst: &mut MutableBytecode, id: u32) -> u32 {
        let value = self
            .src
            .constant_value(id)
            .unwrap_or_else(|| panic!("array length %{id} is not a constant"));
        let ty = self
            .src
            .find_def(id)
            .map(|decl| decl.operands[0])
            .unwrap_or_else(|| panic!("constant %{id} has no declaration"));
        let ty = self.remap(dst, ty);
        dst.op_constant(ty, value)
    }

    fn copy_struct_annotations(&self, dst: &mut MutableBytecode, src: u32, mapped: u32, members: u32) {
        for decoration in self.decorations.targets.get(&src).into_iter().flatten() {
            let mut operands = vec![mapped];
            operands.extend_from_slice(decoration);
            dst.insert_annotation(Op::Decorate, operands);
        }
        for member in 0..members {
            for decoration in self.decorations.members.get(&(src, member)).into_iter().flatten() {
                require_builtin_capability(dst, decoration);
                let mut operands = vec![mapped, member];
                operands.extend_from_slice(decoration);
                dst.insert_annotation(Op::MemberDecorate, operands);
            }
        }
        if let Some(name) = self.names.get(&src) {
            dst.op_name(mapped, name);
        }
        for (member, name) in member_names(self.src, src) {
            dst.op_member_name(mapped, member, &name);
        }
    }
}

fn pointer_storage(raw: u32) -> StorageClass {
    if raw == StorageClass::Output as u32 {
        StorageClass::Output
    } else {
        panic!("vertex outputs only reference Output pointers, found storage class {raw}")
    }
}

fn member_names(code: &MutableBytecode, target: u32) -> Vec<(u32, String)> {
    code.instructions()
        .iter()
        .filter(|inst| inst.is(Op::MemberName) && inst.operands[0] == target)
        .filter_map(|inst| Some((inst.operands[1], inst.string_at(2)?.0)))
        .collect()
}

/// Writing a clip or cull distance from a vertex shader needs its capability.
fn require_builtin_capability(dst: &mut MutableBytecode, decoration: &[u32]) {
    if decoration[0] != Decoration::BuiltIn as u32 {
        return;
    }
    if decoration[1] == BuiltIn::ClipDistance as u32 {
        dst.op_capability(Capability::ClipDistance);
    } else if decoration[1] == BuiltIn::CullDistance as u32 {
        dst.op_capability(Capability::CullDistance);
    }
}

/// One scalar written by the vertex shader.
struct Leaf {
    output: u32,
    chain: Vec<u32>,
    ty: u32,
    is_uint: bool,
    /// Word inside the vertex record.
    word: u32,
}

/// Build the vertex module for `iface`. Fresh ids start at `first_id`.
pub fn emit_vert(
    source: &MutableBytecode,
    iface: &MeshInterface,
    options: &LowerOptions,
    first_id: u32,
) -> MutableBytecode {
    let names = options.debug_names;
    let header = source.header();
    let mut code = MutableBytecode::empty(header.version, header.generator);
    // Ids below `first_id` belong to the source or the compute module.
    code.fetch_add_bound_n(first_id.max(source.bound()).saturating_sub(1));

    code.op_capability(Capability::Shader);
    for inst in source.instructions().iter().filter(|inst| inst.is(Op::Capability)) {
        let cap = inst.operands[0];
        if cap != Capability::MeshShadingEXT as u32 && cap != Capability::Shader as u32 {
            let at = code.find_section_end(Section::Capability);
            code.insert(at, Op::Capability, &[cap]);
        }
    }
    for inst in source.instructions().iter().filter(|inst| inst.is(Op::Extension)) {
        if inst.string_at(0).is_some_and(|(name, _)| name != super::compute::MESH_EXTENSION) {
            let at = code.find_section_end(Section::Extension);
            code.insert_instruction(at, inst.clone());
        }
    }
    if let Some(model) = source.instructions().iter().find(|inst| inst.is(Op::MemoryModel)) {
        let at = code.find_section(Section::MemoryModel);
        code.insert_instruction(at, model.clone());
    }

    let void = code.op_type_void();
    let main_type = code.op_type_function(void, &[]);
    let uint = code.op_type_int(32, false);
    let int = code.op_type_int(32, true);
    let heap = engine::declare_heap(&mut code, &options.bindings, names, true);
    let ptr_heap_word = code.op_type_pointer(StorageClass::StorageBuffer, uint);

    let ptr_input_int = code.op_type_pointer(StorageClass::Input, int);
    let vertex_index = code.op_variable(ptr_input_int, StorageClass::Input);
    code.op_decorate(vertex_index, Decoration::BuiltIn, &[BuiltIn::VertexIndex as u32]);
    if names {
        code.op_name(vertex_index, "gl_VertexIndex");
    }

    // Outputs, one per varying, with their source decorations.
    let decorations = Decorations::collect(source);
    let source_names = debug_names(source);
    let mut remap = TypeRemap::new(source, &decorations, &source_names);
    let mut leaves = Vec::new();
    let mut outputs = Vec::new();
    for varying in &iface.varyings {
        let ptr = remap.remap(&mut code, varying.pointer_type);
        let output = code.op_variable(ptr, StorageClass::Output);
        for decoration in decorations.targets.get(&varying.variable).into_iter().flatten() {
            if decoration[0] == Decoration::PerPrimitiveEXT as u32 {
                continue;
            }
            let mut operands = vec![output];
            operands.extend_from_slice(decoration);
            code.insert_annotation(Op::Decorate, operands);
        }
        if let Some(name) = source_names.get(&varying.variable) {
            code.op_name(output, name);
        }

        let mut nodes = Vec::new();
        code.traverse_type(ptr, TraverseOrder::Leaves, |node| nodes.push((node.chain.to_vec(), node.type_id)));
        for (ordinal, (chain, ty)) in nodes.into_iter().enumerate() {
            let is_uint = code
                .find_def(ty)
                .is_some_and(|d| d.is(Op::TypeInt) && d.operands[1] == 32 && d.operands[2] == 0);
            leaves.push(Leaf {
                output,
                chain,
                ty,
                is_uint,
                word: varying.write_offset + ordinal as u32,
            });
        }
        outputs.push(output);
    }

    // Everything the body references must exist before the body is emitted.
    let max = iface.var_count.max(HEAP_DATA_MEMBER);
    let consts: Vec<u32> = (0..=max).map(|n| code.op_constant(uint, n)).collect();
    let leaf_pointers: Vec<u32> = leaves
        .iter()
        .map(|leaf| code.op_type_pointer(StorageClass::Output, leaf.ty))
        .collect();

    let main = code.fetch_add_bound();
    let mut entry = vec![ExecutionModel::Vertex as u32, main];
    entry.extend(encode_string(&iface.entry.name));
    entry.push(vertex_index);
    entry.extend_from_slice(&outputs);
    if header.version >= crate::spirv::version(1, 4) {
        entry.push(heap);
    }
    let at = code.find_section(Section::EntryPoint);
    code.insert(at, Op::EntryPoint, &entry);
    if names {
        code.op_name(main, &iface.entry.name);
    }

    let end = code.end();
    let mut em = Emitter::new(&mut code, end);
    em.op(Op::Function, &[void, main, FunctionControl::NONE.bits(), main_type]);
    let label = em.fresh_id();
    em.label(label);
    if !leaves.is_empty() {
        let index = em.load(int, vertex_index);
        let index = em.value(Op::Bitcast, uint, &[index]);
        let base = em.imul(uint, index, consts[iface.var_count as usize]);
        for (leaf, leaf_pointer) in leaves.iter().zip(&leaf_pointers) {
            let addr = em.iadd(uint, base, consts[leaf.word as usize]);
            let src = em.access_chain(ptr_heap_word, heap, &[consts[HEAP_DATA_MEMBER as usize], addr]);
            let word = em.load(uint, src);
            let value = if leaf.is_uint {
                word
            } else {
                em.value(Op::Bitcast, leaf.ty, &[word])
            };
            let dst = if leaf.chain.is_empty() {
                leaf.output
            } else {
                let indices: Vec<u32> = leaf.chain.iter().map(|k| consts[*k as usize]).collect();
                em.access_chain(*leaf_pointer, leaf.output, &indices)
            };
            em.store(dst, value);
        }
    }
    em.op(Op::Return, &[]);
    em.op(Op::FunctionEnd, &[]);
    em.finish();

    log::debug!(
        "vertex module: {} outputs, {} leaf loads",
        outputs.len(),
        leaves.len()
    );
    code
}
