// Compute prepass emission
//
// Turns a copy of the mesh module into a GLCompute module that writes its
// vertices and indices into the engine scratch heap:
//
//   1. declare everything the rewrite needs up front (types, constants,
//      engine buffers, shared iboPtr/vboPtr, missing builtins)
//   2. strip mesh-only capabilities, extensions and execution modes
//   3. retarget the entry point and rename the body to an inner function
//   4. turn outputs into Workgroup variables
//   5. rewrite output stores and OpSetMeshOutputsEXT
//   6. emit the wrapper that keeps the original entry name
//
// Declarations all land in the Types section, ahead of any function body, so
// step 5 only ever inserts code after its own cursor.

use std::collections::{HashMap, HashSet};

use spirv::{
    BuiltIn, Capability, Decoration, ExecutionMode, ExecutionModel, MemorySemantics, Op, Scope,
    SelectionControl, StorageClass,
};

use super::analysis::{MeshInterface, Varying};
use super::engine::{self, DESCRIPTOR_ARRAY_MEMBER, DESCRIPTOR_COUNT_MEMBER, HEAP_DATA_MEMBER, HEAP_GROW_MEMBER};
use super::{LowerErrorKind, LowerOptions};
use crate::spirv::{version, Cursor, Emitter, MutableBytecode, TraverseOrder};

pub(super) const MESH_EXTENSION: &str = "SPV_EXT_mesh_shader";

/// Ids shared by every rewrite in the module.
struct Context {
    uint: u32,
    boolean: u32,
    uvec3: u32,
    ptr_storage_uint: u32,
    /// `consts[n]` is the uint constant `n`.
    consts: Vec<u32>,
    barrier_semantics: u32,
    indirect: u32,
    descriptors: u32,
    heap: u32,
    ibo_ptr: u32,
    vbo_ptr: u32,
    local_index: u32,
    workgroup_id: u32,
    var_count: u32,
    /// Globals added to the entry point interface.
    new_globals: Vec<u32>,
}

impl Context {
    fn konst(&self, n: u32) -> u32 {
        *self
            .consts
            .get(n as usize)
            .unwrap_or_else(|| panic!("constant {n} was not declared ahead of emission"))
    }

    fn declare(code: &mut MutableBytecode, iface: &MeshInterface, options: &LowerOptions) -> Self {
        let names = options.debug_names;
        let uint = code.op_type_int(32, false);
        let boolean = code.op_type_bool();
        let uvec3 = code.op_type_vector(uint, 3);
        let ptr_storage_uint = code.op_type_pointer(StorageClass::StorageBuffer, uint);
        let ptr_shared_uint = code.op_type_pointer(StorageClass::Workgroup, uint);

        // Every literal the rewrites use is a scope (1, 2), a component (0..3),
        // a stride or a leaf offset (both bounded by var_count).
        let max = iface.var_count.max(3);
        let consts: Vec<u32> = (0..=max).map(|n| code.op_constant(uint, n)).collect();
        let barrier_semantics = code.op_constant(
            uint,
            (MemorySemantics::ACQUIRE_RELEASE | MemorySemantics::WORKGROUP_MEMORY).bits(),
        );

        let indirect = engine::declare_indirect(code, &options.bindings, names);
        let descriptors = engine::declare_descriptors(code, &options.bindings, names);
        let heap = engine::declare_heap(code, &options.bindings, names, false);
        let ibo_ptr = code.op_variable(ptr_shared_uint, StorageClass::Workgroup);
        let vbo_ptr = code.op_variable(ptr_shared_uint, StorageClass::Workgroup);
        if names {
            code.op_name(ibo_ptr, "iboPtr");
            code.op_name(vbo_ptr, "vboPtr");
        }
        let mut new_globals = vec![indirect, descriptors, heap, ibo_ptr, vbo_ptr];

        let local_index = match iface.builtins.local_invocation_index {
            Some(var) => var,
            None => {
                let var = synthesize_input(code, uint, BuiltIn::LocalInvocationIndex);
                if names {
                    code.op_name(var, "gl_LocalInvocationIndex");
                }
                new_globals.push(var);
                var
            }
        };
        let workgroup_id = match iface.builtins.workgroup_id {
            Some(var) => var,
            None => {
                let var = synthesize_input(code, uvec3, BuiltIn::WorkgroupId);
                if names {
                    code.op_name(var, "gl_WorkGroupID");
                }
                new_globals.push(var);
                var
            }
        };

        Self {
            uint,
            boolean,
            uvec3,
            ptr_storage_uint,
            consts,
            barrier_semantics,
            indirect,
            descriptors,
            heap,
            ibo_ptr,
            vbo_ptr,
            local_index,
            workgroup_id,
            var_count: iface.var_count,
            new_globals,
        }
    }
}

fn synthesize_input(code: &mut MutableBytecode, ty: u32, builtin: BuiltIn) -> u32 {
    let ptr = code.op_type_pointer(StorageClass::Input, ty);
    let var = code.op_variable(ptr, StorageClass::Input);
    code.op_decorate(var, Decoration::BuiltIn, &[builtin as u32]);
    log::debug!("synthesized {builtin:?} input %{var}");
    var
}

/// A pointer derived from one of the converted outputs.
#[derive(Debug, Clone)]
struct Access {
    root: u32,
    /// Access-chain index ids from the root variable.
    indices: Vec<u32>,
    /// Type the pointer points to.
    pointee: u32,
}

fn trace_access_chains(code: &MutableBytecode, roots: &[u32]) -> HashMap<u32, Access> {
    let mut map = HashMap::new();
    for inst in code.instructions() {
        if inst.is(Op::Variable) && roots.contains(&inst.operands[1]) {
            let pointee = pointee_of(code, inst.operands[0]);
            map.insert(
                inst.operands[1],
                Access {
                    root: inst.operands[1],
                    indices: Vec::new(),
                    pointee,
                },
            );
        }
    }
    for inst in code.instructions() {
        let is_chain = inst.is(Op::AccessChain) || inst.is(Op::InBoundsAccessChain);
        let is_copy = inst.is(Op::CopyObject);
        if !is_chain && !is_copy {
            continue;
        }
        let Some(parent) = map.get(&inst.operands[2]).cloned() else {
            continue;
        };
        let mut access = parent;
        if is_chain {
            access.indices.extend_from_slice(&inst.operands[3..]);
            access.pointee = pointee_of(code, inst.operands[0]);
        }
        map.insert(inst.operands[1], access);
    }
    map
}

fn pointee_of(code: &MutableBytecode, pointer_type: u32) -> u32 {
    let decl = code
        .find_def(pointer_type)
        .unwrap_or_else(|| panic!("pointer type %{pointer_type} has no declaration"));
    assert!(decl.is(Op::TypePointer), "%{pointer_type} is not a pointer type");
    decl.operands[2]
}

/// Nop the capability, extension and execution modes only mesh pipelines have.
fn strip_mesh_only(code: &mut MutableBytecode, entry_function: u32) {
    let mesh_modes = [
        ExecutionMode::OutputVertices as u32,
        ExecutionMode::OutputPrimitivesEXT as u32,
        ExecutionMode::OutputTrianglesEXT as u32,
    ];
    for i in 0..code.len() {
        let at = code.at(i);
        let inst = code.get(at);
        let strip = if inst.is(Op::Capability) {
            inst.operands[0] == Capability::MeshShadingEXT as u32
        } else if inst.is(Op::Extension) {
            inst.string_at(0).is_some_and(|(name, _)| name == MESH_EXTENSION)
        } else if inst.is(Op::ExecutionMode) {
            inst.operands[0] == entry_function && mesh_modes.contains(&inst.operands[1])
        } else {
            false
        };
        if strip {
            log::trace!("stripping mesh-only instruction {:?}", inst);
            code.set_to_nop(at);
        }
    }
    code.op_capability(Capability::Shader);
}

/// Point the entry at GLCompute, extend its interface, and move the original
/// body to a fresh id. Returns the inner function id.
fn retarget_entry_point(
    code: &mut MutableBytecode,
    iface: &MeshInterface,
    ctx: &Context,
    converted: &[u32],
    names: bool,
) -> u32 {
    let function = iface.entry.function;
    let at = code
        .find(|inst| inst.is(Op::EntryPoint) && inst.operands[1] == function)
        .unwrap_or_else(|| panic!("entry point for %{function} vanished during lowering"));
    code.get_mut(at).operands[0] = ExecutionModel::GLCompute as u32;

    // Before 1.4 the interface lists only Input/Output variables.
    let lists_all_globals = code.header().version >= version(1, 4);
    if !lists_all_globals {
        let rest = code
            .get(at)
            .string_at(2)
            .map(|(_, rest)| rest)
            .unwrap_or_else(|| panic!("entry point for %{function} has a malformed name"));
        let kept: Vec<u32> = code.get(at).operands[rest..]
            .iter()
            .copied()
            .filter(|id| !converted.contains(id))
            .collect();
        code.get_mut(at).operands.truncate(rest);
        for id in kept {
            code.append(at, id);
        }
    }
    for id in &ctx.new_globals {
        let is_input = *id == ctx.local_index || *id == ctx.workgroup_id;
        if lists_all_globals || is_input {
            code.append(at, *id);
        }
    }

    let inner = code.fetch_add_bound();
    for i in 0..code.len() {
        let at = code.at(i);
        let inst = code.get_mut(at);
        if inst.is(Op::Function) && inst.operands[1] == function {
            inst.operands[1] = inner;
        } else if inst.is(Op::FunctionCall) && inst.operands[2] == function {
            inst.operands[2] = inner;
        }
    }
    if names {
        code.op_name(inner, &format!("{}_inner", iface.entry.name));
    }
    inner
}

/// Struct types reachable from the converted variables.
fn reachable_structs(code: &MutableBytecode, vars: &[u32]) -> HashSet<u32> {
    let mut structs = HashSet::new();
    for var in vars {
        let Some(ty) = code.find_def(*var).map(|inst| inst.operands[0]) else {
            continue;
        };
        code.traverse_type(ty, TraverseOrder::PreOrder, |node| {
            if code.find_def(node.type_id).is_some_and(|d| d.is(Op::TypeStruct)) {
                structs.insert(node.type_id);
            }
        });
    }
    structs
}

/// Move the converted outputs to Workgroup storage and drop decorations
/// that are illegal there.
fn retarget_storage(code: &mut MutableBytecode, converted: &[u32]) {
    let structs = reachable_structs(code, converted);
    let output = StorageClass::Output as u32;
    let workgroup = StorageClass::Workgroup as u32;

    let mut merged: HashMap<u32, u32> = HashMap::new();
    for i in 0..code.len() {
        let at = code.at(i);
        let inst = code.get(at).clone();
        if inst.is(Op::Variable) && converted.contains(&inst.operands[1]) {
            code.get_mut(at).operands[2] = workgroup;
        } else if inst.is(Op::TypePointer) && inst.operands[1] == output {
            let pointee = inst.operands[2];
            let existing = code.find(|other| {
                other.is(Op::TypePointer) && other.operands[1] == workgroup && other.operands[2] == pointee
            });
            code.get_mut(at).operands[1] = workgroup;
            if let Some(other) = existing {
                // Keep whichever declaration comes first so no use precedes it.
                let (keep, drop) = if other.index() < at.index() { (other, at) } else { (at, other) };
                let target = code.get(keep).operands[0];
                merged.insert(code.get(drop).operands[0], target);
                code.set_to_nop(drop);
            }
        } else if inst.is(Op::Decorate) {
            let target = inst.operands[0];
            let is_block = inst.operands[1] == Decoration::Block as u32;
            if converted.contains(&target) || (is_block && structs.contains(&target)) {
                code.set_to_nop(at);
            }
        } else if inst.is(Op::MemberDecorate) && structs.contains(&inst.operands[0]) {
            code.set_to_nop(at);
        }
    }

    if merged.is_empty() {
        return;
    }
    for i in 0..code.len() {
        let at = code.at(i);
        let inst = code.get_mut(at);
        if inst.is(Op::TypeFunction) {
            for operand in inst.operands[1..].iter_mut() {
                if let Some(target) = merged.get(operand) {
                    *operand = *target;
                }
            }
        } else if inst.result_type().is_some() {
            if let Some(target) = merged.get(&inst.operands[0]) {
                inst.operands[0] = *target;
            }
        }
    }
}

/// Offset of a sub-object inside the per-vertex record, relative to the
/// varying's first word.
#[derive(Debug, Default)]
struct ChainOffset {
    constant: u32,
    /// `(index id, words per step)` for indices that are not plain constants.
    dynamic: Vec<(u32, u32)>,
}

fn chain_offset(code: &MutableBytecode, element_type: u32, indices: &[u32]) -> Result<ChainOffset, LowerErrorKind> {
    let mut offset = ChainOffset::default();
    let mut ty = element_type;
    for &index in indices {
        let decl = code
            .find_def(ty)
            .unwrap_or_else(|| panic!("type %{ty} has no declaration"))
            .clone();
        if decl.is(Op::TypeStruct) {
            let member = code.constant_value(index).ok_or_else(|| {
                LowerErrorKind::Unsupported(format!("struct member index %{index} is not a constant"))
            })?;
            let members = &decl.operands[1..];
            offset.constant += members[..member as usize]
                .iter()
                .map(|m| code.scalar_leaf_count(*m))
                .sum::<u32>();
            ty = members[member as usize];
        } else if decl.is(Op::TypeArray) || decl.is(Op::TypeVector) || decl.is(Op::TypeMatrix) {
            let child = decl.operands[1];
            let stride = code.scalar_leaf_count(child);
            match code.constant_value(index) {
                Some(k) => offset.constant += k * stride,
                None => offset.dynamic.push((index, stride)),
            }
            ty = child;
        } else {
            return Err(LowerErrorKind::Unsupported(format!(
                "access chain steps into non-composite type %{ty}"
            )));
        }
    }
    Ok(offset)
}

/// Leaves of `ty`: `(chain, leaf type, is uint)`.
fn leaves_of(code: &MutableBytecode, ty: u32) -> Vec<(Vec<u32>, u32, bool)> {
    let mut leaves = Vec::new();
    code.traverse_type(ty, TraverseOrder::Leaves, |node| {
        leaves.push((node.chain.to_vec(), node.type_id));
    });
    leaves
        .into_iter()
        .map(|(chain, leaf)| {
            let is_uint = code
                .find_def(leaf)
                .is_some_and(|d| d.is(Op::TypeInt) && d.operands[1] == 32 && d.operands[2] == 0);
            (chain, leaf, is_uint)
        })
        .collect()
}

/// Scatter a store into `gl_PrimitiveTriangleIndicesEXT` into the index region.
fn emit_ibo_store(
    code: &mut MutableBytecode,
    ctx: &Context,
    access: &Access,
    value: u32,
    at: Cursor,
) -> Result<Cursor, LowerErrorKind> {
    // (slot within the triangle, component of the stored value)
    let (primitive, entries): (u32, Vec<(u32, Option<u32>)>) = match access.indices.as_slice() {
        [primitive] => (*primitive, (0..3).map(|k| (ctx.konst(k), Some(k))).collect()),
        [primitive, component] => (*primitive, vec![(*component, None)]),
        _ => {
            return Err(LowerErrorKind::Unsupported(
                "store to the whole primitive index array".into(),
            ))
        }
    };

    let uint = ctx.uint;
    let mut em = Emitter::new(code, at);
    let ibo = em.load(uint, ctx.ibo_ptr);
    let triangle = em.imul(uint, primitive, ctx.konst(3));
    let base = em.iadd(uint, ibo, triangle);
    let first_vertex = if ctx.var_count > 0 {
        let vbo = em.load(uint, ctx.vbo_ptr);
        Some(em.value(Op::UDiv, uint, &[vbo, ctx.konst(ctx.var_count)]))
    } else {
        None
    };

    for (slot, component) in entries {
        let index = match component {
            Some(k) => em.composite_extract(uint, value, &[k]),
            None => value,
        };
        let index = match first_vertex {
            Some(first) => em.iadd(uint, index, first),
            None => index,
        };
        let addr = em.iadd(uint, base, slot);
        let ptr = em.access_chain(ctx.ptr_storage_uint, ctx.heap, &[ctx.konst(HEAP_DATA_MEMBER), addr]);
        em.store(ptr, index);
    }
    Ok(em.finish())
}

/// Scatter a store into a varying into the vertex region, one word per leaf.
fn emit_vbo_store(
    code: &mut MutableBytecode,
    ctx: &Context,
    varying: &Varying,
    access: &Access,
    value: u32,
    at: Cursor,
) -> Result<Cursor, LowerErrorKind> {
    let Some((vertex, rest)) = access.indices.split_first() else {
        return Err(LowerErrorKind::Unsupported(format!(
            "store to the whole output array %{}",
            varying.variable
        )));
    };
    let offset = chain_offset(code, varying.element_type, rest)?;
    let leaves = leaves_of(code, access.pointee);

    let uint = ctx.uint;
    let mut em = Emitter::new(code, at);
    let vbo = em.load(uint, ctx.vbo_ptr);
    let record = em.imul(uint, *vertex, ctx.konst(ctx.var_count));
    let mut base = em.iadd(uint, vbo, record);
    for (index, stride) in &offset.dynamic {
        let step = em.imul(uint, *index, ctx.konst(*stride));
        base = em.iadd(uint, base, step);
    }

    for (ordinal, (chain, leaf, is_uint)) in leaves.iter().enumerate() {
        let word = varying.write_offset + offset.constant + ordinal as u32;
        let addr = em.iadd(uint, base, ctx.konst(word));
        let part = if chain.is_empty() {
            value
        } else {
            em.composite_extract(*leaf, value, chain)
        };
        let bits = if *is_uint {
            part
        } else {
            em.value(Op::Bitcast, uint, &[part])
        };
        let ptr = em.access_chain(ctx.ptr_storage_uint, ctx.heap, &[ctx.konst(HEAP_DATA_MEMBER), addr]);
        em.store(ptr, bits);
    }
    Ok(em.finish())
}

/// Replace `OpSetMeshOutputsEXT` with the per-workgroup reservation.
///
/// Invocation 0 reserves heap space, bumps the draw's index count and claims
/// a descriptor slot; the shared base offsets are then published to the whole
/// workgroup through a barrier. Returns the cursor after the barrier and the
/// label of the block that now holds the rest of the original block.
fn emit_reservation(
    code: &mut MutableBytecode,
    ctx: &Context,
    vertex_count: u32,
    primitive_count: u32,
    at: Cursor,
) -> (Cursor, u32) {
    let uint = ctx.uint;
    let device = ctx.konst(Scope::Device as u32);
    let workgroup = ctx.konst(Scope::Workgroup as u32);
    let relaxed = ctx.konst(0);

    let mut em = Emitter::new(code, at);
    let index = em.load(uint, ctx.local_index);
    let first = em.value(Op::IEqual, ctx.boolean, &[index, ctx.konst(0)]);
    let reserve = em.fresh_id();
    let merge = em.fresh_id();
    em.op(Op::SelectionMerge, &[merge, SelectionControl::NONE.bits()]);
    em.op(Op::BranchConditional, &[first, reserve, merge]);

    em.label(reserve);
    let vertex_words = em.imul(uint, vertex_count, ctx.konst(ctx.var_count));
    let index_words = em.imul(uint, primitive_count, ctx.konst(3));
    // Pad the index region so the next workgroup's vertices stay aligned.
    let padded = if ctx.var_count > 1 {
        let bumped = em.iadd(uint, index_words, ctx.konst(ctx.var_count - 1));
        let records = em.value(Op::UDiv, uint, &[bumped, ctx.konst(ctx.var_count)]);
        em.imul(uint, records, ctx.konst(ctx.var_count))
    } else {
        index_words
    };
    let total = em.iadd(uint, vertex_words, padded);
    let grow = em.access_chain(ctx.ptr_storage_uint, ctx.heap, &[ctx.konst(HEAP_GROW_MEMBER)]);
    let offset = em.value(Op::AtomicIAdd, uint, &[grow, device, relaxed, total]);

    let group = em.load(ctx.uvec3, ctx.workgroup_id);
    let draw = em.composite_extract(uint, group, &[2]);
    let index_count = em.access_chain(
        ctx.ptr_storage_uint,
        ctx.indirect,
        &[ctx.konst(0), draw, ctx.konst(0)],
    );
    em.value(Op::AtomicIAdd, uint, &[index_count, device, relaxed, index_words]);

    let counter = em.access_chain(
        ctx.ptr_storage_uint,
        ctx.descriptors,
        &[ctx.konst(DESCRIPTOR_COUNT_MEMBER)],
    );
    let slot = em.value(Op::AtomicIAdd, uint, &[counter, device, relaxed, ctx.konst(1)]);
    let indices = em.iadd(uint, offset, vertex_words);
    // The descriptor points the host at this workgroup's indices.
    for (member, word) in [(0, draw), (1, indices), (2, index_words)] {
        let ptr = em.access_chain(
            ctx.ptr_storage_uint,
            ctx.descriptors,
            &[ctx.konst(DESCRIPTOR_ARRAY_MEMBER), slot, ctx.konst(member)],
        );
        em.store(ptr, word);
    }

    em.store(ctx.vbo_ptr, offset);
    em.store(ctx.ibo_ptr, indices);
    em.op(Op::Branch, &[merge]);

    em.label(merge);
    em.op(Op::ControlBarrier, &[workgroup, workgroup, ctx.barrier_semantics]);
    (em.finish(), merge)
}

struct Relabel {
    function: u32,
    from: u32,
    to: u32,
}

fn rewrite_bodies(
    code: &mut MutableBytecode,
    iface: &MeshInterface,
    ctx: &Context,
    chains: &HashMap<u32, Access>,
) -> Result<Vec<Relabel>, LowerErrorKind> {
    let mut relabels = Vec::new();
    let mut function = 0;
    let mut block = 0;
    let mut stores = 0;

    let mut it = code.begin();
    while !code.is_end(it) {
        let inst = code.get(it).clone();
        if inst.is(Op::Function) {
            function = inst.operands[1];
        } else if inst.is(Op::Label) {
            block = inst.operands[0];
        } else if inst.is(Op::Store) {
            if let Some(access) = chains.get(&inst.operands[0]) {
                let value = inst.operands[1];
                let next = code.next(it);
                it = if Some(access.root) == iface.builtins.primitive_indices {
                    emit_ibo_store(code, ctx, access, value, next)?
                } else {
                    let varying = iface
                        .varying(access.root)
                        .unwrap_or_else(|| panic!("store through %{} has no varying", access.root));
                    emit_vbo_store(code, ctx, varying, access, value, next)?
                };
                stores += 1;
                continue;
            }
        } else if inst.is(Op::SetMeshOutputsEXT) {
            code.set_to_nop(it);
            let next = code.next(it);
            let (after, merge) = emit_reservation(code, ctx, inst.operands[0], inst.operands[1], next);
            relabels.push(Relabel {
                function,
                from: block,
                to: merge,
            });
            block = merge;
            it = after;
            continue;
        }
        it = code.next(it);
    }

    log::debug!(
        "rewrote {stores} output stores and {} SetMeshOutputsEXT calls",
        relabels.len()
    );
    Ok(relabels)
}

/// Successors of a split block now branch from its merge half.
fn fix_phis(code: &mut MutableBytecode, relabels: &[Relabel]) {
    if relabels.is_empty() {
        return;
    }
    let mut function = 0;
    for i in 0..code.len() {
        let at = code.at(i);
        let inst = code.get_mut(at);
        if inst.is(Op::Function) {
            function = inst.operands[1];
        } else if inst.is(Op::Phi) {
            for parent in inst.operands.iter_mut().skip(3).step_by(2) {
                if let Some(r) = relabels.iter().find(|r| r.function == function && r.from == *parent) {
                    *parent = r.to;
                }
            }
        }
    }
}

/// Append `main` as a wrapper calling the renamed body.
fn emit_wrapper(code: &mut MutableBytecode, iface: &MeshInterface, inner: u32) {
    let decl = code
        .find(|inst| inst.is(Op::Function) && inst.operands[1] == inner)
        .map(|at| code.get(at).operands.clone())
        .unwrap_or_else(|| panic!("inner function %{inner} vanished during lowering"));
    let (ret, control, fn_type) = (decl[0], decl[2], decl[3]);

    let end = code.end();
    let mut em = Emitter::new(code, end);
    em.op(Op::Function, &[ret, iface.entry.function, control, fn_type]);
    let label = em.fresh_id();
    em.label(label);
    em.value(Op::FunctionCall, ret, &[inner]);
    em.op(Op::Return, &[]);
    em.op(Op::FunctionEnd, &[]);
    em.finish();
}

/// Build the compute module from the mesh module.
pub fn emit_comp(
    source: &MutableBytecode,
    iface: &MeshInterface,
    options: &LowerOptions,
) -> Result<MutableBytecode, LowerErrorKind> {
    let mut code = source.clone();
    let converted: Vec<u32> = iface
        .builtins
        .primitive_indices
        .into_iter()
        .chain(iface.varyings.iter().map(|v| v.variable))
        .collect();
    let chains = trace_access_chains(&code, &converted);

    // Step 1: declarations
    let ctx = Context::declare(&mut code, iface, options);

    // Step 2: mesh-only elements
    strip_mesh_only(&mut code, iface.entry.function);

    // Step 3: entry point
    let inner = retarget_entry_point(&mut code, iface, &ctx, &converted, options.debug_names);

    // Step 4: outputs become workgroup scratch
    retarget_storage(&mut code, &converted);

    // Step 5: stores and output-count calls
    let relabels = rewrite_bodies(&mut code, iface, &ctx, &chains)?;
    fix_phis(&mut code, &relabels);
    if relabels.is_empty() {
        log::warn!("entry `{}` never calls SetMeshOutputsEXT", iface.entry.name);
    }

    // Step 6: wrapper keeps the original entry id and name
    emit_wrapper(&mut code, iface, inner);

    code.remove_nops();
    Ok(code)
}
