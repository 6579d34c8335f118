mod common;

use std::collections::{HashMap, HashSet};

use common::{engine_buffers, golden_mesh, heap, indices_only_mesh, load, mesh_shader, workgroup_mesh, MeshOptions};
use glam::Vec4;
use mesh_lower::mesh::engine::EngineBindings;
use mesh_lower::sim::{Buffers, Value};
use mesh_lower::spirv::{Bytecode, MutableBytecode, SpirvError};
use mesh_lower::{lower, LowerErrorKind, LowerOptions};
use spirv::{Decoration, ExecutionMode, ExecutionModel, Op, Scope, StorageClass};

/// The indices a host finds by following descriptor `slot`.
fn descriptor_indices(buffers: &Buffers, slot: usize) -> Vec<u32> {
    let descriptors = buffers.get(0, 1).unwrap();
    let record = &descriptors[1 + slot * 3..1 + slot * 3 + 3];
    let (offset, size) = (record[1] as usize, record[2] as usize);
    (offset..offset + size).map(|i| heap(buffers, i)).collect()
}

#[test]
fn golden_scenario() {
    let lowered = lower("golden", &golden_mesh(), LowerOptions::default()).unwrap();
    // vec4 Position, float PointSize, float ClipDistance[1], float CullDistance[1]
    assert_eq!(lowered.var_count(), 7);

    let mut buffers = engine_buffers();
    load(&lowered.compute).dispatch([1, 1, 1], &mut buffers).unwrap();

    let indirect = buffers.get(0, 0).unwrap();
    assert_eq!(indirect[0], 3, "indexCount");
    // 3 vertices * 7 words, then 3 indices padded to one 7-word record
    assert_eq!(buffers.get(0, 2).unwrap()[0], 28);
    // {drawId, scratchOffset, indexSize}: the offset names the index region.
    let descriptors = buffers.get(0, 1).unwrap();
    assert_eq!(&descriptors[..4], &[1, 0, 21, 3]);
    assert_eq!(descriptor_indices(&buffers, 0), vec![0, 1, 2]);

    let vertex = load(&lowered.vertex);
    for k in 0..3 {
        let out = vertex.run_vertex(k, &mut buffers).unwrap();
        let position = Vec4::from_array(out.position().expect("vertex writes gl_Position"));
        assert_eq!(position, Vec4::new(1.0, 2.0, 3.0, 4.0), "vertex {k}");
    }
}

#[test]
fn zero_varyings_lower_without_dividing_by_zero() {
    let lowered = lower("indices", &indices_only_mesh(), LowerOptions::default()).unwrap();
    assert_eq!(lowered.var_count(), 0);
    assert!(lowered.interface.varyings.is_empty());

    let mut buffers = engine_buffers();
    load(&lowered.compute).dispatch([1, 1, 1], &mut buffers).unwrap();
    assert_eq!(buffers.get(0, 0).unwrap()[0], 3);
    assert_eq!(buffers.get(0, 2).unwrap()[0], 3);
    assert_eq!([heap(&buffers, 0), heap(&buffers, 1), heap(&buffers, 2)], [0, 1, 2]);

    let out = load(&lowered.vertex).run_vertex(0, &mut buffers).unwrap();
    assert!(out.position().is_none());
    assert!(out.values.is_empty());
}

#[test]
fn workgroups_get_aligned_regions() {
    let lowered = lower("workgroup", &workgroup_mesh(), LowerOptions::default()).unwrap();
    // Per-vertex block plus the uint tag.
    assert_eq!(lowered.var_count(), 8);

    let mut buffers = engine_buffers();
    load(&lowered.compute).dispatch([2, 1, 1], &mut buffers).unwrap();

    // Both workgroups draw into command 0 (gl_WorkGroupID.z).
    assert_eq!(buffers.get(0, 0).unwrap()[0], 6);
    assert_eq!(buffers.get(0, 2).unwrap()[0], 64);
    assert_eq!(&buffers.get(0, 1).unwrap()[..7], &[2, 0, 24, 3, 0, 56, 3]);
    assert_eq!(descriptor_indices(&buffers, 0), vec![0, 1, 2]);
    assert_eq!(descriptor_indices(&buffers, 1), vec![4, 5, 6]);

    // The second workgroup's vertices start at record 4, and its indices say so.
    assert_eq!([heap(&buffers, 24), heap(&buffers, 25), heap(&buffers, 26)], [0, 1, 2]);
    assert_eq!([heap(&buffers, 56), heap(&buffers, 57), heap(&buffers, 58)], [4, 5, 6]);

    let vertex = load(&lowered.vertex);
    for (first, label) in [(0, "first"), (4, "second")] {
        for k in 0..3 {
            let out = vertex.run_vertex(first + k, &mut buffers).unwrap();
            let position = Vec4::from_array(out.position().unwrap());
            assert_eq!(position, Vec4::new(k as f32, 2.0, 3.0, 4.0), "{label} workgroup, vertex {k}");
            assert_eq!(out.location(0), Some(&Value::Word(k + 10)));
        }
    }
}

#[test]
fn barrier_guards_every_heap_store() {
    let lowered = lower("workgroup", &workgroup_mesh(), LowerOptions::default()).unwrap();
    let code = Bytecode::new(&lowered.compute).unwrap().instructions();

    let constants: HashMap<u32, u32> = code
        .iter()
        .filter(|inst| inst.is(Op::Constant))
        .map(|inst| (inst.operands[1], inst.operands[2]))
        .collect();
    let heap = code
        .iter()
        .find(|inst| inst.is(Op::Decorate) && inst.operands[1] == Decoration::Binding as u32 && inst.operands[2] == 2)
        .map(|inst| inst.operands[0])
        .unwrap();
    let heap_chains: HashSet<u32> = code
        .iter()
        .filter(|inst| inst.is(Op::AccessChain) && inst.operands[2] == heap && constants.get(&inst.operands[3]) == Some(&1))
        .map(|inst| inst.operands[1])
        .collect();
    let heap_stores: Vec<usize> = (0..code.len())
        .filter(|&i| code[i].is(Op::Store) && heap_chains.contains(&code[i].operands[0]))
        .collect();
    assert!(!heap_stores.is_empty());

    let barrier = code.iter().position(|inst| inst.is(Op::ControlBarrier)).unwrap();
    let workgroup = Scope::Workgroup as u32;
    assert_eq!(constants[&code[barrier].operands[0]], workgroup, "execution scope");
    assert_eq!(constants[&code[barrier].operands[1]], workgroup, "memory scope");
    assert_ne!(constants[&code[barrier].operands[2]], 0, "memory semantics");

    // The barrier opens the reservation's merge block.
    let merge = &code[barrier - 1];
    assert!(merge.is(Op::Label));
    assert!(code[..barrier]
        .iter()
        .any(|inst| inst.is(Op::SelectionMerge) && inst.operands[0] == merge.operands[0]));
    assert!(heap_stores.iter().all(|&store| store > barrier), "heap store before the barrier");
}

#[test]
fn workgroups_race_without_the_barrier() {
    let lowered = lower("workgroup", &workgroup_mesh(), LowerOptions::default()).unwrap();
    let mut code = MutableBytecode::new(&Bytecode::new(&lowered.compute).unwrap());
    while let Some(barrier) = code.find(|inst| inst.is(Op::ControlBarrier)) {
        code.set_to_nop(barrier);
    }
    code.remove_nops();

    let mut buffers = engine_buffers();
    load(&code.to_words()).dispatch([2, 1, 1], &mut buffers).unwrap();

    // Invocations 1 and 2 of the second workgroup wrote before the reservation.
    let out = load(&lowered.vertex).run_vertex(6, &mut buffers).unwrap();
    assert_ne!(out.position(), Some([2.0, 2.0, 3.0, 4.0]));
    assert_ne!(out.location(0), Some(&Value::Word(12)));
}

#[test]
fn split_block_keeps_phi_parents() {
    let words = mesh_shader(&MeshOptions {
        phi: true,
        ..MeshOptions::default()
    });
    let lowered = lower("phi", &words, LowerOptions::default()).unwrap();

    let mut buffers = engine_buffers();
    // The executor rejects a phi whose parents do not include the block it came from.
    load(&lowered.compute).dispatch([1, 1, 1], &mut buffers).unwrap();
    assert_eq!(buffers.get(0, 0).unwrap()[0], 3);
}

#[test]
fn custom_bindings_reach_both_modules() {
    let options = LowerOptions {
        bindings: EngineBindings {
            descriptor_set: 1,
            indirect_binding: 4,
            descriptor_binding: 5,
            heap_binding: 6,
        },
        ..LowerOptions::default()
    };
    let lowered = lower("bound", &golden_mesh(), options).unwrap();

    let mut buffers = Buffers::new();
    buffers.bind(1, 4, vec![0; 5]);
    buffers.bind(1, 5, vec![0; 16]);
    buffers.bind(1, 6, vec![0; 64]);
    load(&lowered.compute).dispatch([1, 1, 1], &mut buffers).unwrap();
    assert_eq!(buffers.get(1, 4).unwrap()[0], 3);

    let out = load(&lowered.vertex).run_vertex(2, &mut buffers).unwrap();
    assert_eq!(out.position(), Some([1.0, 2.0, 3.0, 4.0]));
}

#[test]
fn compute_module_has_no_mesh_state_left() {
    let lowered = lower("golden", &golden_mesh(), LowerOptions::default()).unwrap();
    let code = Bytecode::new(&lowered.compute).unwrap();

    for inst in code.iter() {
        if inst.is(Op::Capability) {
            assert_ne!(inst.operands[0], spirv::Capability::MeshShadingEXT as u32);
        }
        if inst.is(Op::Variable) {
            assert_ne!(inst.operands[2], StorageClass::Output as u32);
        }
        if inst.is(Op::ExecutionMode) {
            assert_ne!(inst.operands[1], ExecutionMode::OutputVertices as u32);
        }
        assert!(!inst.is(Op::SetMeshOutputsEXT));
        assert!(!inst.is(Op::Extension));
    }
    let entry = code.iter().find(|inst| inst.is(Op::EntryPoint)).unwrap();
    assert_eq!(entry.operands[0], ExecutionModel::GLCompute as u32);

    let vertex = Bytecode::new(&lowered.vertex).unwrap();
    let entry = vertex.iter().find(|inst| inst.is(Op::EntryPoint)).unwrap();
    assert_eq!(entry.operands[0], ExecutionModel::Vertex as u32);
    assert_eq!(mesh_lower::spirv::decode_string(&entry.operands[2..]).unwrap().0, "main");
}

#[test]
fn debug_names_can_be_disabled() {
    let has_name = |words: &[u32], name: &str| {
        Bytecode::new(words).unwrap().iter().any(|inst| {
            inst.is(Op::Name) && mesh_lower::spirv::decode_string(&inst.operands[1..]).map(|(s, _)| s).as_deref() == Some(name)
        })
    };

    let named = lower("golden", &golden_mesh(), LowerOptions::default()).unwrap();
    assert!(has_name(&named.compute, "iboPtr"));
    assert!(has_name(&named.compute, "main_inner"));

    let options = LowerOptions {
        debug_names: false,
        ..LowerOptions::default()
    };
    let bare = lower("golden", &golden_mesh(), options).unwrap();
    assert!(!has_name(&bare.compute, "iboPtr"));
    assert!(!has_name(&bare.vertex, "gl_VertexIndex"));
}

#[test]
fn rejects_other_execution_models() {
    let words = mesh_shader(&MeshOptions {
        model: ExecutionModel::Vertex,
        ..MeshOptions::default()
    });
    let err = lower("plain", &words, LowerOptions::default()).unwrap_err();
    assert_eq!(err.shader, "plain");
    assert_eq!(
        err.kind,
        LowerErrorKind::NotMeshShader {
            entry: "main".into(),
            model: ExecutionModel::Vertex as u32
        }
    );
    assert!(err.to_string().contains("`plain`"));
}

#[test]
fn rejects_line_topology() {
    let words = mesh_shader(&MeshOptions {
        topology: ExecutionMode::OutputLinesEXT,
        ..MeshOptions::default()
    });
    let err = lower("lines", &words, LowerOptions::default()).unwrap_err();
    assert_eq!(err.kind, LowerErrorKind::UnsupportedTopology);
}

#[test]
fn rejects_malformed_binaries() {
    let err = lower("broken", &[0xdead_beef, 0, 0, 1, 0], LowerOptions::default()).unwrap_err();
    assert_eq!(err.kind, LowerErrorKind::Spirv(SpirvError::BadMagic(0xdead_beef)));
    assert!(err.to_string().starts_with("failed to lower shader `broken`"));

    let mut assembler = common::Assembler::new();
    assembler.op(Op::Capability, &[spirv::Capability::Shader as u32]);
    let err = lower("empty", &assembler.finish(), LowerOptions::default()).unwrap_err();
    assert_eq!(err.kind, LowerErrorKind::MissingEntryPoint);

    let mut assembler = common::Assembler::new();
    assembler.op(Op::Capability, &[spirv::Capability::MeshShadingEXT as u32]);
    let main = assembler.id();
    let name = u32::from_le_bytes(*b"main");
    assembler.op(Op::EntryPoint, &[ExecutionModel::MeshEXT as u32, main, name]);
    let err = lower("unterminated", &assembler.finish(), LowerOptions::default()).unwrap_err();
    assert_eq!(err.kind, LowerErrorKind::Spirv(SpirvError::UnterminatedString { offset: 7 }));
}
