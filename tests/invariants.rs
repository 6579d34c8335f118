mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::{golden_mesh, indices_only_mesh, mesh_shader, workgroup_mesh, MeshOptions};
use mesh_lower::spirv::{Bytecode, MutableBytecode};
use mesh_lower::{lower, LowerOptions, LoweredShader, LoweringCache};

fn fixtures() -> Vec<(&'static str, Vec<u32>)> {
    vec![
        ("golden", golden_mesh()),
        ("indices", indices_only_mesh()),
        ("workgroup", workgroup_mesh()),
        (
            "phi",
            mesh_shader(&MeshOptions {
                phi: true,
                ..MeshOptions::default()
            }),
        ),
    ]
}

fn lowered(name: &str, words: &[u32]) -> LoweredShader {
    lower(name, words, LowerOptions::default()).unwrap()
}

fn result_ids(words: &[u32]) -> Vec<u32> {
    Bytecode::new(words).unwrap().iter().filter_map(|inst| inst.result_id()).collect()
}

#[test]
fn result_ids_are_unique_and_below_the_bound() {
    for (name, words) in fixtures() {
        let shader = lowered(name, &words);
        for (stage, module) in [("comp", &shader.compute), ("vert", &shader.vertex)] {
            let code = Bytecode::new(module).unwrap();
            let bound = code.header().bound;
            let mut seen = HashSet::new();
            for id in result_ids(module) {
                assert!(id > 0 && id < bound, "{name}.{stage}: %{id} outside bound {bound}");
                assert!(seen.insert(id), "{name}.{stage}: %{id} defined twice");
            }
        }
    }
}

#[test]
fn new_ids_come_after_the_input_bound() {
    for (name, words) in fixtures() {
        let input_bound = Bytecode::new(&words).unwrap().header().bound;
        let input_ids: HashSet<u32> = result_ids(&words).into_iter().collect();
        let shader = lowered(name, &words);
        for module in [&shader.compute, &shader.vertex] {
            for id in result_ids(module) {
                if !input_ids.contains(&id) {
                    assert!(id >= input_bound, "{name}: new id %{id} reuses the input range");
                }
            }
        }
    }
}

#[test]
fn compute_and_vertex_mint_disjoint_ids() {
    for (name, words) in fixtures() {
        let input_ids: HashSet<u32> = result_ids(&words).into_iter().collect();
        let shader = lowered(name, &words);
        let fresh = |module: &[u32]| -> HashSet<u32> {
            result_ids(module).into_iter().filter(|id| !input_ids.contains(id)).collect()
        };
        let compute = fresh(&shader.compute);
        let vertex = fresh(&shader.vertex);
        assert!(!compute.is_empty() && !vertex.is_empty(), "{name}");

        let shared: Vec<_> = compute.intersection(&vertex).collect();
        assert!(shared.is_empty(), "{name}: ids minted by both modules: {shared:?}");

        let compute_bound = Bytecode::new(&shader.compute).unwrap().header().bound;
        assert!(
            vertex.iter().all(|&id| id >= compute_bound),
            "{name}: vertex ids start below the compute bound {compute_bound}"
        );
    }
}

#[test]
fn outputs_keep_section_order() {
    for (name, words) in fixtures() {
        let shader = lowered(name, &words);
        for module in [&shader.compute, &shader.vertex] {
            let sections = Bytecode::new(module).unwrap().sections();
            assert!(
                sections.windows(2).all(|pair| pair[0] <= pair[1]),
                "{name}: sections out of order: {sections:?}"
            );
        }
    }
}

#[test]
fn varyings_partition_the_vertex_record() {
    for (name, words) in fixtures() {
        let shader = lowered(name, &words);
        let mut varyings = shader.interface.varyings.clone();
        varyings.sort_by_key(|v| v.write_offset);

        let mut next = 0;
        for varying in &varyings {
            assert_eq!(varying.write_offset, next, "{name}: gap before %{}", varying.variable);
            next += varying.leaf_count;
        }
        assert_eq!(next, shader.var_count(), "{name}");
    }
}

#[test]
fn lowering_is_deterministic() {
    let a = lowered("workgroup", &workgroup_mesh());
    let b = lowered("workgroup", &workgroup_mesh());
    assert_eq!(a.compute, b.compute);
    assert_eq!(a.vertex, b.vertex);
}

#[test]
fn outputs_round_trip_through_the_editor() {
    for (name, words) in fixtures() {
        let shader = lowered(name, &words);
        for module in [&shader.compute, &shader.vertex] {
            let code = Bytecode::new(module).unwrap();
            let mut editable = MutableBytecode::new(&code);
            assert_eq!(&editable.to_words(), module, "{name}");

            // Lowered modules are already compact.
            editable.remove_nops();
            assert_eq!(&editable.to_words(), module, "{name}");
            editable.remove_nops();
            assert_eq!(&editable.to_words(), module, "{name}");
        }
    }
}

#[test]
fn cache_lowers_each_module_once() {
    let cache = LoweringCache::default();
    assert!(cache.is_empty());

    let first = cache.get_or_lower("golden", &golden_mesh()).unwrap();
    let again = cache.get_or_lower("golden", &golden_mesh()).unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(cache.len(), 1);

    let other = cache.get_or_lower("workgroup", &workgroup_mesh()).unwrap();
    assert!(!Arc::ptr_eq(&first, &other));
    assert_eq!(cache.len(), 2);

    cache.clear();
    assert!(cache.is_empty());
}

#[test]
fn cache_entries_match_name_and_words_exactly() {
    let cache = LoweringCache::default();
    let golden = cache.get_or_lower("shader", &golden_mesh()).unwrap();
    let workgroup = cache.get_or_lower("shader", &workgroup_mesh()).unwrap();
    assert!(!Arc::ptr_eq(&golden, &workgroup));
    assert_eq!(workgroup.compute, lowered("shader", &workgroup_mesh()).compute);

    let renamed = cache.get_or_lower("other", &golden_mesh()).unwrap();
    assert!(!Arc::ptr_eq(&golden, &renamed));
    assert_eq!(renamed.name, "other");
    assert_eq!(cache.len(), 3);

    let again = cache.get_or_lower("shader", &golden_mesh()).unwrap();
    assert!(Arc::ptr_eq(&golden, &again));
    assert_eq!(again.compute, lowered("shader", &golden_mesh()).compute);
}

#[test]
fn cache_reports_lowering_failures() {
    let cache = LoweringCache::default();
    let err = cache
        .get_or_lower("broken", &[0xdead_beef, 0, 0, 1, 0])
        .unwrap_err();
    assert_eq!(err.shader, "broken");
    assert!(cache.is_empty());
}
