// Engine bookkeeping buffers
//
// Both output modules see the same three storage buffers:
//
//   EngineInternal0 { IndirectCommand cmd[]; }           indexed indirect draws
//   EngineInternal1 { uint count; Descriptor desc[]; }   one slot per workgroup
//   EngineInternal2 { uint grow; uint heap[]; }          bump-allocated scratch
//
// Layouts are std430 and fixed, so the host side can address them as flat
// u32 words using the constants below.

use serde::Deserialize;
use spirv::{Decoration, StorageClass};

use crate::spirv::MutableBytecode;

/// `VkDrawIndexedIndirectCommand`: indexCount, instanceCount, firstIndex,
/// vertexOffset, firstInstance.
pub const INDIRECT_COMMAND_WORDS: u32 = 5;
/// drawId, scratchOffset, indexSize.
pub const DESCRIPTOR_WORDS: u32 = 3;

/// Member of EngineInternal1 holding the descriptor counter.
pub const DESCRIPTOR_COUNT_MEMBER: u32 = 0;
/// Member of EngineInternal1 holding the descriptor array.
pub const DESCRIPTOR_ARRAY_MEMBER: u32 = 1;
/// Member of EngineInternal2 holding the bump counter.
pub const HEAP_GROW_MEMBER: u32 = 0;
/// Member of EngineInternal2 holding the scratch words.
pub const HEAP_DATA_MEMBER: u32 = 1;

/// Word index of `heap[0]` inside EngineInternal2.
pub const HEAP_DATA_WORD: usize = 1;
/// Word index of `desc[0]` inside EngineInternal1.
pub const DESCRIPTOR_DATA_WORD: usize = 1;

/// Where the engine buffers are bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineBindings {
    pub descriptor_set: u32,
    pub indirect_binding: u32,
    pub descriptor_binding: u32,
    pub heap_binding: u32,
}

impl Default for EngineBindings {
    fn default() -> Self {
        Self {
            descriptor_set: 0,
            indirect_binding: 0,
            descriptor_binding: 1,
            heap_binding: 2,
        }
    }
}

fn declare_block(
    code: &mut MutableBytecode,
    members: &[u32],
    offsets: &[u32],
    set: u32,
    binding: u32,
    read_only: bool,
) -> (u32, u32) {
    let block = code.op_type_struct_unique(members);
    for (i, offset) in offsets.iter().enumerate() {
        code.op_member_decorate(block, i as u32, Decoration::Offset, &[*offset]);
    }
    code.op_decorate(block, Decoration::Block, &[]);

    let ptr = code.op_type_pointer(StorageClass::StorageBuffer, block);
    let var = code.op_variable(ptr, StorageClass::StorageBuffer);
    code.op_decorate(var, Decoration::DescriptorSet, &[set]);
    code.op_decorate(var, Decoration::Binding, &[binding]);
    if read_only {
        code.op_decorate(var, Decoration::NonWritable, &[]);
    }
    (block, var)
}

/// Declare EngineInternal0, returning its variable.
pub fn declare_indirect(code: &mut MutableBytecode, bindings: &EngineBindings, names: bool) -> u32 {
    let uint = code.op_type_int(32, false);
    let command = code.op_type_struct_unique(&[uint; INDIRECT_COMMAND_WORDS as usize]);
    for i in 0..INDIRECT_COMMAND_WORDS {
        code.op_member_decorate(command, i, Decoration::Offset, &[i * 4]);
    }
    let commands = code.op_type_runtime_array(command);
    code.op_decorate(commands, Decoration::ArrayStride, &[INDIRECT_COMMAND_WORDS * 4]);

    let (block, var) = declare_block(
        code,
        &[commands],
        &[0],
        bindings.descriptor_set,
        bindings.indirect_binding,
        false,
    );
    if names {
        code.op_name(command, "IndirectCommand");
        for (i, member) in ["indexCount", "instanceCount", "firstIndex", "vertexOffset", "firstInstance"]
            .iter()
            .enumerate()
        {
            code.op_member_name(command, i as u32, member);
        }
        code.op_name(block, "EngineInternal0");
        code.op_member_name(block, 0, "cmd");
        code.op_name(var, "indirect");
    }
    var
}

/// Declare EngineInternal1, returning its variable.
pub fn declare_descriptors(code: &mut MutableBytecode, bindings: &EngineBindings, names: bool) -> u32 {
    let uint = code.op_type_int(32, false);
    let descriptor = code.op_type_struct_unique(&[uint; DESCRIPTOR_WORDS as usize]);
    for i in 0..DESCRIPTOR_WORDS {
        code.op_member_decorate(descriptor, i, Decoration::Offset, &[i * 4]);
    }
    let descriptors = code.op_type_runtime_array(descriptor);
    code.op_decorate(descriptors, Decoration::ArrayStride, &[DESCRIPTOR_WORDS * 4]);

    let (block, var) = declare_block(
        code,
        &[uint, descriptors],
        &[0, 4],
        bindings.descriptor_set,
        bindings.descriptor_binding,
        false,
    );
    if names {
        code.op_name(descriptor, "Descriptor");
        for (i, member) in ["drawId", "scratchOffset", "indexSize"].iter().enumerate() {
            code.op_member_name(descriptor, i as u32, member);
        }
        code.op_name(block, "EngineInternal1");
        code.op_member_name(block, 0, "count");
        code.op_member_name(block, 1, "desc");
        code.op_name(var, "mesh");
    }
    var
}

/// Declare EngineInternal2, returning its variable.
pub fn declare_heap(code: &mut MutableBytecode, bindings: &EngineBindings, names: bool, read_only: bool) -> u32 {
    let uint = code.op_type_int(32, false);
    let words = code.op_type_runtime_array(uint);
    code.op_decorate(words, Decoration::ArrayStride, &[4]);

    let (block, var) = declare_block(
        code,
        &[uint, words],
        &[0, 4],
        bindings.descriptor_set,
        bindings.heap_binding,
        read_only,
    );
    if names {
        code.op_name(block, "EngineInternal2");
        code.op_member_name(block, 0, "grow");
        code.op_member_name(block, 1, "heap");
        code.op_name(var, "var");
    }
    var
}
