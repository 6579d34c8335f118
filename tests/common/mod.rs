// Hand-assembled mesh shaders shared by the integration tests
//
// The layout follows what glslang emits for a small GLSL mesh shader:
//
//   layout(local_size_x = N) in;
//   layout(max_vertices = 3, max_primitives = 1, triangles) out;
//   void main() {
//       SetMeshOutputsEXT(3, 1);
//       gl_MeshVerticesEXT[i].gl_Position = vec4(1, 2, 3, 4);
//       gl_PrimitiveTriangleIndicesEXT[0] = uvec3(0, 1, 2);
//   }

#![allow(dead_code)]

use mesh_lower::sim::{Buffers, Program};
use mesh_lower::spirv::{assemble, encode_string, version, Header, Instruction};
use spirv::{BuiltIn, Decoration, ExecutionMode, ExecutionModel, Op, StorageClass};

pub const HEAP_WORDS: usize = 256;
pub const DESCRIPTOR_SLOTS: usize = 8;

/// Instruction list plus an id counter.
pub struct Assembler {
    bound: u32,
    code: Vec<Instruction>,
}

impl Assembler {
    pub fn new() -> Self {
        Self {
            bound: 1,
            code: Vec::new(),
        }
    }

    pub fn id(&mut self) -> u32 {
        let id = self.bound;
        self.bound += 1;
        id
    }

    pub fn op(&mut self, op: Op, operands: &[u32]) {
        self.code.push(Instruction::from_slice(op, operands));
    }

    /// `op prefix... "text" suffix...`
    pub fn op_str(&mut self, op: Op, prefix: &[u32], text: &str, suffix: &[u32]) {
        let mut operands = prefix.to_vec();
        operands.extend(encode_string(text));
        operands.extend_from_slice(suffix);
        self.code.push(Instruction::new(op, operands));
    }

    pub fn finish(self) -> Vec<u32> {
        let mut header = Header::new(version(1, 4), 0);
        header.bound = self.bound;
        assemble(header, &self.code)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MeshOptions {
    pub model: ExecutionModel,
    pub topology: ExecutionMode,
    pub local_size: u32,
    /// Declare and write `gl_MeshVerticesEXT`.
    pub per_vertex: bool,
    /// Declare `layout(location = 0) out uint tag[]`.
    pub tag: bool,
    /// Index outputs by `gl_LocalInvocationIndex` instead of constants.
    pub dynamic: bool,
    /// Follow `SetMeshOutputsEXT` with a branch into a block starting with a phi.
    pub phi: bool,
}

impl Default for MeshOptions {
    fn default() -> Self {
        Self {
            model: ExecutionModel::MeshEXT,
            topology: ExecutionMode::OutputTrianglesEXT,
            local_size: 1,
            per_vertex: true,
            tag: false,
            dynamic: false,
            phi: false,
        }
    }
}

/// The golden scenario: one thread, three vertices at (1, 2, 3, 4), one triangle.
pub fn golden_mesh() -> Vec<u32> {
    mesh_shader(&MeshOptions::default())
}

/// Only the index output; no varyings at all.
pub fn indices_only_mesh() -> Vec<u32> {
    mesh_shader(&MeshOptions {
        per_vertex: false,
        ..MeshOptions::default()
    })
}

/// Three threads, each writing its own vertex through a dynamic index.
pub fn workgroup_mesh() -> Vec<u32> {
    mesh_shader(&MeshOptions {
        local_size: 3,
        tag: true,
        dynamic: true,
        ..MeshOptions::default()
    })
}

pub fn mesh_shader(o: &MeshOptions) -> Vec<u32> {
    let mut a = Assembler::new();
    let [void, fn_void, uint, int, float, v4, v3u] = [(); 7].map(|_| a.id());
    let [u0, u1, u2, u3, u10, i0, i1, i2] = [(); 8].map(|_| a.id());
    let [f1, f2, f3, f4, position, triangle] = [(); 6].map(|_| a.id());
    let [arr_f1, block, arr_block, ptr_arr_block, verts, ptr_v4] = [(); 6].map(|_| a.id());
    let [arr_v3u, ptr_arr_v3u, prims, ptr_v3u] = [(); 4].map(|_| a.id());
    let [arr_tag, ptr_arr_tag, tag, ptr_uint] = [(); 4].map(|_| a.id());
    let [ptr_in_uint, local_index] = [(); 2].map(|_| a.id());
    let [main, entry, next] = [(); 3].map(|_| a.id());

    a.op(Op::Capability, &[spirv::Capability::MeshShadingEXT as u32]);
    a.op_str(Op::Extension, &[], "SPV_EXT_mesh_shader", &[]);
    a.op(Op::MemoryModel, &[spirv::AddressingModel::Logical as u32, spirv::MemoryModel::GLSL450 as u32]);

    let mut interface = vec![prims];
    if o.per_vertex {
        interface.push(verts);
    }
    if o.tag {
        interface.push(tag);
    }
    if o.dynamic {
        interface.push(local_index);
    }
    a.op_str(Op::EntryPoint, &[o.model as u32, main], "main", &interface);
    a.op(Op::ExecutionMode, &[main, ExecutionMode::LocalSize as u32, o.local_size, 1, 1]);
    a.op(Op::ExecutionMode, &[main, ExecutionMode::OutputVertices as u32, 3]);
    a.op(Op::ExecutionMode, &[main, ExecutionMode::OutputPrimitivesEXT as u32, 1]);
    a.op(Op::ExecutionMode, &[main, o.topology as u32]);

    a.op_str(Op::Name, &[main], "main", &[]);
    a.op_str(Op::Name, &[prims], "gl_PrimitiveTriangleIndicesEXT", &[]);
    if o.per_vertex {
        a.op_str(Op::Name, &[block], "gl_MeshPerVertexEXT", &[]);
        a.op_str(Op::MemberName, &[block, 0], "gl_Position", &[]);
        a.op_str(Op::Name, &[verts], "gl_MeshVerticesEXT", &[]);
    }
    if o.tag {
        a.op_str(Op::Name, &[tag], "tag", &[]);
    }

    if o.per_vertex {
        let members = [BuiltIn::Position, BuiltIn::PointSize, BuiltIn::ClipDistance, BuiltIn::CullDistance];
        for (i, builtin) in members.iter().enumerate() {
            a.op(Op::MemberDecorate, &[block, i as u32, Decoration::BuiltIn as u32, *builtin as u32]);
        }
        a.op(Op::Decorate, &[block, Decoration::Block as u32]);
    }
    a.op(
        Op::Decorate,
        &[prims, Decoration::BuiltIn as u32, BuiltIn::PrimitiveTriangleIndicesEXT as u32],
    );
    if o.tag {
        a.op(Op::Decorate, &[tag, Decoration::Location as u32, 0]);
    }
    if o.dynamic {
        a.op(
            Op::Decorate,
            &[local_index, Decoration::BuiltIn as u32, BuiltIn::LocalInvocationIndex as u32],
        );
    }

    a.op(Op::TypeVoid, &[void]);
    a.op(Op::TypeFunction, &[fn_void, void]);
    a.op(Op::TypeInt, &[uint, 32, 0]);
    a.op(Op::TypeInt, &[int, 32, 1]);
    a.op(Op::TypeFloat, &[float, 32]);
    a.op(Op::TypeVector, &[v4, float, 4]);
    a.op(Op::TypeVector, &[v3u, uint, 3]);
    for (id, value) in [(u0, 0), (u1, 1), (u2, 2), (u3, 3), (u10, 10)] {
        a.op(Op::Constant, &[uint, id, value]);
    }
    for (id, value) in [(i0, 0), (i1, 1), (i2, 2)] {
        a.op(Op::Constant, &[int, id, value]);
    }
    for (id, value) in [(f1, 1.0f32), (f2, 2.0), (f3, 3.0), (f4, 4.0)] {
        a.op(Op::Constant, &[float, id, value.to_bits()]);
    }
    a.op(Op::ConstantComposite, &[v4, position, f1, f2, f3, f4]);
    a.op(Op::ConstantComposite, &[v3u, triangle, u0, u1, u2]);

    let output = StorageClass::Output as u32;
    if o.per_vertex {
        a.op(Op::TypeArray, &[arr_f1, float, u1]);
        a.op(Op::TypeStruct, &[block, v4, float, arr_f1, arr_f1]);
        a.op(Op::TypeArray, &[arr_block, block, u3]);
        a.op(Op::TypePointer, &[ptr_arr_block, output, arr_block]);
        a.op(Op::Variable, &[ptr_arr_block, verts, output]);
        a.op(Op::TypePointer, &[ptr_v4, output, v4]);
    }
    a.op(Op::TypeArray, &[arr_v3u, v3u, u1]);
    a.op(Op::TypePointer, &[ptr_arr_v3u, output, arr_v3u]);
    a.op(Op::Variable, &[ptr_arr_v3u, prims, output]);
    a.op(Op::TypePointer, &[ptr_v3u, output, v3u]);
    if o.tag {
        a.op(Op::TypeArray, &[arr_tag, uint, u3]);
        a.op(Op::TypePointer, &[ptr_arr_tag, output, arr_tag]);
        a.op(Op::Variable, &[ptr_arr_tag, tag, output]);
        a.op(Op::TypePointer, &[ptr_uint, output, uint]);
    }
    if o.dynamic {
        a.op(Op::TypePointer, &[ptr_in_uint, StorageClass::Input as u32, uint]);
        a.op(Op::Variable, &[ptr_in_uint, local_index, StorageClass::Input as u32]);
    }

    a.op(Op::Function, &[void, main, 0, fn_void]);
    a.op(Op::Label, &[entry]);
    a.op(Op::SetMeshOutputsEXT, &[u3, u1]);
    if o.phi {
        a.op(Op::Branch, &[next]);
        a.op(Op::Label, &[next]);
        let merged = a.id();
        a.op(Op::Phi, &[uint, merged, u0, entry]);
    }

    if o.dynamic {
        let index = a.id();
        a.op(Op::Load, &[uint, index, local_index]);
        if o.per_vertex {
            let [x, value, ptr] = [(); 3].map(|_| a.id());
            a.op(Op::ConvertUToF, &[float, x, index]);
            a.op(Op::CompositeConstruct, &[v4, value, x, f2, f3, f4]);
            a.op(Op::AccessChain, &[ptr_v4, ptr, verts, index, i0]);
            a.op(Op::Store, &[ptr, value]);
        }
        if o.tag {
            let [value, ptr] = [(); 2].map(|_| a.id());
            a.op(Op::IAdd, &[uint, value, index, u10]);
            a.op(Op::AccessChain, &[ptr_uint, ptr, tag, index]);
            a.op(Op::Store, &[ptr, value]);
        }
    } else {
        for vertex in [i0, i1, i2] {
            if o.per_vertex {
                let ptr = a.id();
                a.op(Op::AccessChain, &[ptr_v4, ptr, verts, vertex, i0]);
                a.op(Op::Store, &[ptr, position]);
            }
            if o.tag {
                let ptr = a.id();
                a.op(Op::AccessChain, &[ptr_uint, ptr, tag, vertex]);
                a.op(Op::Store, &[ptr, u10]);
            }
        }
    }

    let ptr = a.id();
    a.op(Op::AccessChain, &[ptr_v3u, ptr, prims, i0]);
    a.op(Op::Store, &[ptr, triangle]);
    a.op(Op::Return, &[]);
    a.op(Op::FunctionEnd, &[]);

    a.finish()
}

/// Zeroed engine buffers at the default bindings.
pub fn engine_buffers() -> Buffers {
    let mut buffers = Buffers::new();
    buffers.bind(0, 0, vec![0; 5]);
    buffers.bind(0, 1, vec![0; 1 + 3 * DESCRIPTOR_SLOTS]);
    buffers.bind(0, 2, vec![0; 1 + HEAP_WORDS]);
    buffers
}

pub fn load(words: &[u32]) -> Program {
    Program::load(words).expect("lowered module loads in the executor")
}

/// `heap[i]`, skipping the bump counter.
pub fn heap(buffers: &Buffers, i: usize) -> u32 {
    buffers.get(0, 2).unwrap()[1 + i]
}
