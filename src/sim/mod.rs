// Reference executor
//
// Interprets the subset of SPIR-V that mesh shaders and their lowered
// compute/vertex modules use, on the CPU. Storage buffers are flat u32 word
// arrays addressed through Offset/ArrayStride decorations; all other memory
// starts zeroed. It exists to check lowered modules end to end, not to be fast.

mod exec;
pub mod program;
pub mod value;

use std::collections::HashMap;

use thiserror::Error;

use crate::spirv::SpirvError;
pub use exec::STEP_LIMIT;
pub use program::{Program, Type};
pub use value::{Pointer, Space, Value};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimError {
    #[error(transparent)]
    Spirv(#[from] SpirvError),

    #[error("module has no entry point")]
    NoEntryPoint,

    #[error("entry point uses execution model {found}, expected {expected}")]
    WrongStage { expected: u32, found: u32 },

    #[error("malformed module: {0}")]
    Malformed(&'static str),

    #[error("unknown id %{0}")]
    UnknownId(u32),

    #[error("unknown function %{0}")]
    UnknownFunction(u32),

    #[error("function %{0} has no body")]
    NoBody(u32),

    #[error("unknown label %{0}")]
    UnknownLabel(u32),

    #[error("opcode {0} is not supported")]
    UnsupportedOpcode(u16),

    #[error("type %{0} is not a pointer")]
    NotAPointer(u32),

    #[error("type %{0} is not a composite")]
    NotComposite(u32),

    #[error("type %{0} has no static size")]
    Unsized(u32),

    #[error("type %{0} is missing layout decorations")]
    Layout(u32),

    #[error("index {index} out of bounds for type %{ty}")]
    OutOfBounds { index: u32, ty: u32 },

    #[error("buffer variable %{0} has no descriptor binding")]
    Unbound(u32),

    #[error("no buffer bound at set {set}, binding {binding}")]
    MissingBinding { set: u32, binding: u32 },

    #[error("byte offset {offset} is past the end of the buffer at set {set}, binding {binding}")]
    OutOfBuffer { set: u32, binding: u32, offset: u32 },

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("integer division by zero")]
    DivisionByZero,

    #[error("reached unreachable code")]
    Unreachable,

    #[error("invocation exceeded {0} steps")]
    StepLimit(u64),
}

/// Storage buffers keyed by `(descriptor set, binding)`.
#[derive(Debug, Clone, Default)]
pub struct Buffers {
    bound: HashMap<(u32, u32), Vec<u32>>,
}

impl Buffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `words` at `(set, binding)`, replacing any previous buffer.
    pub fn bind(&mut self, set: u32, binding: u32, words: Vec<u32>) {
        self.bound.insert((set, binding), words);
    }

    pub fn get(&self, set: u32, binding: u32) -> Option<&[u32]> {
        self.bound.get(&(set, binding)).map(Vec::as_slice)
    }

    pub fn get_mut(&mut self, set: u32, binding: u32) -> Option<&mut [u32]> {
        self.bound.get_mut(&(set, binding)).map(Vec::as_mut_slice)
    }
}

/// Outputs written by one vertex invocation.
#[derive(Debug, Clone, Default)]
pub struct VertexOutput {
    /// Every Output variable by id.
    pub values: HashMap<u32, Value>,
    /// Output variables decorated with a Location.
    pub locations: HashMap<u32, Value>,
    position: Option<[f32; 4]>,
}

impl VertexOutput {
    /// `gl_Position`, whether declared standalone or inside a per-vertex block.
    pub fn position(&self) -> Option<[f32; 4]> {
        self.position
    }

    pub fn location(&self, location: u32) -> Option<&Value> {
        self.locations.get(&location)
    }

    fn set_position(&mut self, value: &Value) -> Result<(), SimError> {
        let parts = value.parts()?;
        let mut position = [0.0; 4];
        for (slot, part) in position.iter_mut().zip(parts) {
            *slot = part.float()?;
        }
        self.position = Some(position);
        Ok(())
    }
}

impl Program {
    /// Run `groups` workgroups of a GLCompute entry point.
    pub fn dispatch(&self, groups: [u32; 3], buffers: &mut Buffers) -> Result<(), SimError> {
        exec::dispatch(self, groups, buffers)
    }

    /// Run one invocation of a Vertex entry point.
    pub fn run_vertex(&self, vertex_index: u32, buffers: &mut Buffers) -> Result<VertexOutput, SimError> {
        exec::run_vertex(self, vertex_index, buffers)
    }
}
