// Mesh shader lowering
//
// A MeshConverter takes a mesh-stage SPIR-V module and produces two modules
// for pipelines without mesh shading:
//
//   compute  runs one workgroup per mesh workgroup and writes vertices and
//            triangle indices into a scratch heap, bumping indirect draw
//            counts as it goes
//   vertex   fetches one vertex record from the heap by gl_VertexIndex and
//            feeds it to the original outputs
//
// The host then issues the indexed indirect draws the compute pass filled.

pub mod analysis;
pub mod compute;
pub mod engine;
pub mod vertex;

use serde::Deserialize;
use thiserror::Error;

use crate::spirv::{Bytecode, MutableBytecode, SpirvError};
pub use analysis::{Builtins, EntryPoint, MeshInterface, Varying};
pub use engine::EngineBindings;

/// Why a module could not be lowered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LowerErrorKind {
    #[error(transparent)]
    Spirv(#[from] SpirvError),

    #[error("entry point `{entry}` uses execution model {model}, not MeshEXT")]
    NotMeshShader { entry: String, model: u32 },

    #[error("module has no entry point")]
    MissingEntryPoint,

    #[error("only triangle output is supported")]
    UnsupportedTopology,

    #[error("unsupported construct: {0}")]
    Unsupported(String),
}

/// A lowering failure, tagged with the shader it came from.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to lower shader `{shader}`: {kind}")]
pub struct LowerError {
    pub shader: String,
    pub kind: LowerErrorKind,
}

pub type Result<T> = std::result::Result<T, LowerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LowerOptions {
    pub bindings: EngineBindings,
    /// Emit `OpName`s for everything the lowering adds.
    pub debug_names: bool,
}

impl Default for LowerOptions {
    fn default() -> Self {
        Self {
            bindings: EngineBindings::default(),
            debug_names: true,
        }
    }
}

/// Output of a successful lowering.
#[derive(Debug, Clone)]
pub struct LoweredShader {
    pub name: String,
    pub compute: Vec<u32>,
    pub vertex: Vec<u32>,
    pub interface: MeshInterface,
}

impl LoweredShader {
    /// Words per vertex record in the scratch heap.
    pub fn var_count(&self) -> u32 {
        self.interface.var_count
    }
}

pub struct MeshConverter {
    name: String,
    source: MutableBytecode,
    options: LowerOptions,
}

impl MeshConverter {
    /// Parse `words`. `name` only labels errors and logs.
    pub fn new(name: impl Into<String>, words: &[u32], options: LowerOptions) -> Result<Self> {
        let name = name.into();
        let bytecode = Bytecode::new(words).map_err(|e| LowerError {
            shader: name.clone(),
            kind: e.into(),
        })?;
        Ok(Self {
            source: MutableBytecode::new(&bytecode),
            name,
            options,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &LowerOptions {
        &self.options
    }

    fn tag(&self, kind: LowerErrorKind) -> LowerError {
        LowerError {
            shader: self.name.clone(),
            kind,
        }
    }

    /// Discover the entry point, builtins and varyings without lowering.
    pub fn analyze(&self) -> Result<MeshInterface> {
        analysis::analyze(&self.source).map_err(|kind| self.tag(kind))
    }

    /// Produce the compute and vertex modules.
    pub fn lower(&self) -> Result<LoweredShader> {
        let interface = self.analyze()?;
        let compute = compute::emit_comp(&self.source, &interface, &self.options)
            .map_err(|kind| self.tag(kind))?;
        let vertex = vertex::emit_vert(&self.source, &interface, &self.options, compute.bound());

        log::info!(
            "lowered `{}`: {} varyings, {} words per vertex, compute {} words, vertex {} words",
            self.name,
            interface.varyings.len(),
            interface.var_count,
            compute.total_words(),
            vertex.total_words()
        );
        Ok(LoweredShader {
            name: self.name.clone(),
            compute: compute.into_words(),
            vertex: vertex.into_words(),
            interface,
        })
    }
}

/// One-shot lowering.
pub fn lower(name: &str, words: &[u32], options: LowerOptions) -> Result<LoweredShader> {
    MeshConverter::new(name, words, options)?.lower()
}
