// mesh_lower: lowers SPIR-V mesh shaders for pipelines without mesh shading
//
//   spirv   decode, edit and re-encode SPIR-V modules
//   mesh    the mesh -> compute + vertex lowering pass
//   sim     CPU reference executor for checking lowered modules
//   shader  file and byte loading, stage tagging
//   cache   per-shader memoisation of lowering results
//   config  TOML configuration

pub mod cache;
pub mod config;
pub mod mesh;
pub mod shader;
pub mod sim;
pub mod spirv;

pub use cache::LoweringCache;
pub use mesh::{lower, LowerError, LowerErrorKind, LowerOptions, LoweredShader, MeshConverter};
