// Shader binary loading and saving
//
// SPIR-V files are little-endian 32-bit words. This module turns files and
// byte slices into word vectors, writes lowered modules back out, and tags
// them with the Vulkan stage they are meant for.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ash::vk;

use crate::mesh::LoweredShader;

/// Convert raw SPIR-V bytes into words, checking alignment and byte order.
pub fn words_from_bytes(bytes: &[u8]) -> Result<Vec<u32>> {
    // read_spv handles byte-swapped modules and copies into aligned storage
    ash::util::read_spv(&mut std::io::Cursor::new(bytes)).context("Failed to read SPIR-V bytes")
}

pub fn bytes_from_words(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// Load a SPIR-V module from disk.
pub fn load_spirv<P: AsRef<Path>>(path: P) -> Result<Vec<u32>> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read shader: {:?}", path))?;
    let words = words_from_bytes(&bytes).with_context(|| format!("Invalid SPIR-V file: {:?}", path))?;
    log::debug!("Loaded {} words from {:?}", words.len(), path);
    Ok(words)
}

/// Write a SPIR-V module to disk, creating parent directories.
pub fn write_spirv<P: AsRef<Path>>(path: P, words: &[u32]) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output directory: {:?}", parent))?;
    }
    std::fs::write(path, bytes_from_words(words)).with_context(|| format!("Failed to write shader: {:?}", path))?;
    log::info!("Wrote {:?} ({} words)", path, words.len());
    Ok(())
}

/// One lowered module and the pipeline stage it targets.
#[derive(Debug, Clone)]
pub struct StageModule<'a> {
    pub stage: vk::ShaderStageFlags,
    pub words: &'a [u32],
}

impl StageModule<'_> {
    /// File suffix used when writing this stage.
    pub fn suffix(&self) -> &'static str {
        if self.stage == vk::ShaderStageFlags::COMPUTE {
            "comp"
        } else if self.stage == vk::ShaderStageFlags::VERTEX {
            "vert"
        } else {
            "spv"
        }
    }
}

/// The compute prepass and the vertex stage, in the order they run.
pub fn stages(shader: &LoweredShader) -> [StageModule<'_>; 2] {
    [
        StageModule {
            stage: vk::ShaderStageFlags::COMPUTE,
            words: &shader.compute,
        },
        StageModule {
            stage: vk::ShaderStageFlags::VERTEX,
            words: &shader.vertex,
        },
    ]
}

/// Write both stages as `<stem>.comp.spv` and `<stem>.vert.spv` under `dir`.
pub fn write_lowered(dir: &Path, stem: &str, shader: &LoweredShader) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    for module in stages(shader) {
        let path = dir.join(format!("{stem}.{}.spv", module.suffix()));
        write_spirv(&path, module.words)?;
        written.push(path);
    }
    Ok(written)
}
