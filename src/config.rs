// =============================================================================
// CONFIGURATION - Load settings from mesh-lower.toml
// =============================================================================
//
// This module handles loading and parsing configuration from mesh-lower.toml.
// Provides sensible defaults if the config file is missing.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::mesh::{EngineBindings, LowerOptions};

pub const DEFAULT_CONFIG: &str = "mesh-lower.toml";

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub engine: EngineBindings,
    pub output: OutputConfig,
    pub debug: DebugConfig,
    pub cache: CacheConfig,
}

/// Output settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub debug_names: bool,
    pub directory: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            debug_names: true,
            directory: PathBuf::from("build"),
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub log_level: String,
    pub dump_interface: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            dump_interface: false,
        }
    }
}

/// Cache settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Config {
    /// Load configuration from the default file, falling back to defaults on error
    pub fn load() -> Self {
        Self::load_from_path(DEFAULT_CONFIG).unwrap_or_else(|e| {
            log::warn!("Failed to load {}: {:#}. Using defaults.", DEFAULT_CONFIG, e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Options handed to the converter
    pub fn lower_options(&self) -> LowerOptions {
        LowerOptions {
            bindings: self.engine,
            debug_names: self.output.debug_names,
        }
    }

    /// Log level as a `log` filter, defaulting to Info
    pub fn level_filter(&self) -> log::LevelFilter {
        match self.debug.log_level.to_lowercase().as_str() {
            "off" => log::LevelFilter::Off,
            "error" => log::LevelFilter::Error,
            "warn" => log::LevelFilter::Warn,
            "info" => log::LevelFilter::Info,
            "debug" => log::LevelFilter::Debug,
            "trace" => log::LevelFilter::Trace,
            _ => {
                log::warn!(
                    "Unknown log level '{}', defaulting to info",
                    self.debug.log_level
                );
                log::LevelFilter::Info
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from_path(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.engine, EngineBindings::default());
        assert!(config.output.debug_names);
        assert!(config.cache.enabled);
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[engine]\ndescriptor_set = 3\nheap_binding = 7\n\n[debug]\nlog_level = \"TRACE\"").unwrap();

        let config = Config::load_from_path(file.path()).unwrap();
        assert_eq!(config.engine.descriptor_set, 3);
        assert_eq!(config.engine.heap_binding, 7);
        assert_eq!(config.engine.descriptor_binding, 1);
        assert_eq!(config.level_filter(), log::LevelFilter::Trace);
        assert_eq!(config.lower_options().bindings.heap_binding, 7);
    }

    #[test]
    fn parse_errors_name_the_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[engine\n").unwrap();
        let err = Config::load_from_path(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse config file"));
    }
}
