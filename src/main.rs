// =============================================================================
// MESH-LOWER - Mesh shader to compute + vertex lowering driver
// =============================================================================
//
// Command line front end for the mesh_lower library.
//
// PIPELINE:
// ┌─────────────────────────────────────────────────────────────────┐
// │  mesh.spv (MeshEXT)                                             │
// │    └── MeshConverter                                            │
// │          ├── <stem>.comp.spv  writes vertices + indices to heap │
// │          └── <stem>.vert.spv  reads one vertex per invocation   │
// └─────────────────────────────────────────────────────────────────┘
//
// COMMANDS:
// 1. lower    convert one module and write both outputs
// 2. inspect  print the discovered builtins and varyings
// 3. watch    re-lower whenever the input changes
//
// =============================================================================

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mesh_lower::cache::LoweringCache;
use mesh_lower::config::Config;
use mesh_lower::mesh::{MeshConverter, MeshInterface};
use mesh_lower::shader;
use notify::Watcher;
use std::path::{Path, PathBuf};
use std::sync::mpsc;

/// Lower SPIR-V mesh shaders to a compute prepass plus a vertex shader
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Lower a mesh shader and write the compute and vertex modules
    Lower {
        /// Mesh shader module
        input: PathBuf,

        /// Output directory (defaults to [output] directory from the config)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the entry point, builtins and varyings of a mesh shader
    Inspect {
        /// Mesh shader module
        input: PathBuf,
    },

    /// Lower a mesh shader again every time it changes on disk
    Watch {
        /// Mesh shader module
        input: PathBuf,

        /// Output directory (defaults to [output] directory from the config)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration before logging so the level can come from it
    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load(),
    };

    init_logging(&config);
    log::info!("mesh-lower {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Lower { input, output } => {
            let dir = output.unwrap_or_else(|| config.output.directory.clone());
            lower_file(&config, &LoweringCache::new(config.lower_options()), &input, &dir)?;
        }
        Commands::Inspect { input } => inspect_file(&config, &input)?,
        Commands::Watch { input, output } => {
            let dir = output.unwrap_or_else(|| config.output.directory.clone());
            watch_file(&config, &input, &dir)?;
        }
    }

    Ok(())
}

fn init_logging(config: &Config) {
    use env_logger::Builder;

    let mut builder = Builder::from_default_env();
    builder.filter_level(config.level_filter());
    // RUST_LOG still wins over the config file
    if let Ok(spec) = std::env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    }
    builder.init();
}

// =============================================================================
// COMMANDS
// =============================================================================

fn shader_name(input: &Path) -> String {
    input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "shader".to_string())
}

fn lower_file(config: &Config, cache: &LoweringCache, input: &Path, dir: &Path) -> Result<()> {
    let words = shader::load_spirv(input)?;
    let name = shader_name(input);

    // Step 1: lower (through the cache unless disabled)
    let lowered = if config.cache.enabled {
        cache.get_or_lower(&name, &words)?
    } else {
        std::sync::Arc::new(mesh_lower::mesh::lower(&name, &words, config.lower_options())?)
    };

    if config.debug.dump_interface {
        print_interface(&lowered.interface);
    }

    // Step 2: write both stages
    let written = shader::write_lowered(dir, &name, &lowered)
        .with_context(|| format!("Failed to write lowered modules for {:?}", input))?;
    for path in written {
        println!("{}", path.display());
    }
    Ok(())
}

fn inspect_file(config: &Config, input: &Path) -> Result<()> {
    let words = shader::load_spirv(input)?;
    let converter = MeshConverter::new(shader_name(input), &words, config.lower_options())?;
    let interface = converter.analyze()?;
    print_interface(&interface);
    Ok(())
}

fn print_interface(interface: &MeshInterface) {
    let entry = &interface.entry;
    println!("entry point   {} (%{})", entry.name, entry.function);
    println!(
        "local size    {}x{}x{}",
        entry.local_size[0], entry.local_size[1], entry.local_size[2]
    );
    println!(
        "max output    {} vertices, {} primitives",
        entry.max_vertices, entry.max_primitives
    );

    let builtins = &interface.builtins;
    let slots = [
        ("NumWorkgroups", builtins.num_workgroups),
        ("WorkgroupSize", builtins.workgroup_size),
        ("WorkgroupId", builtins.workgroup_id),
        ("LocalInvocationId", builtins.local_invocation_id),
        ("LocalInvocationIndex", builtins.local_invocation_index),
        ("PrimitiveTriangleIndicesEXT", builtins.primitive_indices),
        ("per-vertex block", builtins.per_vertex),
    ];
    for (label, id) in slots {
        if let Some(id) = id {
            println!("builtin       {label} = %{id}");
        }
    }

    for varying in &interface.varyings {
        let location = varying
            .location
            .map(|l| format!("location {l}"))
            .unwrap_or_else(|| "builtin".to_string());
        println!(
            "varying       %{} ({location}): {} words at offset {}",
            varying.variable, varying.leaf_count, varying.write_offset
        );
    }
    println!("words/vertex  {}", interface.var_count);
}

fn watch_file(config: &Config, input: &Path, dir: &Path) -> Result<()> {
    let cache = LoweringCache::new(config.lower_options());
    if let Err(e) = lower_file(config, &cache, input, dir) {
        log::error!("{:#}", e);
    }

    let (tx, rx) = mpsc::channel::<notify::Result<notify::Event>>();
    let mut watcher = notify::recommended_watcher(tx).context("Failed to create file watcher")?;
    watcher
        .watch(input, notify::RecursiveMode::NonRecursive)
        .with_context(|| format!("Failed to watch {:?}", input))?;
    log::info!("Watching {:?} for changes", input);

    for event in rx {
        let event = event.context("File watcher error")?;
        if !(event.kind.is_modify() || event.kind.is_create()) {
            continue;
        }
        log::info!("{:?} changed, lowering again", input);
        if let Err(e) = lower_file(config, &cache, input, dir) {
            // Keep watching; the next save may fix it
            log::error!("{:#}", e);
        }
    }
    Ok(())
}
