//! glb-convert - glTF/GLB conversion tool
//!
//! Packs glTF scenes into GLB containers, unpacks GLB files into editable glTF,
//! and merges documents as node LODs.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use glb_convert::config::{self, MANIFEST_FILE_NAME};
use glb_convert::{PackOptions, merge_lod_files, pack_file, unpack_file};

#[derive(Parser)]
#[command(name = "glb-convert")]
#[command(about = "glTF/GLB packing, unpacking and LOD merge tool")]
#[command(version)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pack a .gltf (or re-pack a .glb) into a single .glb
    Pack {
        /// Input .gltf or .glb file
        input: PathBuf,

        /// Output .glb file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Unpack a .glb into .gltf, .bin and image files
    Unpack {
        /// Input .glb file
        input: PathBuf,

        /// Output directory (defaults to the input's directory)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Base name of the written files (defaults to the input file stem)
        #[arg(long)]
        name: Option<String>,
    },

    /// Merge documents as node LODs
    Lod {
        /// Highest detail document
        primary: PathBuf,

        /// Lower detail documents, most detailed first
        #[arg(required = true)]
        lods: Vec<PathBuf>,

        /// Output .glb or .gltf file
        #[arg(short, long)]
        output: PathBuf,

        /// Screen coverage per level, e.g. 0.5,0.2,0.01
        #[arg(long, value_delimiter = ',')]
        screen_coverage: Vec<f64>,

        /// Reuse the primary's materials for every LOD
        #[arg(long)]
        shared_materials: bool,
    },

    /// Run every job of a batch manifest
    Build {
        /// Path to glb-convert.toml
        #[arg(default_value = MANIFEST_FILE_NAME)]
        manifest: PathBuf,

        /// Output directory (overrides manifest)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate a batch manifest without building
    Check {
        /// Path to glb-convert.toml
        #[arg(default_value = MANIFEST_FILE_NAME)]
        manifest: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();

    match cli.command {
        Commands::Pack { input, output } => {
            let output = output.unwrap_or_else(|| input.with_extension("glb"));
            if output == input {
                anyhow::bail!("Output would overwrite the input {:?}; pass -o", input);
            }
            tracing::info!("Packing {:?} -> {:?}", input, output);
            pack_file(&input, &output, &PackOptions::default())
                .with_context(|| format!("Failed to pack {:?}", input))?;
            tracing::info!("Done!");
        }

        Commands::Unpack {
            input,
            output,
            name,
        } => {
            let dir = output.unwrap_or_else(|| {
                input
                    .parent()
                    .map(PathBuf::from)
                    .unwrap_or_default()
            });
            let summary = unpack_file(&input, &dir, name.as_deref())
                .with_context(|| format!("Failed to unpack {:?}", input))?;
            if summary.skipped_references > 0 {
                tracing::warn!(
                    "{} extension references pointed at missing bufferViews and were skipped",
                    summary.skipped_references
                );
            }
            tracing::info!("Done!");
        }

        Commands::Lod {
            primary,
            lods,
            output,
            screen_coverage,
            shared_materials,
        } => {
            let inputs: Vec<PathBuf> = std::iter::once(primary).chain(lods).collect();
            merge_lod_files(&inputs, &output, &screen_coverage, shared_materials)
                .with_context(|| format!("Failed to merge LODs into {:?}", output))?;
            tracing::info!("Done!");
        }

        Commands::Build { manifest, output } => {
            tracing::info!("Building from {:?}", manifest);
            let batch = config::load_manifest(&manifest)?;
            let report = config::build_all(&batch, config::manifest_dir(&manifest), output.as_deref())?;
            tracing::info!(
                "Build complete! {} packed, {} unpacked, {} LOD merges",
                report.packed,
                report.unpacked,
                report.merged
            );
        }

        Commands::Check { manifest } => {
            tracing::info!("Checking manifest {:?}", manifest);
            let batch = config::load_manifest(&manifest)?;
            config::validate(&batch, config::manifest_dir(&manifest))?;
            tracing::info!("Manifest is valid!");
        }
    }

    Ok(())
}
