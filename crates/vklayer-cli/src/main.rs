use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use vklayer_core::{LayerConfig, MessageSink, ReportFlags};
use vklayer_tracker::spirv;
use vklayer_tracker::ValidationContext;

#[derive(Parser)]
#[command(name = "vklayer")]
#[command(about = "vklayer - shadow-state validation for Vulkan-style command streams")]
#[command(version)]
struct Cli {
    /// Configuration file path (defaults to the platform search path)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a SPIR-V module and print its reflected interface
    Shader {
        /// SPIR-V binary
        file: PathBuf,
    },

    /// Print the effective configuration
    Config,
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<(PathBuf, LayerConfig)> {
    match path {
        // An explicit path must load.
        Some(path) => {
            let config = LayerConfig::load(&path)
                .map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))?;
            Ok((path, config))
        }
        None => {
            let path = vklayer_core::config::default_config_path();
            let config = LayerConfig::load_or_default(&path);
            Ok((path, config))
        }
    }
}

fn main() -> anyhow::Result<()> {
    vklayer_common::init_logging();

    let cli = Cli::parse();
    let (config_path, config) = load_config(cli.config)?;

    match cli.command {
        Commands::Shader { file } => {
            let bytes = std::fs::read(&file)?;
            info!("checking {} ({} bytes)", file.display(), bytes.len());

            let sink = Arc::new(MessageSink::with_history_limit(config.report.history_limit));
            let context = ValidationContext::new(config, Arc::clone(&sink));
            let module = context.create_shader_module(&bytes);

            for diagnostic in sink.drain() {
                if diagnostic.flags.intersects(ReportFlags::SURFACED) {
                    eprintln!(
                        "[{}] {:?}: {}",
                        diagnostic.layer_prefix, diagnostic.code, diagnostic.message
                    );
                }
            }
            if module.is_err() {
                anyhow::bail!("{} is not a valid SPIR-V module", file.display());
            }

            let reflected = spirv::parse(&bytes)?;
            println!("SPIR-V {}.{}", reflected.version.0, reflected.version.1);
            println!();
            for entry in &reflected.entry_points {
                println!("Entry point `{}` ({:?})", entry.name, entry.model);
                for input in &entry.inputs {
                    println!("    in  location {:>2}: {}", input.location, input.ty);
                }
                for output in &entry.outputs {
                    println!("    out location {:>2}: {}", output.location, output.ty);
                }
                println!();
            }
            if !reflected.descriptor_slots.is_empty() {
                println!("Descriptor slots:");
                for slot in &reflected.descriptor_slots {
                    println!(
                        "    set {} binding {}: {} ({:?})",
                        slot.set, slot.binding, slot.ty, slot.storage
                    );
                }
            }
        }

        Commands::Config => {
            println!("# platform: {}", vklayer_common::platform::platform_name());
            println!("# source:   {}", config_path.display());
            println!();
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
