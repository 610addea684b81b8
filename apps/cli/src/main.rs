use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use bitlink_core::flash;
use bitlink_core::hex::container_block_ids;
use bitlink_core::HardwareVersion;

#[derive(Parser, Debug)]
#[command(author, version, about = "micro:bit BLE companion tool", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Prepare flash artifacts from a firmware hex for one hardware version
    Prepare {
        /// Firmware container (universal or plain application hex)
        hex: PathBuf,

        /// Target hardware: v1 or v2
        #[arg(long)]
        hardware: String,

        /// Transport address of the target device, passed through to the
        /// flasher handoff
        #[arg(long, default_value = "")]
        address: String,

        /// Output directory for the artifacts
        #[arg(long, default_value = "out")]
        out: PathBuf,
    },

    /// List the hardware block ids present in a firmware container
    Inspect {
        /// Firmware container (universal or plain application hex)
        hex: PathBuf,
    },
}

fn parse_hardware(value: &str) -> Result<HardwareVersion> {
    match value.to_lowercase().as_str() {
        "v1" | "1" => Ok(HardwareVersion::V1),
        "v2" | "2" => Ok(HardwareVersion::V2),
        other => bail!("unknown hardware version: {other} (expected v1 or v2)"),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    match args.command {
        Command::Prepare {
            hex,
            hardware,
            address,
            out,
        } => {
            let hardware = parse_hardware(&hardware)?;
            let container = std::fs::read(&hex)
                .with_context(|| format!("reading {}", hex.display()))?;

            let request = flash::prepare(&container, hardware, &address, &out)?;
            info!(hardware = %request.hardware, "artifacts written to {}", out.display());
            println!("method:   {:?}", request.method);
            println!("artifact: {}", request.path.display());
            println!("base:     {:#x}", request.app_base);
            println!("size:     {} bytes", request.app_size);
        }
        Command::Inspect { hex } => {
            let container = std::fs::read(&hex)
                .with_context(|| format!("reading {}", hex.display()))?;
            let ids = container_block_ids(&container)?;
            if ids.is_empty() {
                println!("plain application hex (no block markers)");
            } else {
                for id in ids {
                    let target = match id {
                        0x9900 => " (V1)",
                        0x9903 => " (V2)",
                        _ => "",
                    };
                    println!("{id:#06x}{target}");
                }
            }
        }
    }
    Ok(())
}
