//! Tapedeck CLI
//!
//! Subcommands:
//! - `tapedeck serve` - Run the control API
//! - `tapedeck check-config <file>` - Validate a configuration file
//! - `tapedeck command --device <spec>` - Print the ffmpeg command line

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use tapedeck::capture::{resolve_device, CaptureCommand, CaptureOptions};
use tapedeck::config::Config;
use tapedeck::network::Server;

#[derive(Parser)]
#[command(name = "tapedeck")]
#[command(about = "HTTP control plane for ffmpeg capture sessions")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP control API
    Serve {
        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Listen address, overrides `server.bind`
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },

    /// Validate a configuration file and exit
    CheckConfig {
        /// TOML configuration file
        file: PathBuf,
    },

    /// Print the ffmpeg command a start request would run
    Command {
        /// Device alias or raw V4L2/ALSA descriptor
        #[arg(short, long)]
        device: String,

        /// Output file, defaults to `out.<container>`
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(Config::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tapedeck=info")),
        )
        .init();

    match cli.command {
        Commands::Serve { config, bind } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(bind) = bind {
                config.server.bind = bind;
            }

            info!("Tapedeck v{}", env!("CARGO_PKG_VERSION"));
            let server = Server::new(config).context("Failed to initialise server")?;
            server.run().await.context("Server error")?;
        }
        Commands::CheckConfig { file } => {
            let config = load_config(Some(&file))?;
            println!(
                "{}: ok ({} device aliases, recordings in {})",
                file.display(),
                config.devices.len(),
                config.capture.recordings_dir.display()
            );
        }
        Commands::Command {
            device,
            output,
            config,
        } => {
            let config = load_config(config.as_deref())?;
            let settings = CaptureOptions::default()
                .resolve(&config.defaults, &config.capture)
                .context("Invalid default options")?;
            let resolved = resolve_device(&device, &config.devices)
                .with_context(|| format!("Cannot resolve device {device}"))?;
            let output =
                output.unwrap_or_else(|| PathBuf::from(format!("out.{}", settings.container)));

            let command =
                CaptureCommand::build(&config.capture.ffmpeg_path, &resolved, &settings, &output);
            println!("{}", command.display());
        }
    }

    Ok(())
}
