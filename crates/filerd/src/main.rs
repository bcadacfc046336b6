//! filerd: content store filesystem daemon
//!
//! Usage:
//!   filerd [--config /etc/filer/config.toml] [--mode fuse|projection] [--init-store]
//!
//! Modes:
//!   projection - Caching projection provider over the virtual root [default]
//!   fuse       - Kernel FUSE mount with local write buffering (feature: fuse)

mod daemon;
mod metrics;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use tracing::info;

use filer_core::config::FilerConfig;

#[derive(Parser, Debug)]
#[command(name = "filerd", version, about = "Content store filesystem daemon")]
struct Cli {
    /// Path to filer.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "FILER_CONFIG",
        default_value = "/etc/filer/config.toml"
    )]
    config: PathBuf,

    /// Daemon mode
    #[arg(long, default_value = "projection")]
    mode: Mode,

    /// Mount point (overrides fuse.mountpoint / projection.virtual_root)
    #[arg(long)]
    mountpoint: Option<PathBuf>,

    /// Create the structural directories in the backing store before the
    /// readiness check (first run against a fresh store)
    #[arg(long)]
    init_store: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "FILER_LOG", default_value = "info")]
    log: String,

    /// Log format (json, text)
    #[arg(long, env = "FILER_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
pub enum Mode {
    /// FUSE mount with write buffering
    Fuse,
    /// Caching projection provider (default)
    Projection,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log, &cli.log_format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        mode = ?cli.mode,
        config = %cli.config.display(),
        "filerd starting"
    );

    let mut config = load_config(&cli.config).await?;
    if let Some(mountpoint) = cli.mountpoint {
        apply_mountpoint(&mut config, cli.mode, mountpoint);
    }

    daemon::run(config, cli.mode, cli.init_store).await
}

fn apply_mountpoint(config: &mut FilerConfig, mode: Mode, mountpoint: PathBuf) {
    match mode {
        Mode::Fuse => config.fuse.mountpoint = mountpoint,
        Mode::Projection => config.projection.virtual_root = mountpoint,
    }
}

async fn load_config(path: &Path) -> Result<FilerConfig> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config {}", path.display()))
    } else {
        tracing::warn!(
            "config file not found: {}  (using defaults)",
            path.display()
        );
        Ok(FilerConfig::default())
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}
