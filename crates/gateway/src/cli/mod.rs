//! Command-line interface: `ruche [serve|config validate|config show|version]`.

pub mod config_cmd;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};

use ruche_domain::config::Config;

#[derive(Parser)]
#[command(name = "ruche", about = "Ruche conversation fabric gateway")]
pub struct Cli {
    /// Path to ruche.toml (falls back to $RUCHE_CONFIG, then ./ruche.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the gateway (default).
    Serve,
    /// Configuration inspection.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the version.
    Version,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Validate the configuration file and exit non-zero on errors.
    Validate,
    /// Print the effective configuration as TOML.
    Show,
}

/// Resolve and parse the configuration. A missing file yields defaults.
pub fn load_config(explicit: Option<&Path>) -> anyhow::Result<(Config, PathBuf)> {
    let path = explicit
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os("RUCHE_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("ruche.toml"));

    if !path.exists() {
        tracing::info!(path = %path.display(), "no config file, using defaults");
        return Ok((Config::default(), path));
    }

    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config: Config =
        toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    Ok((config, path))
}
