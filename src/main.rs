//! egg-bin: developer tooling for egg applications.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, loads the optional `egg-bin.toml`, sets up logging and hands
//! off to the `dev` or `cov` command. The process exits with the code of the
//! child the command launched.

mod config;
mod context;
mod cov;
mod dev;
mod error;
mod framework;
mod launcher;
mod port;
mod resolve;
mod test_files;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::cov::CovArgs;
use crate::dev::DevArgs;
use crate::launcher::{ShutdownConfig, DEFAULT_RUNTIME};

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "egg-bin",
    version,
    about = "Developer tooling for egg applications",
    styles = help_styles()
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Path to egg-bin.toml configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Ignore any egg-bin.toml in the current directory.
    #[arg(long, global = true)]
    no_config: bool,
    /// Program used to run entry modules (default: node).
    #[arg(long, global = true)]
    runtime: Option<String>,
    /// Runtime flag forwarded to the child, e.g. --exec-arg=--inspect; repeatable.
    #[arg(long = "exec-arg", value_name = "FLAG", allow_hyphen_values = true, global = true)]
    exec_args: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start server at local dev mode.
    Dev(DevArgs),
    /// Run tests with coverage.
    Cov(CovArgs),
}

/// Runtime configuration derived from CLI arguments and the config file.
#[derive(Debug, Clone)]
struct RuntimeSettings {
    runtime: String,
    exec_argv: Vec<String>,
    shutdown: ShutdownConfig,
}

impl RuntimeSettings {
    fn from_cli(cli: &Cli, config: &Config) -> Result<Self> {
        let runtime = cli
            .runtime
            .clone()
            .or_else(|| config.runtime.clone())
            .unwrap_or_else(|| DEFAULT_RUNTIME.to_string());
        let mut exec_argv = match &config.exec_argv {
            Some(raw) => shell_words::split(raw)
                .with_context(|| format!("failed to parse exec_argv {}", raw))?,
            None => Vec::new(),
        };
        exec_argv.extend(cli.exec_args.iter().cloned());
        let shutdown = config
            .shutdown_timeout_ms
            .map(ShutdownConfig::new)
            .unwrap_or_default();
        Ok(Self {
            runtime,
            exec_argv,
            shutdown,
        })
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_logging();
    let cli = Cli::parse();

    let cwd = std::env::current_dir().context("failed to resolve current dir")?;
    let config = match config::locate_config(&cwd, cli.config.as_deref(), cli.no_config) {
        Some(path) => config::load_config(&path)?,
        None => Config::default(),
    };
    let settings = RuntimeSettings::from_cli(&cli, &config)?;

    let code = match cli.command {
        Commands::Dev(args) => dev::run(args, cwd, &settings, &config).await?,
        Commands::Cov(args) => cov::run(args, cwd, &settings, &config).await?,
    };
    Ok(exit_status(code))
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("EGG_BIN_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

fn exit_status(code: i32) -> ExitCode {
    ExitCode::from(exit_byte(code))
}

// Codes outside 0..=255 cannot be returned as-is; they still mean failure.
fn exit_byte(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
}
