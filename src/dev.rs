//! The `dev` command: start the application server in cluster mode.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Args;

use crate::config::{Config, DevConfig};
use crate::context::{current_env, ClusterFlag, DevFlags, InvocationContext};
use crate::framework::NodeModulesResolver;
use crate::launcher::{self, mode_env, LaunchOptions};
use crate::port::TcpPortProber;
use crate::resolve::{ArgumentResolver, DEFAULT_PORT};
use crate::RuntimeSettings;

const SERVER_ENTRY_ENV: &str = "EGG_BIN_SERVER_ENTRY";
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, Args)]
pub struct DevArgs {
    /// Directory of the application (default: current directory).
    pub dir: Option<String>,
    /// Directory of the application, used when no positional directory is given.
    #[arg(long = "baseDir", alias = "base-dir", value_name = "DIR")]
    pub base_dir: Option<String>,
    /// Number of app workers; one per CPU core when given without a value.
    #[arg(short = 'c', long, value_name = "N", value_parser = parse_workers)]
    pub cluster: Option<Option<usize>>,
    /// Listening port (default: 7001, or the next free port).
    #[arg(short = 'p', long, value_parser = clap::value_parser!(u16).range(1..))]
    pub port: Option<u16>,
    /// Framework to load: an absolute path or a package name.
    #[arg(long)]
    pub framework: Option<String>,
}

fn parse_workers(value: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(0) => Err("cluster must be at least 1".to_string()),
        Ok(count) => Ok(count),
        Err(err) => Err(err.to_string()),
    }
}

pub async fn run(
    args: DevArgs,
    cwd: PathBuf,
    settings: &RuntimeSettings,
    config: &Config,
) -> Result<i32> {
    let context = build_context(args, cwd, current_env(), settings.exec_argv.clone(), &config.dev);

    let timeout = config
        .dev
        .probe_timeout_ms
        .unwrap_or(DEFAULT_PROBE_TIMEOUT_MS);
    let resolver = ArgumentResolver::new(
        NodeModulesResolver,
        TcpPortProber::new(Duration::from_millis(timeout)),
    )
    .with_default_port(config.dev.port.unwrap_or(DEFAULT_PORT));
    let resolution = resolver.resolve(&context).await?;
    for warning in &resolution.warnings {
        eprintln!("{}", warning);
    }

    let argv = resolution.config.to_argv()?;
    let entry = server_entry(&context.cwd, &context.env, &config.dev)?;
    let options = LaunchOptions {
        runtime: settings.runtime.clone(),
        env: mode_env(&context.env, "development"),
        exec_argv: context.exec_argv.clone(),
        cwd: Some(context.cwd.clone()),
        shutdown: settings.shutdown,
    };
    tracing::debug!(
        entry = %entry.display(),
        ?argv,
        exec_argv = ?options.exec_argv,
        "starting dev server"
    );

    let child = launcher::launch(&entry, &argv, &options)
        .with_context(|| format!("failed to start {}", entry.display()))?;
    Ok(child.wait().await?)
}

fn build_context(
    args: DevArgs,
    cwd: PathBuf,
    env: HashMap<String, String>,
    exec_argv: Vec<String>,
    config: &DevConfig,
) -> InvocationContext {
    let flags = DevFlags {
        base_dir: args.base_dir,
        cluster: ClusterFlag::from_arg(args.cluster),
        port: args.port,
        framework: args.framework,
        server_options: config.server_options.clone(),
    };
    InvocationContext::new(cwd)
        .with_positionals(args.dir.into_iter().collect())
        .with_flags(flags)
        .with_env(env)
        .with_exec_argv(exec_argv)
}

// The cluster entry ships next to the binary as `../lib/start-cluster`.
fn server_entry(cwd: &Path, env: &HashMap<String, String>, config: &DevConfig) -> Result<PathBuf> {
    if let Some(entry) = env.get(SERVER_ENTRY_ENV).filter(|entry| !entry.is_empty()) {
        return Ok(cwd.join(entry));
    }
    if let Some(entry) = &config.server_entry {
        return Ok(cwd.join(entry));
    }
    let exe = std::env::current_exe().context("failed to locate the egg-bin executable")?;
    let bin_dir = exe
        .parent()
        .ok_or_else(|| anyhow!("executable {} has no parent directory", exe.display()))?;
    Ok(bin_dir.join("..").join("lib").join("start-cluster"))
}
