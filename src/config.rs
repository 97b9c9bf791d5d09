//! Configuration management for egg-bin.
//!
//! This module defines the structure of the optional `egg-bin.toml` file
//! and provides functionality to load and parse it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Default name of the configuration file looked up in the working directory.
pub const CONFIG_FILE: &str = "egg-bin.toml";

/// Top-level configuration structure corresponding to `egg-bin.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Program used to run entry modules (default: "node").
    pub runtime: Option<String>,
    /// Extra runtime flags, split like a shell command line.
    pub exec_argv: Option<String>,
    /// Grace period after forwarding a termination signal before killing the child.
    pub shutdown_timeout_ms: Option<u64>,
    /// Settings for the `dev` command.
    #[serde(default)]
    pub dev: DevConfig,
    /// Settings for the `cov` command.
    #[serde(default)]
    pub cov: CovConfig,
}

/// `[dev]` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DevConfig {
    /// Port probed when no `--port` is given (default: 7001).
    pub port: Option<u16>,
    /// Path to the cluster entry module.
    pub server_entry: Option<PathBuf>,
    /// Upper bound for the port probe in milliseconds.
    pub probe_timeout_ms: Option<u64>,
    /// Extra options passed through to the server entry unchanged.
    #[serde(default)]
    pub server_options: BTreeMap<String, serde_json::Value>,
}

/// `[cov]` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CovConfig {
    /// Test file globs used when neither `TESTS` nor positional files are given.
    pub tests: Option<Vec<String>>,
    /// Additional coverage excludes.
    pub excludes: Option<Vec<String>>,
    /// Coverage reporters.
    pub reporters: Option<Vec<String>>,
    /// Coverage collector entry, relative to the working directory.
    pub collector: Option<PathBuf>,
    /// Test runner entry, relative to the working directory.
    pub runner: Option<PathBuf>,
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Picks the config file to load: an explicit path always wins, otherwise
/// `egg-bin.toml` in `cwd` when it exists.
pub fn locate_config(cwd: &Path, explicit: Option<&Path>, disabled: bool) -> Option<PathBuf> {
    if disabled {
        return None;
    }
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let path = cwd.join(CONFIG_FILE);
    path.exists().then_some(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_optional_fields() {
        let raw = r#"
runtime = "/usr/local/bin/node"
exec_argv = "--inspect --trace-warnings"
shutdown_timeout_ms = 1500

[dev]
port = 7100
server_entry = "lib/start-cluster"
probe_timeout_ms = 250

[dev.server_options]
sticky = true
title = "demo"

[cov]
tests = ["test/**/*.test.js"]
excludes = ["scripts/"]
reporters = ["lcov"]
collector = "node_modules/nyc/bin/nyc.js"
runner = "node_modules/mocha/bin/_mocha"
"#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.runtime.as_deref(), Some("/usr/local/bin/node"));
        assert_eq!(config.exec_argv.as_deref(), Some("--inspect --trace-warnings"));
        assert_eq!(config.shutdown_timeout_ms, Some(1500));
        assert_eq!(config.dev.port, Some(7100));
        assert_eq!(
            config.dev.server_entry,
            Some(PathBuf::from("lib/start-cluster"))
        );
        assert_eq!(config.dev.probe_timeout_ms, Some(250));
        assert_eq!(
            config.dev.server_options.get("sticky"),
            Some(&serde_json::Value::Bool(true))
        );
        assert_eq!(config.cov.excludes, Some(vec!["scripts/".to_string()]));
        assert_eq!(config.cov.reporters, Some(vec!["lcov".to_string()]));
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.runtime.is_none());
        assert!(config.dev.port.is_none());
        assert!(config.dev.server_options.is_empty());
        assert!(config.cov.tests.is_none());
    }

    #[test]
    fn locate_config_prefers_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(locate_config(dir.path(), None, false), None);

        std::fs::write(dir.path().join(CONFIG_FILE), "").unwrap();
        assert_eq!(
            locate_config(dir.path(), None, false),
            Some(dir.path().join(CONFIG_FILE))
        );
        assert_eq!(
            locate_config(dir.path(), Some(Path::new("/etc/other.toml")), false),
            Some(PathBuf::from("/etc/other.toml"))
        );
        assert_eq!(locate_config(dir.path(), None, true), None);
    }
}
