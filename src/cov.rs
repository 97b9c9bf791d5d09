//! The `cov` command: run the test suite under a coverage collector.
//!
//! egg-bin only prepares the invocation. The collector entry runs under the
//! runtime, and the collector in turn runs the test runner entry with the
//! discovered test files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;

use crate::config::{Config, CovConfig};
use crate::context::current_env;
use crate::launcher::{self, mode_env, LaunchOptions};
use crate::test_files::{self, resolve_from, split_list};
use crate::RuntimeSettings;

const DEFAULT_TESTS: &str = "test/**/*.test.js";
const DEFAULT_EXCLUDES: [&str; 4] = ["example/", "examples/", "mocks**/", "docs/"];
const DEFAULT_REPORTERS: [&str; 4] = ["text-summary", "json-summary", "json", "lcov"];
const DEFAULT_COLLECTOR: &str = "node_modules/nyc/bin/nyc.js";
const DEFAULT_RUNNER: &str = "node_modules/mocha/bin/_mocha";
const DEFAULT_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_TEST_REPORTER: &str = "spec";
const POWER_ASSERT_LOADER: &str = "intelli-espower-loader";

#[derive(Debug, Clone, Default, Args)]
pub struct CovArgs {
    /// Test files or globs (default: test/**/*.test.js).
    pub files: Vec<String>,
    /// Exclude files matching the glob from coverage; repeatable.
    #[arg(short = 'x', long = "exclude", value_name = "GLOB")]
    pub excludes: Vec<String>,
    /// Module required before running tests; repeatable.
    #[arg(short = 'r', long = "require", value_name = "MODULE")]
    pub requires: Vec<String>,
    /// Per-test timeout in milliseconds.
    #[arg(short = 't', long, value_name = "MS")]
    pub timeout: Option<u64>,
    /// Set EGG_BIN_PREREQUIRE for the test process.
    #[arg(long)]
    pub prerequire: bool,
}

/// Everything needed to spawn the collector.
#[derive(Debug, Clone, PartialEq)]
pub struct CovPlan {
    pub files: Vec<String>,
    pub excludes: Vec<String>,
    pub reporters: Vec<String>,
    pub requires: Vec<String>,
    pub timeout_ms: u64,
    pub test_reporter: String,
    pub collector: PathBuf,
    pub runner: PathBuf,
    pub temp_dir: PathBuf,
    pub env: HashMap<String, String>,
    pub warnings: Vec<String>,
}

impl CovPlan {
    /// Arguments following the collector entry on the command line.
    pub fn collector_argv(&self, runtime: &str) -> Vec<String> {
        let mut argv = vec![
            "--temp-directory".to_string(),
            self.temp_dir.display().to_string(),
        ];
        for reporter in &self.reporters {
            argv.push("--reporter".to_string());
            argv.push(reporter.clone());
        }
        for exclude in &self.excludes {
            argv.push("--exclude".to_string());
            argv.push(exclude.clone());
        }
        argv.push(runtime.to_string());
        argv.push(self.runner.display().to_string());
        argv.push("--timeout".to_string());
        argv.push(self.timeout_ms.to_string());
        argv.push("--reporter".to_string());
        argv.push(self.test_reporter.clone());
        for module in &self.requires {
            argv.push("--require".to_string());
            argv.push(module.clone());
        }
        argv.extend(self.files.iter().cloned());
        argv
    }
}

pub async fn run(
    args: CovArgs,
    cwd: PathBuf,
    settings: &RuntimeSettings,
    config: &Config,
) -> Result<i32> {
    let plan = build_plan(args, &cwd, &current_env(), &config.cov)?;
    for warning in &plan.warnings {
        eprintln!("{}", warning);
    }
    if plan.files.is_empty() {
        return Ok(0);
    }

    clean_coverage(&cwd, &plan.temp_dir).await?;

    let argv = plan.collector_argv(&settings.runtime);
    let options = LaunchOptions {
        runtime: settings.runtime.clone(),
        env: plan.env.clone(),
        exec_argv: settings.exec_argv.clone(),
        cwd: Some(cwd.clone()),
        shutdown: settings.shutdown,
    };
    tracing::debug!(collector = %plan.collector.display(), ?argv, "starting coverage run");

    let child = launcher::launch(&plan.collector, &argv, &options)
        .with_context(|| format!("failed to start {}", plan.collector.display()))?;
    Ok(child.wait().await?)
}

pub fn build_plan(
    args: CovArgs,
    cwd: &Path,
    env: &HashMap<String, String>,
    config: &CovConfig,
) -> Result<CovPlan> {
    let mut warnings = Vec::new();

    let patterns = match env.get("TESTS").map(|tests| split_list(tests)) {
        Some(patterns) if !patterns.is_empty() => patterns,
        _ if !args.files.is_empty() => args.files.clone(),
        _ => config
            .tests
            .clone()
            .unwrap_or_else(|| vec![DEFAULT_TESTS.to_string()]),
    };
    let files = test_files::expand(cwd, &patterns)?;
    if files.is_empty() {
        warnings.push(format!(
            "[egg-bin] no test files found for {}",
            patterns.join(", ")
        ));
    }

    let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
    excludes.extend(config.excludes.clone().unwrap_or_default());
    if let Some(value) = env.get("COV_EXCLUDES") {
        excludes.extend(split_list(value));
    }
    excludes.extend(args.excludes.iter().cloned());

    let mut requires = Vec::new();
    if cwd.join("node_modules").join(POWER_ASSERT_LOADER).exists() {
        requires.push(POWER_ASSERT_LOADER.to_string());
    }
    for module in args.requires {
        if module == POWER_ASSERT_LOADER {
            warnings.push(format!(
                "[egg-bin] manually require `{}` is not necessary, it is loaded automatically",
                POWER_ASSERT_LOADER
            ));
            continue;
        }
        requires.push(module);
    }

    let timeout_ms = match args.timeout {
        Some(timeout) => timeout,
        None => match env.get("TEST_TIMEOUT") {
            Some(value) => value
                .parse()
                .with_context(|| format!("invalid TEST_TIMEOUT {}", value))?,
            None => DEFAULT_TIMEOUT_MS,
        },
    };
    let test_reporter = env
        .get("TEST_REPORTER")
        .cloned()
        .unwrap_or_else(|| DEFAULT_TEST_REPORTER.to_string());

    let reporters = config
        .reporters
        .clone()
        .unwrap_or_else(|| DEFAULT_REPORTERS.iter().map(|s| s.to_string()).collect());
    let collector = resolve_from(
        cwd,
        config
            .collector
            .as_deref()
            .unwrap_or(Path::new(DEFAULT_COLLECTOR)),
    );
    let runner = resolve_from(
        cwd,
        config.runner.as_deref().unwrap_or(Path::new(DEFAULT_RUNNER)),
    );

    let mut child_env = mode_env(env, "test");
    if args.prerequire {
        child_env.insert("EGG_BIN_PREREQUIRE".to_string(), "true".to_string());
    }

    Ok(CovPlan {
        files,
        excludes,
        reporters,
        requires,
        timeout_ms,
        test_reporter,
        collector,
        runner,
        temp_dir: cwd.join("node_modules").join(".nyc_output"),
        env: child_env,
        warnings,
    })
}

// Removes reports left over from a previous run.
async fn clean_coverage(cwd: &Path, temp_dir: &Path) -> Result<()> {
    for dir in [cwd.join("coverage"), temp_dir.to_path_buf()] {
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => tracing::debug!(dir = %dir.display(), "removed"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("failed to remove {}", dir.display()))
            }
        }
    }
    Ok(())
}
