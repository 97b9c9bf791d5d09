//! Per-invocation input for the `dev` command.
//!
//! An `InvocationContext` is a snapshot of everything the resolver is allowed
//! to look at: the working directory, positional arguments, parsed flags, the
//! parent environment and the runtime flags to forward. It is built once and
//! never mutated.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// Worker count requested with `-c/--cluster`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterFlag {
    /// Flag given without a value: one worker per available core.
    Auto,
    /// Explicit worker count (always >= 1).
    Count(usize),
}

impl ClusterFlag {
    /// Maps clap's `Option<Option<usize>>` shape onto the flag.
    pub fn from_arg(arg: Option<Option<usize>>) -> Option<Self> {
        match arg {
            None => None,
            Some(None) => Some(ClusterFlag::Auto),
            Some(Some(count)) => Some(ClusterFlag::Count(count)),
        }
    }
}

/// Flags understood by `dev`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DevFlags {
    pub base_dir: Option<String>,
    pub cluster: Option<ClusterFlag>,
    pub port: Option<u16>,
    pub framework: Option<String>,
    /// Extra keys forwarded to the server entry as-is.
    pub server_options: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub cwd: PathBuf,
    pub positionals: Vec<String>,
    pub flags: DevFlags,
    pub env: HashMap<String, String>,
    pub exec_argv: Vec<String>,
}

impl InvocationContext {
    pub fn new(cwd: PathBuf) -> Self {
        Self {
            cwd,
            positionals: Vec::new(),
            flags: DevFlags::default(),
            env: HashMap::new(),
            exec_argv: Vec::new(),
        }
    }

    pub fn with_positionals(mut self, positionals: Vec<String>) -> Self {
        self.positionals = positionals;
        self
    }

    pub fn with_flags(mut self, flags: DevFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_exec_argv(mut self, exec_argv: Vec<String>) -> Self {
        self.exec_argv = exec_argv;
        self
    }
}

/// Snapshot of the parent environment. Entries that are not valid UTF-8 are skipped.
pub fn current_env() -> HashMap<String, String> {
    std::env::vars_os()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
        .collect()
}
