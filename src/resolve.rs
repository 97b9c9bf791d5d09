//! Argument resolution for the `dev` command.
//!
//! `ArgumentResolver` turns an [`InvocationContext`] into a [`ServerConfig`]:
//! a fresh value built from selected fields, so nothing the flag parser
//! produced leaks into what the server entry receives. The only step that
//! suspends is the port probe.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;

use crate::context::{ClusterFlag, InvocationContext};
use crate::error::{DevError, DevResult};
use crate::framework::FrameworkResolver;
use crate::port::PortProber;

pub const DEFAULT_PORT: u16 = 7001;

// Pass-through options never override the resolved fields.
const RESERVED_KEYS: [&str; 4] = ["baseDir", "workers", "port", "framework"];

/// Launch configuration handed to the server entry as a single JSON argument.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub base_dir: PathBuf,
    pub workers: usize,
    pub port: u16,
    pub framework: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ServerConfig {
    /// Serializes the config into the child's argument vector: one JSON string.
    pub fn to_argv(&self) -> DevResult<Vec<String>> {
        Ok(vec![serde_json::to_string(self)?])
    }
}

/// A resolved config plus warnings meant for the user.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub config: ServerConfig,
    pub warnings: Vec<String>,
}

pub struct ArgumentResolver<F, P> {
    framework: F,
    prober: P,
    default_port: u16,
}

impl<F, P> ArgumentResolver<F, P>
where
    F: FrameworkResolver,
    P: PortProber,
{
    pub fn new(framework: F, prober: P) -> Self {
        Self {
            framework,
            prober,
            default_port: DEFAULT_PORT,
        }
    }

    pub fn with_default_port(mut self, port: u16) -> Self {
        self.default_port = port;
        self
    }

    pub async fn resolve(&self, context: &InvocationContext) -> DevResult<Resolution> {
        let base_dir = resolve_base_dir(context)?;
        let workers = resolve_workers(context.flags.cluster);
        let framework = self
            .framework
            .resolve(context.flags.framework.as_deref(), &base_dir)?;

        let mut warnings = Vec::new();
        let port = match context.flags.port {
            Some(port) => port,
            None => {
                tracing::debug!("detect available port");
                let port = self
                    .prober
                    .probe(self.default_port)
                    .await
                    .map_err(|source| DevError::PortProbe {
                        preferred: self.default_port,
                        source,
                    })?;
                if port != self.default_port {
                    warnings.push(format!(
                        "[egg-bin] server port {} is in use, now using port {}",
                        self.default_port, port
                    ));
                }
                tracing::debug!(port, "use available port");
                port
            }
        };

        let config = ServerConfig {
            base_dir,
            workers,
            port,
            framework,
            extra: context
                .flags
                .server_options
                .iter()
                .filter(|(key, _)| !RESERVED_KEYS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        };
        Ok(Resolution { config, warnings })
    }
}

fn resolve_base_dir(context: &InvocationContext) -> DevResult<PathBuf> {
    if !context.cwd.is_absolute() {
        return Err(DevError::InvalidPath {
            path: context.cwd.clone(),
            reason: "working directory is not absolute".to_string(),
        });
    }
    let raw = context
        .positionals
        .first()
        .filter(|dir| !dir.is_empty())
        .or(context.flags.base_dir.as_ref().filter(|dir| !dir.is_empty()));
    let Some(raw) = raw else {
        return Ok(context.cwd.clone());
    };
    let path = Path::new(raw);
    if path.is_absolute() {
        Ok(normalize(path))
    } else {
        Ok(normalize(&context.cwd.join(path)))
    }
}

fn resolve_workers(cluster: Option<ClusterFlag>) -> usize {
    match cluster {
        Some(ClusterFlag::Count(count)) => count.max(1),
        Some(ClusterFlag::Auto) => available_workers(),
        None => 1,
    }
}

pub fn available_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

// Lexical normalization; symlinks are left alone.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    out
}
