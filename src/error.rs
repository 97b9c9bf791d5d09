//! Error kinds shared by the resolver and the launcher.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DevError {
    /// The application directory could not be turned into an absolute path.
    #[error("invalid base directory {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    #[error("failed to probe an available port from {preferred}")]
    PortProbe {
        preferred: u16,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    FrameworkResolution(String),

    #[error("entry {0} does not exist")]
    EntryNotFound(PathBuf),

    #[error("failed to spawn {program}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to wait for child process")]
    Wait(#[source] io::Error),

    #[error("failed to serialize server config")]
    Serialize(#[from] serde_json::Error),
}

pub type DevResult<T> = Result<T, DevError>;
