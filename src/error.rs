//! Error kinds surfaced by the build pipeline, identity setup and templater.
//!
//! Supervisor failures (crashes, fatal processes) are not errors: they are
//! reported as [`crate::supervisor::Failure`] events and drive the restart
//! state machine instead of propagating.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Package install, build tool or publish failure. Aborts the pipeline.
    #[error("build failure in stage '{stage}': {message}")]
    BuildFailure { stage: String, message: String },

    #[error("permission denied changing ownership of '{}'", path.display())]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("identity conflict for '{name}': found '{existing}', requested '{requested}'")]
    IdentityConflict {
        name: String,
        existing: String,
        requested: String,
    },

    #[error("unresolved template placeholders: {}", names.join(", "))]
    TemplateResolution { names: Vec<String> },

    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("I/O error at '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Error::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn build(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Error::BuildFailure {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
