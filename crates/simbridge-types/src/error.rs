use thiserror::Error;

use crate::phase::{RunEvent, RunPhase};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Lifecycle transition error: cannot transition from {from:?} via {event:?}")]
    InvalidTransition { from: RunPhase, event: RunEvent },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Collaborator '{name}' failed: {message}")]
    Collaborator { name: &'static str, message: String },

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    pub fn collaborator(name: &'static str, err: impl std::fmt::Display) -> Self {
        BridgeError::Collaborator {
            name,
            message: err.to_string(),
        }
    }
}

/// Errors raised while reading or writing configuration files.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    NotFound(std::path::PathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse {
        path: std::path::PathBuf,
        message: String,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
