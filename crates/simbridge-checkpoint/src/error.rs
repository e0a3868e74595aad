use std::path::PathBuf;

use thiserror::Error;

use simbridge_types::BridgeError;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: rmp_serde::decode::Error,
    },

    #[error("failed to parse migrated {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize {document} document: {source}")]
    Serialize {
        document: &'static str,
        #[source]
        source: rmp_serde::encode::Error,
    },

    #[error("{document} document has version {found}, newest supported is {supported}")]
    UnsupportedVersion {
        document: &'static str,
        found: u64,
        supported: u64,
    },

    #[error("malformed {document} document: {message}")]
    Malformed {
        document: &'static str,
        message: String,
    },
}

impl CheckpointError {
    pub(crate) fn io(action: &'static str, path: &std::path::Path, source: std::io::Error) -> Self {
        CheckpointError::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

impl From<CheckpointError> for BridgeError {
    fn from(err: CheckpointError) -> Self {
        BridgeError::Checkpoint(err.to_string())
    }
}
