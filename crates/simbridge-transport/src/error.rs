use thiserror::Error;

use simbridge_types::BridgeError;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error on {object}: {source}")]
    Io {
        object: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid length header: expected 8 bytes, got {0}")]
    InvalidHeader(usize),

    #[error("truncated payload: expected {expected} bytes, region holds {available}")]
    Truncated { expected: usize, available: usize },

    #[error("failed to decode payload: {0}")]
    Decode(String),

    #[error("failed to encode payload: {0}")]
    Encode(String),

    #[error("control channel closed")]
    Closed,
}

impl TransportError {
    pub(crate) fn last_os_error(object: &str) -> Self {
        TransportError::Io {
            object: object.to_string(),
            source: std::io::Error::last_os_error(),
        }
    }
}

impl From<TransportError> for BridgeError {
    fn from(err: TransportError) -> Self {
        BridgeError::Transport(err.to_string())
    }
}
