use sentinel_common::PbftError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Failed to send message to peer {0}")]
    SendError(String),
    #[error("Peer {0} not found")]
    PeerNotFound(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Frame digest mismatch: declared {declared}, computed {computed}")]
    DigestMismatch { declared: String, computed: String },
    #[error("Malformed frame: {0}")]
    InvalidFrame(String),
}

impl From<serde_json::Error> for NetworkError {
    fn from(e: serde_json::Error) -> Self {
        NetworkError::SerializationError(e.to_string())
    }
}

impl From<NetworkError> for PbftError {
    fn from(e: NetworkError) -> Self {
        PbftError::Network(e.to_string())
    }
}
