//! Error types for mesh operations

use thiserror::Error;

/// Result type for mesh operations
pub type MeshResult<T> = Result<T, MeshError>;

/// Errors that can occur during mesh operations
///
/// None of these are fatal to a running mesh. The controller either absorbs
/// them locally or surfaces them as a transient notice.
#[derive(Error, Debug)]
pub enum MeshError {
    /// Advertising or discovery could not be started
    #[error("Transport failure: {reason}")]
    TransportFailure {
        reason: String,
        status_code: Option<i32>,
    },

    /// A connection attempt was refused or failed
    #[error("Connection failed: {0}")]
    ConnectionRejected(String),

    /// An incoming payload was not a valid envelope
    #[error("Invalid envelope: {0}")]
    ParseFailure(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid nickname: {0}")]
    InvalidNickname(String),

    /// Both sides of a discovered pair use the same nickname
    #[error("Nickname collision: another device is also named {0}")]
    NicknameCollision(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Transmission failed: {0}")]
    TransmissionFailed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MeshError {
    /// Build a transport failure from a platform status code
    pub fn transport(status_code: i32) -> Self {
        MeshError::TransportFailure {
            reason: transport_failure_reason(status_code),
            status_code: Some(status_code),
        }
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::ParseFailure(err.to_string())
    }
}

impl From<base64::DecodeError> for MeshError {
    fn from(err: base64::DecodeError) -> Self {
        MeshError::ParseFailure(format!("base64: {}", err))
    }
}

/// Human-readable reason for an advertising/discovery failure
pub fn transport_failure_reason(status_code: i32) -> String {
    match status_code {
        8001 => "Location off or no permissions".to_string(),
        8002 => "Bluetooth off".to_string(),
        code => format!("Error {}", code),
    }
}

/// Human-readable reason for a failed connection result
pub fn connection_failure_reason(status_code: i32) -> String {
    match status_code {
        8003 => "Already connected".to_string(),
        8004 => "Connection refused".to_string(),
        code => format!("Error {}", code),
    }
}
