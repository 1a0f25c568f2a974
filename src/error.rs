//! Error types shared by the estimation pipeline and its collaborators.
use thiserror::Error;

/// Why a volume sink refused a step change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkFailure {
    /// The platform denied access to the output volume.
    PermissionDenied,
    /// Device busy, endpoint reclaimed, or any other failure worth retrying later.
    Transient,
}

impl std::fmt::Display for SinkFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkFailure::PermissionDenied => write!(f, "permission denied"),
            SinkFailure::Transient => write!(f, "transient failure"),
        }
    }
}

#[derive(Error, Debug)]
pub enum AvcError {
    /// Audio capture could not be opened or failed mid-stream
    #[error("capture error: {0}")]
    Capture(String),

    #[error("no default input device (microphone) found")]
    NoInputDevice,

    /// The output volume could not be read or changed
    #[error("volume sink error ({kind}): {message}")]
    VolumeSink { kind: SinkFailure, message: String },

    /// Offline input could not be decoded
    #[error("decode error: {0}")]
    Decode(String),

    #[error("boundary event source error: {0}")]
    BoundarySource(String),

    #[error("invalid value '{value}' for setting '{key}'")]
    InvalidSetting { key: String, value: String },

    #[error("unknown setting '{0}'")]
    UnknownSetting(String),

    #[error("monitoring session is already running")]
    AlreadyRunning,

    #[error("monitoring session is not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AvcError {
    pub fn sink(kind: SinkFailure, message: impl Into<String>) -> Self {
        AvcError::VolumeSink { kind, message: message.into() }
    }

    pub fn invalid_setting(key: &str, value: &str) -> Self {
        AvcError::InvalidSetting { key: key.to_string(), value: value.to_string() }
    }
}

pub type Result<T> = std::result::Result<T, AvcError>;
