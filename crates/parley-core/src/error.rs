//! Error types for the Parley core

use thiserror::Error;

/// Result type alias for core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by configuration, validation and snapshot handling.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid memory policy: {0}")]
    MemoryPolicy(String),

    #[error("Invalid voice configuration: {0}")]
    VoiceConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for CoreError {
    fn from(err: config::ConfigError) -> Self {
        CoreError::Config(err.to_string())
    }
}

impl From<toml::de::Error> for CoreError {
    fn from(err: toml::de::Error) -> Self {
        CoreError::Config(err.to_string())
    }
}

/// Signatures the local runtime emits when its internal numeric buffers are
/// malformed or oversized. Recoverable by shrinking the prompt.
const BUFFER_FAULT_SIGNATURES: &[&str] = &[
    "invalid typed array length",
    "array buffer allocation failed",
    "offset is out of bounds",
    "buffer size",
    "out of memory",
];

/// Failures surfaced by the inference engine adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InferenceError {
    /// The device cannot host the model (no GPU/runtime). Terminal for the session.
    #[error("AI responses are unavailable on this device: {0}")]
    UnsupportedDevice(String),

    #[error("Model load failed: {0}")]
    LoadFailed(String),

    #[error("Inference timed out after {0} ms")]
    Timeout(u64),

    #[error("Generation failed: {message}")]
    Generation { message: String },
}

impl InferenceError {
    pub fn generation(message: impl Into<String>) -> Self {
        InferenceError::Generation {
            message: message.into(),
        }
    }

    /// Short machine-readable kind, used in logs and status lines.
    pub fn kind(&self) -> &'static str {
        match self {
            InferenceError::UnsupportedDevice(_) => "unsupported-device",
            InferenceError::LoadFailed(_) => "load-failed",
            InferenceError::Timeout(_) => "timeout",
            InferenceError::Generation { .. } => "generation-error",
        }
    }

    /// True when the runtime reported a malformed or oversized internal buffer.
    pub fn is_buffer_fault(&self) -> bool {
        match self {
            InferenceError::Generation { message } => {
                let lower = message.to_lowercase();
                BUFFER_FAULT_SIGNATURES.iter().any(|sig| lower.contains(sig))
            }
            _ => false,
        }
    }

    /// Errors worth one degraded retry. Engine-level failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            InferenceError::Timeout(_) | InferenceError::Generation { .. }
        )
    }

    /// Engine could not be brought up at all.
    pub fn is_engine_failure(&self) -> bool {
        matches!(
            self,
            InferenceError::UnsupportedDevice(_) | InferenceError::LoadFailed(_)
        )
    }
}
