//! Error types for the Parley voice system

use parley_core::{CoreError, InferenceError};
use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur in the voice orchestration system
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Recognition error: {0}")]
    Recognition(#[from] RecognitionError),

    #[error("Synthesis error: {0}")]
    Synthesis(#[from] SynthesisError),

    #[error("Inference error: {0}")]
    Inference(#[from] InferenceError),

    #[error("Configuration error: {0}")]
    Config(#[from] CoreError),
}

/// Failures reported by the platform speech recognizer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecognitionError {
    /// Nothing was heard before the recognizer gave up. Recoverable.
    #[error("no speech detected")]
    NoSpeech,

    /// Microphone access refused. Terminal until the user grants access again.
    #[error("microphone permission denied")]
    PermissionDenied,

    /// Session stopped on purpose (our own `stop`).
    #[error("recognition aborted")]
    Aborted,

    #[error("network error during recognition")]
    Network,

    #[error("{0}")]
    Other(String),
}

impl RecognitionError {
    /// Map a platform reason code (`no-speech`, `not-allowed`, ...) onto the taxonomy.
    pub fn from_reason(reason: &str) -> Self {
        match reason.trim().to_ascii_lowercase().as_str() {
            "no-speech" => RecognitionError::NoSpeech,
            "not-allowed" | "permission-denied" | "service-not-allowed" => {
                RecognitionError::PermissionDenied
            }
            "aborted" => RecognitionError::Aborted,
            "network" => RecognitionError::Network,
            other => RecognitionError::Other(other.to_string()),
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            RecognitionError::NoSpeech => "no-speech",
            RecognitionError::PermissionDenied => "permission-denied",
            RecognitionError::Aborted => "aborted",
            RecognitionError::Network => "network",
            RecognitionError::Other(reason) => reason,
        }
    }
}

/// Failures reported by (or on behalf of) the platform speech synthesizer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SynthesisError {
    #[error("speech synthesis failed: {0}")]
    Platform(String),

    /// The platform never reported completion within the safety bound.
    #[error("speech synthesis safety timeout")]
    SafetyTimeout,
}
