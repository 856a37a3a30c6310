//! Error types for Colloquy operations.

use crate::session::{SessionOutput, TerminationReason};
use thiserror::Error;

/// Result type for Colloquy operations.
pub type Result<T> = std::result::Result<T, ColloquyError>;

/// Errors that can occur while configuring or running a synthesis session.
#[derive(Error, Debug)]
pub enum ColloquyError {
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Guidance weight must be finite and >= 0, got {0}")]
    DegenerateGuidance(f32),

    #[error("Codec decode failed: {0}")]
    CodecDecodeFailure(String),

    #[error("Non-finite latent frame at index {frame} after {attempts} attempt(s)")]
    NonFiniteFrame { frame: usize, attempts: u32 },

    #[error("Session already ended ({0})")]
    SessionEnded(TerminationReason),

    #[error("Model initialization failed: {0}")]
    InitializationError(String),

    #[error("Voice processing error: {0}")]
    VoiceError(String),

    #[error("Audio processing error: {0}")]
    AudioError(String),

    #[error("Text processing error: {0}")]
    ProcessingError(String),

    #[error("Generation failed: {0}")]
    GenerationError(String),

    #[error("IO error: {0}")]
    IoError(String),
}

impl From<candle_core::Error> for ColloquyError {
    fn from(e: candle_core::Error) -> Self {
        ColloquyError::GenerationError(e.to_string())
    }
}

impl From<std::io::Error> for ColloquyError {
    fn from(e: std::io::Error) -> Self {
        ColloquyError::IoError(e.to_string())
    }
}

impl From<anyhow::Error> for ColloquyError {
    fn from(e: anyhow::Error) -> Self {
        // Keep typed errors that were wrapped on the way up through anyhow layers
        match e.downcast::<ColloquyError>() {
            Ok(inner) => inner,
            Err(e) => ColloquyError::GenerationError(e.to_string()),
        }
    }
}

/// A fatal session error together with everything produced before it.
///
/// The partial output is decoded from the frames that were finalized before the
/// failure, so callers can still inspect or save it.
#[derive(Error, Debug)]
#[error("{error}")]
pub struct SessionFailure {
    pub error: ColloquyError,
    pub partial: Box<SessionOutput>,
}

impl SessionFailure {
    pub fn into_error(self) -> ColloquyError {
        self.error
    }
}

impl From<SessionFailure> for ColloquyError {
    fn from(failure: SessionFailure) -> Self {
        failure.error
    }
}
