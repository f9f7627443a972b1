use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::retry::RetryableError;
use crate::segment::SegmentId;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    Validation(String),

    #[error("corrupt checkpoint archive {}: {reason}", path.display())]
    CorruptArchive { path: PathBuf, reason: String },

    #[error("synthesis of segment {id} failed after {attempts} attempts")]
    SynthesisExhausted {
        id: SegmentId,
        attempts: u32,
        #[source]
        source: SynthesisError,
    },

    #[error("synthesis of segment {id} was rejected")]
    SynthesisRejected {
        id: SegmentId,
        #[source]
        source: SynthesisError,
    },

    #[error("cancelled by user")]
    Cancelled,

    #[error("segment {id} has no synthesized audio")]
    MissingAudio { id: SegmentId },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl PipelineError {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CorruptArchive {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Attaches a human-readable context to an I/O failure.
pub(crate) trait IoContext<T> {
    fn io_context<C, F>(self, context: F) -> Result<T, PipelineError>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T> IoContext<T> for Result<T, io::Error> {
    fn io_context<C, F>(self, context: F) -> Result<T, PipelineError>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|source| PipelineError::Io {
            context: context().into(),
            source,
        })
    }
}

/// Failure of a single call to the remote speech service.
#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("unsupported language code '{0}'")]
    UnsupportedLanguage(String),

    #[error("request to speech service failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("speech service returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("no audio stream in speech service response")]
    NoAudio,

    #[error("speech service sent an undecodable audio payload: {0}")]
    Decode(#[from] base64::DecodeError),
}

impl RetryableError for SynthesisError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => !err.is_builder(),
            Self::Status { status, .. } => matches!(status, 408 | 429 | 500..=599),
            Self::NoAudio => true,
            Self::UnsupportedLanguage(_) | Self::Decode(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> SynthesisError {
        SynthesisError::Status {
            status: code,
            message: String::new(),
        }
    }

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        assert!(status(429).is_retryable());
        assert!(status(408).is_retryable());
        assert!(status(503).is_retryable());
        assert!(SynthesisError::NoAudio.is_retryable());
    }

    #[test]
    fn client_errors_fail_fast() {
        assert!(!status(400).is_retryable());
        assert!(!status(403).is_retryable());
        assert!(!SynthesisError::UnsupportedLanguage("xx".to_string()).is_retryable());
    }

    #[test]
    fn io_context_wraps_source() {
        let result: Result<(), io::Error> = Err(io::Error::other("disk full"));
        let err = result.io_context(|| "failed writing output").unwrap_err();
        assert_eq!(err.to_string(), "failed writing output");
        assert!(matches!(err, PipelineError::Io { .. }));
    }
}
