pub mod mock;
pub mod whisper;

pub use mock::*;
pub use whisper::*;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::Transcript;
use crate::storage::ScratchAudio;

#[derive(Error, Debug)]
pub enum TranscriptionError {
    #[error("Transcription service unreachable at {0}")]
    Connection(String),

    #[error("Transcription timed out after {0}s")]
    Timeout(u64),

    #[error("Transcription service returned error (status {status}): {body}")]
    Api { status: u16, body: String },

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Malformed transcription response: {0}")]
    ResponseParsing(String),

    #[error("Transcription produced no text")]
    EmptyTranscript,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TranscriptionError {
    pub fn is_transient(&self) -> bool {
        match self {
            TranscriptionError::Connection(_) | TranscriptionError::Timeout(_) => true,
            TranscriptionError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Speech-to-text over a local scratch copy of the recording.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(
        &self,
        audio: &ScratchAudio,
        language_hint: Option<&str>,
    ) -> Result<Transcript, TranscriptionError>;
}
