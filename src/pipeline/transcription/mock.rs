use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{Transcriber, TranscriptionError};
use crate::models::{Transcript, TranscriptSegment};
use crate::storage::ScratchAudio;

/// Mock transcriber for tests.
///
/// Replays scripted results in order, then keeps returning the fallback
/// transcript. An optional delay simulates a slow upstream.
pub struct MockTranscriber {
    script: Mutex<VecDeque<Result<Transcript, TranscriptionError>>>,
    fallback: Option<Transcript>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    seen_files: Mutex<Vec<std::path::PathBuf>>,
}

impl MockTranscriber {
    pub fn new(text: &str) -> Self {
        Self::returning(Transcript {
            text: text.to_string(),
            segments: vec![TranscriptSegment {
                start: 0.0,
                end: 1.0,
                text: text.to_string(),
            }],
            duration_secs: Some(1.0),
        })
    }

    pub fn returning(transcript: Transcript) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Some(transcript),
            delay: None,
            calls: AtomicUsize::new(0),
            seen_files: Mutex::new(Vec::new()),
        }
    }

    /// Every call fails with a transient upstream error.
    pub fn always_unavailable() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: None,
            delay: None,
            calls: AtomicUsize::new(0),
            seen_files: Mutex::new(Vec::new()),
        }
    }

    pub fn then(self, result: Result<Transcript, TranscriptionError>) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(result);
        }
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Scratch paths handed to the transcriber, in call order.
    pub fn seen_files(&self) -> Vec<std::path::PathBuf> {
        self.seen_files.lock().map(|f| f.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Transcriber for MockTranscriber {
    async fn transcribe(
        &self,
        audio: &ScratchAudio,
        _language_hint: Option<&str>,
    ) -> Result<Transcript, TranscriptionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.seen_files.lock() {
            seen.push(audio.path_buf());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(next) = self.script.lock().ok().and_then(|mut s| s.pop_front()) {
            return next;
        }
        self.fallback.clone().ok_or(TranscriptionError::Api {
            status: 503,
            body: "transcription service unavailable".into(),
        })
    }
}
