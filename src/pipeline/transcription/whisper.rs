use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;

use super::{Transcriber, TranscriptionError};
use crate::models::{Transcript, TranscriptSegment};
use crate::storage::ScratchAudio;

/// OpenAI Whisper `/audio/transcriptions` client.
pub struct WhisperClient {
    base_url: String,
    api_key: Option<String>,
    model: String,
    client: reqwest::Client,
    timeout_secs: u64,
}

impl WhisperClient {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        model: &str,
        timeout_secs: u64,
    ) -> Result<Self, TranscriptionError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| TranscriptionError::HttpClient(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: model.to_string(),
            client,
            timeout_secs,
        })
    }

    fn map_send_error(&self, e: reqwest::Error) -> TranscriptionError {
        if e.is_timeout() {
            TranscriptionError::Timeout(self.timeout_secs)
        } else if e.is_connect() {
            TranscriptionError::Connection(self.base_url.clone())
        } else {
            TranscriptionError::HttpClient(e.to_string())
        }
    }
}

/// `verbose_json` response body. Whisper sends more fields; only these are kept.
#[derive(Deserialize)]
struct VerboseTranscription {
    text: String,
    #[serde(default)]
    segments: Vec<VerboseSegment>,
    duration: Option<f64>,
}

#[derive(Deserialize)]
struct VerboseSegment {
    start: f64,
    end: f64,
    text: String,
}

#[async_trait]
impl Transcriber for WhisperClient {
    async fn transcribe(
        &self,
        audio: &ScratchAudio,
        language_hint: Option<&str>,
    ) -> Result<Transcript, TranscriptionError> {
        let bytes = tokio::fs::read(audio.path()).await?;
        let file = Part::bytes(bytes)
            .file_name(audio.file_name().to_string())
            .mime_str(audio.content_type())
            .map_err(|e| TranscriptionError::HttpClient(e.to_string()))?;

        let mut form = Form::new()
            .part("file", file)
            .text("model", self.model.clone())
            .text("response_format", "verbose_json")
            .text("temperature", "0");
        if let Some(language) = language_hint {
            form = form.text("language", language.to_string());
        }

        let url = format!("{}/audio/transcriptions", self.base_url);
        let mut builder = self.client.post(&url).multipart(form);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TranscriptionError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: VerboseTranscription = response
            .json()
            .await
            .map_err(|e| TranscriptionError::ResponseParsing(e.to_string()))?;

        let text = parsed.text.trim().to_string();
        if text.is_empty() {
            return Err(TranscriptionError::EmptyTranscript);
        }

        Ok(Transcript {
            text,
            segments: parsed
                .segments
                .into_iter()
                .map(|s| TranscriptSegment {
                    start: s.start,
                    end: s.end,
                    text: s.text.trim().to_string(),
                })
                .collect(),
            duration_secs: parsed.duration,
        })
    }
}
