pub mod parser;
pub mod prompt;

pub use parser::*;
pub use prompt::*;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use super::llm::{ChatRequest, LlmClient, LlmError};
use crate::models::{ClinicalSummary, PatientContext};

#[derive(Error, Debug)]
pub enum SummarizationError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Summary is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("Summary is missing required field: {0}")]
    MissingField(&'static str),

    #[error("Transcript is empty")]
    EmptyTranscript,
}

impl SummarizationError {
    pub fn is_transient(&self) -> bool {
        match self {
            SummarizationError::Llm(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Turns a transcript into a SOAP summary validated against the fixed schema.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        transcript: &str,
        patient: &PatientContext,
    ) -> Result<ClinicalSummary, SummarizationError>;
}

/// Summarizer backed by a JSON-mode chat completion.
pub struct LlmSummarizer {
    client: Arc<dyn LlmClient>,
}

impl LlmSummarizer {
    pub const TEMPERATURE: f32 = 0.3;
    pub const MAX_TOKENS: u32 = 1500;

    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(
        &self,
        transcript: &str,
        patient: &PatientContext,
    ) -> Result<ClinicalSummary, SummarizationError> {
        let cleaned = sanitize_transcript(transcript);
        if cleaned.is_empty() {
            return Err(SummarizationError::EmptyTranscript);
        }

        let request = ChatRequest {
            system: SUMMARY_SYSTEM_PROMPT.to_string(),
            user: build_summary_prompt(&cleaned, patient),
            temperature: Self::TEMPERATURE,
            max_tokens: Self::MAX_TOKENS,
        };
        let raw = self.client.complete_json(&request).await?;
        parse_summary_response(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::llm::MockLlmClient;

    const VALID: &str = r#"{
        "chief_complaint": "Cefaleia há 3 dias",
        "history_present_illness": "Dor holocraniana, pior à tarde",
        "physical_exam": "Não mencionado",
        "assessment": "Cefaleia tensional",
        "plan": "Dipirona 1g se dor"
    }"#;

    #[tokio::test]
    async fn summarizes_with_patient_context() {
        let client = Arc::new(MockLlmClient::new(VALID));
        let summarizer = LlmSummarizer::new(client.clone());
        let patient = PatientContext {
            patient_id: "P1".into(),
            name: Some("Maria Souza".into()),
            age_years: Some(42),
        };

        let summary = summarizer
            .summarize("Doutor, estou com dor de cabeça", &patient)
            .await
            .unwrap();
        assert_eq!(summary.assessment, "Cefaleia tensional");
        assert_eq!(summary.physical_exam, "Não mencionado");

        let requests = client.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].user.contains("Maria Souza"));
        assert!(requests[0].user.contains("42 anos"));
        assert_eq!(requests[0].system, SUMMARY_SYSTEM_PROMPT);
    }

    #[tokio::test]
    async fn empty_transcript_never_reaches_llm() {
        let client = Arc::new(MockLlmClient::new(VALID));
        let summarizer = LlmSummarizer::new(client.clone());
        let err = summarizer
            .summarize(" \u{200B} ", &PatientContext::anonymous("P1"))
            .await
            .unwrap_err();
        assert!(matches!(err, SummarizationError::EmptyTranscript));
        assert!(client.requests().is_empty());
    }

    #[tokio::test]
    async fn schema_violation_is_permanent() {
        let client = Arc::new(MockLlmClient::new(r#"{"chief_complaint":"x"}"#));
        let err = LlmSummarizer::new(client)
            .summarize("texto", &PatientContext::anonymous("P1"))
            .await
            .unwrap_err();
        assert!(matches!(err, SummarizationError::MissingField(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn upstream_outage_is_transient() {
        let err = LlmSummarizer::new(Arc::new(MockLlmClient::failing()))
            .summarize("texto", &PatientContext::anonymous("P1"))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
