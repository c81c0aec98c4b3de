pub mod catalog;
pub mod parser;

pub use catalog::*;
pub use parser::*;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use super::llm::{ChatRequest, LlmClient, LlmError};
use super::summarization::NOT_MENTIONED;
use crate::models::{ClinicalSummary, CodeSuggestion};

#[derive(Error, Debug)]
pub enum SuggestionError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Suggestion response is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("Code suggestion timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Result of the code-suggestion stage. Never fails the consultation.
#[derive(Debug, Clone, PartialEq)]
pub enum SuggestionOutcome {
    Ranked(Vec<CodeSuggestion>),
    Degraded { reason: String },
}

impl SuggestionOutcome {
    pub fn into_codes(self) -> Vec<CodeSuggestion> {
        match self {
            SuggestionOutcome::Ranked(codes) => codes,
            SuggestionOutcome::Degraded { .. } => Vec::new(),
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, SuggestionOutcome::Degraded { .. })
    }
}

/// Proposes ICD-10 codes for a summary, best first.
#[async_trait]
pub trait CodeSuggester: Send + Sync {
    async fn suggest_codes(
        &self,
        summary: &ClinicalSummary,
    ) -> Result<Vec<CodeSuggestion>, SuggestionError>;
}

/// System prompt asking for at most `top_n` codes.
pub fn suggestion_system_prompt(top_n: usize) -> String {
    format!(
        r#"Você é um especialista em codificação CID-10 (Classificação Internacional de Doenças).

Baseado no resumo clínico fornecido, sugira os códigos CID-10 mais apropriados.

REGRAS:
- Sugira até {top_n} códigos em ordem de relevância.
- Use códigos CID-10 válidos e atuais, no formato letra + dois dígitos [+ ponto + subcategoria].
- Indique o nível de confiança: "high", "medium" ou "low".
- Retorne APENAS um objeto JSON válido.

Formato de resposta:
{{
    "suggestions": [
        {{
            "code": "A00.0",
            "description": "Descrição completa do CID",
            "confidence": "high"
        }}
    ]
}}"#
    )
}

pub fn build_suggestion_prompt(summary: &ClinicalSummary) -> String {
    let section = |s: &str| if s.trim().is_empty() { NOT_MENTIONED.to_string() } else { s.trim().to_string() };
    format!(
        "Resumo clínico:\n\nQueixa Principal: {}\nHistória: {}\nExame Físico: {}\nAvaliação: {}\n\n\
         Sugira os códigos CID-10 mais apropriados em formato JSON.",
        section(&summary.chief_complaint),
        section(&summary.history_of_present_illness),
        section(&summary.physical_exam),
        section(&summary.assessment),
    )
}

/// Code suggester backed by a JSON-mode chat completion.
pub struct LlmCodeSuggester {
    client: Arc<dyn LlmClient>,
    top_n: usize,
}

impl LlmCodeSuggester {
    pub const TEMPERATURE: f32 = 0.2;
    pub const MAX_TOKENS: u32 = 500;

    pub fn new(client: Arc<dyn LlmClient>, top_n: usize) -> Self {
        Self { client, top_n }
    }
}

#[async_trait]
impl CodeSuggester for LlmCodeSuggester {
    async fn suggest_codes(
        &self,
        summary: &ClinicalSummary,
    ) -> Result<Vec<CodeSuggestion>, SuggestionError> {
        let request = ChatRequest {
            system: suggestion_system_prompt(self.top_n),
            user: build_suggestion_prompt(summary),
            temperature: Self::TEMPERATURE,
            max_tokens: Self::MAX_TOKENS,
        };
        let raw = self.client.complete_json(&request).await?;
        parse_suggestions(&raw, self.top_n)
    }
}
