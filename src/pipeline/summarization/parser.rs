use serde::Deserialize;

use super::SummarizationError;
use crate::models::ClinicalSummary;

/// Marker the model writes for a SOAP section absent from the transcript.
pub const NOT_MENTIONED: &str = "Não mencionado";

#[derive(Deserialize)]
struct RawSummary {
    chief_complaint: Option<String>,
    #[serde(alias = "history_present_illness", alias = "hda")]
    history_of_present_illness: Option<String>,
    physical_exam: Option<String>,
    assessment: Option<String>,
    plan: Option<String>,
}

/// Parse and validate a summary response against the SOAP schema.
///
/// Every section must be present and non-blank. Code fences around the
/// object are tolerated.
pub fn parse_summary_response(raw: &str) -> Result<ClinicalSummary, SummarizationError> {
    let json = strip_code_fence(raw);
    let parsed: RawSummary =
        serde_json::from_str(json).map_err(|e| SummarizationError::InvalidJson(e.to_string()))?;

    Ok(ClinicalSummary {
        chief_complaint: required(parsed.chief_complaint, "chief_complaint")?,
        history_of_present_illness: required(
            parsed.history_of_present_illness,
            "history_present_illness",
        )?,
        physical_exam: required(parsed.physical_exam, "physical_exam")?,
        assessment: required(parsed.assessment, "assessment")?,
        plan: required(parsed.plan, "plan")?,
    })
}

fn required(value: Option<String>, field: &'static str) -> Result<String, SummarizationError> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(SummarizationError::MissingField(field)),
    }
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_complete_summary() {
        let s = parse_summary_response(
            r#"{"chief_complaint":"Febre","history_present_illness":"2 dias","physical_exam":"T 38.5",
                "assessment":"Síndrome gripal","plan":"Repouso"}"#,
        )
        .unwrap();
        assert_eq!(s.chief_complaint, "Febre");
        assert_eq!(s.history_of_present_illness, "2 dias");
    }

    #[test]
    fn accepts_hda_alias_and_fenced_json() {
        let s = parse_summary_response(
            "```json\n{\"chief_complaint\":\"a\",\"hda\":\"b\",\"physical_exam\":\"c\",\"assessment\":\"d\",\"plan\":\"e\"}\n```",
        )
        .unwrap();
        assert_eq!(s.history_of_present_illness, "b");
    }

    #[test]
    fn not_mentioned_sections_are_valid() {
        let s = parse_summary_response(&format!(
            r#"{{"chief_complaint":"Tosse","history_present_illness":"{NOT_MENTIONED}",
                "physical_exam":"{NOT_MENTIONED}","assessment":"{NOT_MENTIONED}","plan":"{NOT_MENTIONED}"}}"#
        ))
        .unwrap();
        assert_eq!(s.plan, NOT_MENTIONED);
    }

    #[test]
    fn blank_section_is_rejected() {
        let err = parse_summary_response(
            r#"{"chief_complaint":"a","history_present_illness":"b","physical_exam":"c","assessment":"  ","plan":"e"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, SummarizationError::MissingField("assessment")));
    }

    #[test]
    fn non_json_is_rejected() {
        let err = parse_summary_response("Resumo: paciente com febre").unwrap_err();
        assert!(matches!(err, SummarizationError::InvalidJson(_)));
    }
}
