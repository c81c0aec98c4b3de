use serde::Deserialize;
use serde_json::Value;

use super::catalog;
use super::SuggestionError;
use crate::models::CodeSuggestion;

#[derive(Deserialize)]
#[serde(untagged)]
enum RawResponse {
    Wrapped { suggestions: Vec<RawSuggestion> },
    Bare(Vec<RawSuggestion>),
}

#[derive(Deserialize)]
struct RawSuggestion {
    code: Option<String>,
    description: Option<String>,
    confidence: Option<Value>,
}

/// Map a confidence label or number onto `[0, 1]`.
///
/// `high`/`medium`/`low` become 0.9/0.6/0.3; numbers are clamped; anything
/// else counts as low.
pub fn confidence_score(value: Option<&Value>) -> f32 {
    match value {
        Some(Value::Number(n)) => n.as_f64().map_or(0.3, |f| clamp_unit(f as f32)),
        Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "high" | "alta" => 0.9,
            "medium" | "média" | "media" => 0.6,
            "low" | "baixa" => 0.3,
            other => other.parse::<f32>().map_or(0.3, clamp_unit),
        },
        _ => 0.3,
    }
}

fn clamp_unit(f: f32) -> f32 {
    if f.is_nan() {
        0.0
    } else {
        f.clamp(0.0, 1.0)
    }
}

/// Parse a suggestion response, drop malformed codes, fill missing
/// descriptions from the catalog and rank the rest.
pub fn parse_suggestions(raw: &str, top_n: usize) -> Result<Vec<CodeSuggestion>, SuggestionError> {
    let parsed: RawResponse =
        serde_json::from_str(raw.trim()).map_err(|e| SuggestionError::InvalidJson(e.to_string()))?;
    let entries = match parsed {
        RawResponse::Wrapped { suggestions } => suggestions,
        RawResponse::Bare(list) => list,
    };

    let mut codes = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(code) = entry.code.as_deref().map(catalog::normalize_code) else {
            continue;
        };
        if !catalog::is_valid_code(&code) {
            tracing::debug!(code = %code, "Dropping suggestion with malformed ICD-10 code");
            continue;
        }
        let description = entry
            .description
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .or_else(|| catalog::describe(&code).map(str::to_string))
            .unwrap_or_default();

        codes.push(CodeSuggestion {
            confidence: confidence_score(entry.confidence.as_ref()),
            code,
            description,
        });
    }

    Ok(rank(codes, top_n))
}

/// Sort by descending confidence, keep the first occurrence of each code,
/// truncate to `top_n`.
pub fn rank(mut codes: Vec<CodeSuggestion>, top_n: usize) -> Vec<CodeSuggestion> {
    // Stable sort keeps the model's order among equal confidences.
    codes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut seen = std::collections::HashSet::new();
    codes.retain(|c| seen.insert(c.code.clone()));
    codes.truncate(top_n);
    codes
}
