use crate::models::PatientContext;

/// Maximum transcript length sent to the LLM (characters).
const MAX_TRANSCRIPT_LENGTH: usize = 60_000;

pub const SUMMARY_SYSTEM_PROMPT: &str = r#"Você é um assistente médico especializado em resumir consultas médicas.

Analise a transcrição fornecida e extraia as informações no formato SOAP estruturado:

1. Queixa Principal: motivo da consulta em 1-2 frases
2. História da Doença Atual (HDA): sintomas, início, evolução, fatores de melhora/piora
3. Exame Físico: achados do exame físico, sinais vitais se mencionados
4. Avaliação: impressão diagnóstica, hipóteses diagnósticas
5. Plano: condutas, medicações prescritas, exames solicitados, orientações

REGRAS:
- Seja objetivo e use terminologia médica apropriada.
- Se alguma seção não estiver presente na transcrição, escreva "Não mencionado".
- Não invente informações que não estejam na transcrição.
- Retorne APENAS um objeto JSON válido, sem texto adicional.

Formato de resposta:
{
    "chief_complaint": "string",
    "history_present_illness": "string",
    "physical_exam": "string",
    "assessment": "string",
    "plan": "string"
}"#;

/// Build the user message for one consultation.
pub fn build_summary_prompt(transcript: &str, patient: &PatientContext) -> String {
    let mut header = String::new();
    if let Some(name) = &patient.name {
        header.push_str(&format!("Paciente: {name}\n"));
    }
    if let Some(age) = patient.age_years {
        header.push_str(&format!("Idade: {age} anos\n"));
    }

    format!(
        "{header}\nTranscrição da consulta:\n<transcricao>\n{transcript}\n</transcricao>\n\n\
         Gere o resumo estruturado em formato JSON."
    )
}

/// Strip invisible formatting characters, collapse blank runs and truncate.
pub fn sanitize_transcript(raw: &str) -> String {
    let visible: String = raw
        .chars()
        .filter(|c| {
            !matches!(
                *c,
                '\u{200B}'..='\u{200F}' | '\u{202A}'..='\u{202E}' | '\u{2060}'..='\u{2064}' | '\u{FEFF}'
            )
        })
        .filter(|c| !c.is_control() || matches!(*c, '\n' | '\t'))
        .collect();

    let normalized = visible
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    if normalized.chars().count() > MAX_TRANSCRIPT_LENGTH {
        tracing::warn!(
            length = normalized.chars().count(),
            max = MAX_TRANSCRIPT_LENGTH,
            "Transcript truncated before summarization"
        );
        normalized.chars().take(MAX_TRANSCRIPT_LENGTH).collect()
    } else {
        normalized
    }
}
