use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use uuid::Uuid;

use crate::db::DatabaseError;
use crate::models::*;

/// Partial update of a consultation row.
///
/// Outer `None` leaves a column untouched; `Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct ConsultationPatch {
    pub status: Option<ConsultationStatus>,
    pub transcript: Option<Option<Transcript>>,
    pub summary: Option<Option<ClinicalSummary>>,
    pub suggested_codes: Option<Vec<CodeSuggestion>>,
    pub error_message: Option<Option<String>>,
    pub task_reference: Option<Option<TaskReference>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
    /// Only apply while this task is still the outstanding one.
    pub expected_task: Option<TaskReference>,
}

impl ConsultationPatch {
    pub fn status(status: ConsultationStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_transcript(mut self, transcript: Transcript) -> Self {
        self.transcript = Some(Some(transcript));
        self
    }

    pub fn with_summary(mut self, summary: ClinicalSummary) -> Self {
        self.summary = Some(Some(summary));
        self
    }

    pub fn with_suggested_codes(mut self, codes: Vec<CodeSuggestion>) -> Self {
        self.suggested_codes = Some(codes);
        self
    }

    pub fn with_error(mut self, message: &str) -> Self {
        self.error_message = Some(Some(message.to_string()));
        self
    }

    pub fn completed_now(mut self) -> Self {
        self.completed_at = Some(Some(Utc::now()));
        self
    }

    pub fn only_for_task(mut self, reference: Option<TaskReference>) -> Self {
        self.expected_task = reference;
        self
    }

    pub fn clear_task(mut self) -> Self {
        self.task_reference = Some(None);
        self
    }

    /// Wipe everything a previous pipeline run produced. Confirmed codes are kept.
    pub fn clear_run_outputs(mut self) -> Self {
        self.transcript = Some(None);
        self.summary = Some(None);
        self.suggested_codes = Some(Vec::new());
        self.error_message = Some(None);
        self.task_reference = Some(None);
        self.completed_at = Some(None);
        self
    }
}

pub fn insert_consultation(conn: &Connection, c: &Consultation) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO consultations (id, patient_id, doctor_id, audio_reference, audio_content_type,
         status, transcript_text, transcript_segments, duration_secs, summary, suggested_codes,
         confirmed_codes, error_message, task_reference, created_at, updated_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            c.id.to_string(),
            c.patient_id,
            c.doctor_id,
            c.audio_reference,
            c.audio_content_type,
            c.status.as_str(),
            c.transcript_text,
            to_json("transcript_segments", &c.transcript_segments)?,
            c.duration_secs,
            c.summary.as_ref().map(|s| to_json("summary", s)).transpose()?,
            to_json("suggested_codes", &c.suggested_codes)?,
            to_json("confirmed_codes", &c.confirmed_codes)?,
            c.error_message,
            c.task_reference.map(|t| t.to_string()),
            format_timestamp(&c.created_at),
            format_timestamp(&c.updated_at),
            c.completed_at.as_ref().map(format_timestamp),
        ],
    )
    .map_err(|e| match e {
        rusqlite::Error::SqliteFailure(f, msg)
            if f.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            DatabaseError::ConstraintViolation(msg.unwrap_or_else(|| "consultations".into()))
        }
        other => other.into(),
    })?;
    Ok(())
}

pub fn get_consultation(conn: &Connection, id: &Uuid) -> Result<Option<Consultation>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, patient_id, doctor_id, audio_reference, audio_content_type, status,
         transcript_text, transcript_segments, duration_secs, summary, suggested_codes,
         confirmed_codes, error_message, task_reference, created_at, updated_at, completed_at
         FROM consultations WHERE id = ?1",
    )?;

    let result = stmt.query_row(params![id.to_string()], |row| {
        Ok(ConsultationRow {
            id: row.get(0)?,
            patient_id: row.get(1)?,
            doctor_id: row.get(2)?,
            audio_reference: row.get(3)?,
            audio_content_type: row.get(4)?,
            status: row.get(5)?,
            transcript_text: row.get(6)?,
            transcript_segments: row.get(7)?,
            duration_secs: row.get(8)?,
            summary: row.get(9)?,
            suggested_codes: row.get(10)?,
            confirmed_codes: row.get(11)?,
            error_message: row.get(12)?,
            task_reference: row.get(13)?,
            created_at: row.get(14)?,
            updated_at: row.get(15)?,
            completed_at: row.get(16)?,
        })
    });

    match result {
        Ok(row) => Ok(Some(consultation_from_row(row)?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Apply `patch` only if the row is currently in one of `expected` states.
///
/// Returns `false` when the compare-and-set lost (row missing or in another state).
/// A patch that moves `status` along an edge not in the state graph is rejected outright.
pub fn update_consultation(
    conn: &Connection,
    id: &Uuid,
    expected: &[ConsultationStatus],
    patch: &ConsultationPatch,
) -> Result<bool, DatabaseError> {
    if expected.is_empty() {
        return Err(DatabaseError::ConstraintViolation(
            "update without an expected status".into(),
        ));
    }
    if let Some(next) = patch.status {
        if let Some(from) = expected.iter().find(|from| !from.can_transition_to(next)) {
            return Err(DatabaseError::ConstraintViolation(format!(
                "illegal transition {from} -> {next}"
            )));
        }
    }

    let mut sets: Vec<&'static str> = vec!["updated_at = ?"];
    let mut values: Vec<Value> = vec![Value::Text(format_timestamp(&Utc::now()))];

    if let Some(status) = patch.status {
        sets.push("status = ?");
        values.push(Value::Text(status.as_str().into()));
    }
    if let Some(transcript) = &patch.transcript {
        sets.push("transcript_text = ?");
        sets.push("transcript_segments = ?");
        sets.push("duration_secs = ?");
        match transcript {
            Some(t) => {
                values.push(Value::Text(t.text.clone()));
                values.push(Value::Text(to_json("transcript_segments", &t.segments)?));
                values.push(t.duration_secs.map_or(Value::Null, Value::Real));
            }
            None => {
                values.push(Value::Null);
                values.push(Value::Text("[]".into()));
                values.push(Value::Null);
            }
        }
    }
    if let Some(summary) = &patch.summary {
        sets.push("summary = ?");
        values.push(optional_text(
            summary.as_ref().map(|s| to_json("summary", s)).transpose()?,
        ));
    }
    if let Some(codes) = &patch.suggested_codes {
        sets.push("suggested_codes = ?");
        values.push(Value::Text(to_json("suggested_codes", codes)?));
    }
    if let Some(message) = &patch.error_message {
        sets.push("error_message = ?");
        values.push(optional_text(message.clone()));
    }
    if let Some(reference) = &patch.task_reference {
        sets.push("task_reference = ?");
        values.push(optional_text(reference.map(|r| r.to_string())));
    }
    if let Some(completed_at) = &patch.completed_at {
        sets.push("completed_at = ?");
        values.push(optional_text(completed_at.as_ref().map(format_timestamp)));
    }

    let placeholders = vec!["?"; expected.len()].join(", ");
    let mut sql = format!(
        "UPDATE consultations SET {} WHERE id = ? AND status IN ({placeholders})",
        sets.join(", ")
    );
    values.push(Value::Text(id.to_string()));
    values.extend(expected.iter().map(|s| Value::Text(s.as_str().into())));
    if let Some(task) = &patch.expected_task {
        sql.push_str(" AND task_reference = ?");
        values.push(Value::Text(task.to_string()));
    }

    let rows = conn.execute(&sql, params_from_iter(values))?;
    Ok(rows == 1)
}

/// Record `reference` as the outstanding task, only if no task is outstanding
/// and the consultation is waiting in `queued`.
pub fn claim_task_reference(
    conn: &Connection,
    id: &Uuid,
    reference: &TaskReference,
) -> Result<bool, DatabaseError> {
    let rows = conn.execute(
        "UPDATE consultations SET task_reference = ?2, updated_at = ?3
         WHERE id = ?1 AND task_reference IS NULL AND status = 'queued'",
        params![
            id.to_string(),
            reference.to_string(),
            format_timestamp(&Utc::now())
        ],
    )?;
    Ok(rows == 1)
}

/// Replace the reviewer-confirmed codes. Never touched by the pipeline.
pub fn set_confirmed_codes(
    conn: &Connection,
    id: &Uuid,
    codes: &[String],
) -> Result<(), DatabaseError> {
    let rows = conn.execute(
        "UPDATE consultations SET confirmed_codes = ?2, updated_at = ?3 WHERE id = ?1",
        params![
            id.to_string(),
            to_json("confirmed_codes", &codes)?,
            format_timestamp(&Utc::now())
        ],
    )?;
    if rows == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "Consultation".into(),
            id: id.to_string(),
        });
    }
    Ok(())
}

pub fn delete_consultation(conn: &Connection, id: &Uuid) -> Result<bool, DatabaseError> {
    let rows = conn.execute(
        "DELETE FROM consultations WHERE id = ?1",
        params![id.to_string()],
    )?;
    Ok(rows == 1)
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

struct ConsultationRow {
    id: String,
    patient_id: String,
    doctor_id: String,
    audio_reference: String,
    audio_content_type: String,
    status: String,
    transcript_text: Option<String>,
    transcript_segments: String,
    duration_secs: Option<f64>,
    summary: Option<String>,
    suggested_codes: String,
    confirmed_codes: String,
    error_message: Option<String>,
    task_reference: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

fn consultation_from_row(row: ConsultationRow) -> Result<Consultation, DatabaseError> {
    Ok(Consultation {
        id: Uuid::parse_str(&row.id).map_err(|e| malformed("id", e))?,
        patient_id: row.patient_id,
        doctor_id: row.doctor_id,
        audio_reference: row.audio_reference,
        audio_content_type: row.audio_content_type,
        status: ConsultationStatus::from_str(&row.status)?,
        transcript_text: row.transcript_text,
        transcript_segments: from_json("transcript_segments", &row.transcript_segments)?,
        duration_secs: row.duration_secs,
        summary: row
            .summary
            .as_deref()
            .map(|s| from_json("summary", s))
            .transpose()?,
        suggested_codes: from_json("suggested_codes", &row.suggested_codes)?,
        confirmed_codes: from_json("confirmed_codes", &row.confirmed_codes)?,
        error_message: row.error_message,
        task_reference: row
            .task_reference
            .as_deref()
            .map(TaskReference::from_str)
            .transpose()
            .map_err(|e| malformed("task_reference", e))?,
        created_at: parse_timestamp("created_at", &row.created_at)?,
        updated_at: parse_timestamp("updated_at", &row.updated_at)?,
        completed_at: row
            .completed_at
            .as_deref()
            .map(|s| parse_timestamp("completed_at", s))
            .transpose()?,
    })
}

pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(column: &str, value: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| malformed(column, e))
}

fn to_json<T: serde::Serialize + ?Sized>(column: &str, value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| malformed(column, e))
}

fn from_json<T: serde::de::DeserializeOwned>(column: &str, raw: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(raw).map_err(|e| malformed(column, e))
}

fn optional_text(value: Option<String>) -> Value {
    value.map_or(Value::Null, Value::Text)
}

fn malformed(column: &str, e: impl std::fmt::Display) -> DatabaseError {
    DatabaseError::Malformed {
        column: column.into(),
        reason: e.to_string(),
    }
}
