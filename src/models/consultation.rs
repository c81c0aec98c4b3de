use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::ConsultationStatus;

/// Identifier of one dispatched unit of work.
///
/// A retry of the same task keeps its reference; a reprocess mints a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskReference(Uuid);

impl TaskReference {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskReference {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for TaskReference {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// One timed span of the transcript, in seconds from the start of the recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Output of the transcription stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    pub segments: Vec<TranscriptSegment>,
    pub duration_secs: Option<f64>,
}

/// SOAP-style clinical summary of a consultation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClinicalSummary {
    pub chief_complaint: String,
    pub history_of_present_illness: String,
    pub physical_exam: String,
    pub assessment: String,
    pub plan: String,
}

/// A ranked diagnostic-code candidate. `confidence` is in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeSuggestion {
    pub code: String,
    pub description: String,
    pub confidence: f32,
}

/// What the summarizer knows about the patient beyond the transcript.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatientContext {
    pub patient_id: String,
    pub name: Option<String>,
    pub age_years: Option<u32>,
}

impl PatientContext {
    pub fn anonymous(patient_id: &str) -> Self {
        Self {
            patient_id: patient_id.to_string(),
            ..Default::default()
        }
    }
}

/// One recorded consultation and everything the pipeline derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Consultation {
    pub id: Uuid,
    pub patient_id: String,
    pub doctor_id: String,
    pub audio_reference: String,
    pub audio_content_type: String,
    pub status: ConsultationStatus,
    pub transcript_text: Option<String>,
    pub transcript_segments: Vec<TranscriptSegment>,
    pub duration_secs: Option<f64>,
    pub summary: Option<ClinicalSummary>,
    pub suggested_codes: Vec<CodeSuggestion>,
    pub confirmed_codes: Vec<String>,
    pub error_message: Option<String>,
    pub task_reference: Option<TaskReference>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Consultation {
    /// A fresh record in `uploading`, before its audio has been stored.
    pub fn new_upload(
        id: Uuid,
        patient_id: &str,
        doctor_id: &str,
        audio_reference: &str,
        audio_content_type: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            patient_id: patient_id.to_string(),
            doctor_id: doctor_id.to_string(),
            audio_reference: audio_reference.to_string(),
            audio_content_type: audio_content_type.to_string(),
            status: ConsultationStatus::Uploading,
            transcript_text: None,
            transcript_segments: Vec::new(),
            duration_secs: None,
            summary: None,
            suggested_codes: Vec::new(),
            confirmed_codes: Vec::new(),
            error_message: None,
            task_reference: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn transcript(&self) -> Option<Transcript> {
        self.transcript_text.as_ref().map(|text| Transcript {
            text: text.clone(),
            segments: self.transcript_segments.clone(),
            duration_secs: self.duration_secs,
        })
    }
}
