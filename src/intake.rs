//! Ingestion gate: validates an uploaded recording, stores it, creates the
//! consultation record and hands it to the dispatcher.

use std::sync::Arc;

use uuid::Uuid;

use crate::config::Settings;
use crate::db::{ConsultationPatch, DatabaseError, RecordStore};
use crate::models::{Consultation, ConsultationStatus, TaskReference};
use crate::pipeline::dispatch::{DispatchError, Dispatcher};
use crate::storage::{AudioStore, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("Unsupported audio type: {0}")]
    UnsupportedContentType(String),

    #[error("Audio file is empty")]
    EmptyAudio,

    #[error("Audio file too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },

    #[error("Invalid {field}: {value:?}")]
    InvalidIdentifier { field: &'static str, value: String },

    #[error("Failed to store audio: {0}")]
    Storage(#[from] StorageError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Consultation {consultation_id} could not be dispatched: {source}")]
    Dispatch {
        consultation_id: Uuid,
        #[source]
        source: DispatchError,
    },

    #[error("Consultation not found: {0}")]
    NotFound(Uuid),

    #[error("Consultation {0} left uploading unexpectedly")]
    Conflict(Uuid),
}

impl IntakeError {
    /// Caller errors, as opposed to infrastructure failures.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            IntakeError::UnsupportedContentType(_)
                | IntakeError::EmptyAudio
                | IntakeError::TooLarge { .. }
                | IntakeError::InvalidIdentifier { .. }
        )
    }
}

/// An uploaded consultation recording.
#[derive(Debug, Clone)]
pub struct AudioUpload {
    pub patient_id: String,
    pub doctor_id: String,
    pub content_type: String,
    /// Client-side file name, used only to pick an extension for types
    /// without a known one.
    pub file_name: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntakeReceipt {
    pub consultation_id: Uuid,
    pub audio_reference: String,
    pub task_reference: TaskReference,
}

#[derive(Debug, Clone)]
pub struct IntakePolicy {
    pub accepted_content_types: Vec<String>,
    pub max_audio_bytes: u64,
}

impl From<&Settings> for IntakePolicy {
    fn from(s: &Settings) -> Self {
        Self {
            accepted_content_types: s.accepted_content_types.clone(),
            max_audio_bytes: s.max_audio_bytes,
        }
    }
}

impl Default for IntakePolicy {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

pub struct IngestionGate {
    store: Arc<dyn RecordStore>,
    audio: Arc<dyn AudioStore>,
    dispatcher: Arc<Dispatcher>,
    policy: IntakePolicy,
}

impl IngestionGate {
    pub fn new(
        store: Arc<dyn RecordStore>,
        audio: Arc<dyn AudioStore>,
        dispatcher: Arc<Dispatcher>,
        policy: IntakePolicy,
    ) -> Self {
        Self {
            store,
            audio,
            dispatcher,
            policy,
        }
    }

    /// Validate, store and enqueue a recording.
    ///
    /// The record is created in `uploading` before the audio is written and
    /// deleted again if the write fails, so a record never points at missing
    /// audio once it is `queued`. If the task cannot be enqueued the record is
    /// left `failed` with the cause, ready for reprocessing.
    pub async fn submit(&self, upload: AudioUpload) -> Result<IntakeReceipt, IntakeError> {
        let content_type = upload.content_type.trim().to_ascii_lowercase();
        self.validate(&upload, &content_type)?;

        let id = Uuid::new_v4();
        let extension = extension_for(&content_type, upload.file_name.as_deref());
        let key = format!("{}/{}/{id}.{extension}", upload.doctor_id, upload.patient_id);

        let record = Consultation::new_upload(
            id,
            &upload.patient_id,
            &upload.doctor_id,
            &key,
            &content_type,
        );
        self.store.insert(&record)?;

        if let Err(e) = self.audio.put(&key, &upload.bytes, &content_type).await {
            tracing::warn!(consultation_id = %id, error = %e, "Audio upload failed, rolling back");
            if let Err(rollback) = self.store.delete(&id) {
                tracing::error!(
                    consultation_id = %id,
                    error = %rollback,
                    "Rollback of consultation record failed"
                );
            }
            return Err(e.into());
        }

        let queued = ConsultationPatch::status(ConsultationStatus::Queued);
        if !self
            .store
            .update(&id, &[ConsultationStatus::Uploading], &queued)?
        {
            return Err(IntakeError::Conflict(id));
        }

        let task_reference = self
            .dispatcher
            .dispatch(id)
            .await
            .map_err(|source| IntakeError::Dispatch {
                consultation_id: id,
                source,
            })?;
        tracing::info!(
            consultation_id = %id,
            patient_id = %upload.patient_id,
            size = upload.bytes.len(),
            content_type = %content_type,
            "Consultation accepted"
        );

        Ok(IntakeReceipt {
            consultation_id: id,
            audio_reference: key,
            task_reference,
        })
    }

    /// Delete a consultation and, best effort, its audio.
    pub async fn discard(&self, consultation_id: Uuid) -> Result<(), IntakeError> {
        let record = self
            .store
            .get(&consultation_id)?
            .ok_or(IntakeError::NotFound(consultation_id))?;

        if let Err(e) = self.audio.remove(&record.audio_reference).await {
            tracing::warn!(
                consultation_id = %consultation_id,
                error = %e,
                "Could not remove consultation audio"
            );
        }

        if !self.store.delete(&consultation_id)? {
            return Err(IntakeError::NotFound(consultation_id));
        }
        tracing::info!(consultation_id = %consultation_id, "Consultation deleted");
        Ok(())
    }

    fn validate(&self, upload: &AudioUpload, content_type: &str) -> Result<(), IntakeError> {
        check_identifier("patient_id", &upload.patient_id)?;
        check_identifier("doctor_id", &upload.doctor_id)?;

        if !self
            .policy
            .accepted_content_types
            .iter()
            .any(|t| t == content_type)
        {
            return Err(IntakeError::UnsupportedContentType(upload.content_type.clone()));
        }
        if upload.bytes.is_empty() {
            return Err(IntakeError::EmptyAudio);
        }
        let size = upload.bytes.len() as u64;
        if size > self.policy.max_audio_bytes {
            return Err(IntakeError::TooLarge {
                size,
                max: self.policy.max_audio_bytes,
            });
        }
        Ok(())
    }
}

/// Identifiers become path segments of the audio key.
fn check_identifier(field: &'static str, value: &str) -> Result<(), IntakeError> {
    let ok = !value.is_empty()
        && value.len() <= 128
        && value != "."
        && value != ".."
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(IntakeError::InvalidIdentifier {
            field,
            value: value.to_string(),
        })
    }
}

fn extension_for(content_type: &str, file_name: Option<&str>) -> String {
    let known = match content_type {
        "audio/wav" | "audio/x-wav" | "audio/wave" => Some("wav"),
        "audio/mp3" | "audio/mpeg" => Some("mp3"),
        "audio/m4a" | "audio/x-m4a" | "audio/mp4" => Some("m4a"),
        "audio/webm" => Some("webm"),
        "audio/ogg" => Some("ogg"),
        _ => None,
    };
    if let Some(ext) = known {
        return ext.to_string();
    }
    file_name
        .and_then(|n| n.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| "bin".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteRecordStore;
    use crate::pipeline::dispatch::MemoryTaskQueue;
    use crate::storage::MemoryAudioStore;

    struct Rig {
        store: Arc<SqliteRecordStore>,
        audio: Arc<MemoryAudioStore>,
        queue: Arc<MemoryTaskQueue>,
        gate: IngestionGate,
    }

    fn rig() -> Rig {
        let store = Arc::new(SqliteRecordStore::in_memory().unwrap());
        let audio = Arc::new(MemoryAudioStore::new());
        let queue = Arc::new(MemoryTaskQueue::new());
        let dispatcher = Arc::new(Dispatcher::new(store.clone(), queue.clone()));
        let gate = IngestionGate::new(
            store.clone(),
            audio.clone(),
            dispatcher,
            IntakePolicy {
                accepted_content_types: vec!["audio/wav".into(), "audio/mpeg".into(), "audio/flac".into()],
                max_audio_bytes: 16,
            },
        );
        Rig {
            store,
            audio,
            queue,
            gate,
        }
    }

    fn upload(content_type: &str, bytes: &[u8]) -> AudioUpload {
        AudioUpload {
            patient_id: "P1".into(),
            doctor_id: "D1".into(),
            content_type: content_type.into(),
            file_name: Some("consulta.wav".into()),
            bytes: bytes.to_vec(),
        }
    }

    #[tokio::test]
    async fn accepted_upload_is_stored_queued_and_dispatched() {
        let rig = rig();
        let receipt = rig.gate.submit(upload("audio/wav", b"RIFF")).await.unwrap();

        assert!(receipt.audio_reference.starts_with("D1/P1/"));
        assert!(receipt.audio_reference.ends_with(".wav"));
        assert!(rig.audio.contains(&receipt.audio_reference).await);

        let c = rig.store.get(&receipt.consultation_id).unwrap().unwrap();
        assert_eq!(c.status, ConsultationStatus::Queued);
        assert_eq!(c.task_reference, Some(receipt.task_reference));

        let delivery = rig.queue.try_next().unwrap();
        assert_eq!(delivery.task.consultation_id, receipt.consultation_id);
    }

    #[tokio::test]
    async fn content_type_is_case_insensitive() {
        let rig = rig();
        let receipt = rig.gate.submit(upload("Audio/MPEG", b"ID3")).await.unwrap();
        assert!(receipt.audio_reference.ends_with(".mp3"));
    }

    #[tokio::test]
    async fn validation_errors_create_nothing() {
        let rig = rig();
        for (bad, expected_validation) in [
            (upload("video/mp4", b"x"), true),
            (upload("audio/wav", b""), true),
            (upload("audio/wav", &[0u8; 17]), true),
            (
                AudioUpload {
                    patient_id: "../P1".into(),
                    ..upload("audio/wav", b"x")
                },
                true,
            ),
        ] {
            let err = rig.gate.submit(bad).await.unwrap_err();
            assert_eq!(err.is_validation(), expected_validation, "{err}");
        }
        assert!(rig.queue.try_next().is_none());
    }

    #[tokio::test]
    async fn failed_upload_rolls_back_record() {
        let rig = rig();
        rig.audio.fail_puts(true);

        let err = rig.gate.submit(upload("audio/wav", b"RIFF")).await.unwrap_err();
        assert!(matches!(err, IntakeError::Storage(_)));
        assert!(!err.is_validation());
        assert!(rig.queue.try_next().is_none());
    }

    #[tokio::test]
    async fn enqueue_failure_leaves_reprocessable_failure() {
        let rig = rig();
        rig.queue.close();

        let err = rig.gate.submit(upload("audio/wav", b"RIFF")).await.unwrap_err();
        let consultation_id = match err {
            IntakeError::Dispatch {
                consultation_id,
                source: DispatchError::QueueClosed,
            } => consultation_id,
            other => panic!("unexpected error: {other}"),
        };

        let c = rig.store.get(&consultation_id).unwrap().expect("record kept");
        assert_eq!(c.status, ConsultationStatus::Failed);
        assert!(c.error_message.unwrap().contains("could not be enqueued"));
        assert!(rig.audio.contains(&c.audio_reference).await);
    }

    #[tokio::test]
    async fn discard_removes_record_and_audio() {
        let rig = rig();
        let receipt = rig.gate.submit(upload("audio/wav", b"RIFF")).await.unwrap();

        rig.gate.discard(receipt.consultation_id).await.unwrap();
        assert!(rig.store.get(&receipt.consultation_id).unwrap().is_none());
        assert!(!rig.audio.contains(&receipt.audio_reference).await);

        assert!(matches!(
            rig.gate.discard(receipt.consultation_id).await,
            Err(IntakeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn discard_tolerates_missing_audio() {
        let rig = rig();
        let receipt = rig.gate.submit(upload("audio/wav", b"RIFF")).await.unwrap();
        rig.audio.remove(&receipt.audio_reference).await.unwrap();
        rig.gate.discard(receipt.consultation_id).await.unwrap();
    }

    #[test]
    fn extension_prefers_content_type() {
        assert_eq!(extension_for("audio/x-m4a", Some("a.mp4")), "m4a");
        assert_eq!(extension_for("audio/flac", Some("Gravação.FLAC")), "flac");
        assert_eq!(extension_for("audio/flac", None), "bin");
    }

    #[test]
    fn identifiers_are_path_safe() {
        assert!(check_identifier("patient_id", "a1b2-c3_d4.e").is_ok());
        for bad in ["", "..", "a/b", "a b", "ção"] {
            assert!(check_identifier("patient_id", bad).is_err(), "{bad}");
        }
    }
}
