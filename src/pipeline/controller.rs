//! Consultation state machine.
//!
//! Drives one consultation through transcription, summarization and code
//! suggestion, persisting after every stage. Every write is a compare-and-set
//! on the status the controller last observed, guarded by the task reference
//! when running on behalf of a dispatched task. A lost compare-and-set means
//! another delivery or a reprocess moved the record, and this run stops
//! without applying anything further.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::config::Settings;
use crate::db::{ConsultationPatch, DatabaseError, RecordStore};
use crate::models::{
    ClinicalSummary, Consultation, ConsultationStatus, Stage, TaskReference, Transcript,
};
use crate::pipeline::coding::{rank, CodeSuggester, SuggestionError, SuggestionOutcome};
use crate::pipeline::dispatch::{DispatchError, Dispatcher, Task};
use crate::pipeline::patients::{patient_context, PatientDirectory};
use crate::pipeline::summarization::{SummarizationError, Summarizer};
use crate::pipeline::transcription::{Transcriber, TranscriptionError};
use crate::storage::scratch::extension_of;
use crate::storage::{AudioStore, ScratchAudio, StorageError};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// What went wrong inside a stage.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("audio unavailable: {0}")]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Transcription(#[from] TranscriptionError),

    #[error("{0}")]
    Summarization(#[from] SummarizationError),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl StageError {
    pub fn is_transient(&self) -> bool {
        match self {
            StageError::Timeout(_) => true,
            StageError::Storage(StorageError::Io(_)) => true,
            StageError::Storage(_) => false,
            StageError::Transcription(e) => e.is_transient(),
            StageError::Summarization(e) => e.is_transient(),
        }
    }
}

/// A stage failed. The dispatcher decides whether to retry.
#[derive(Debug, thiserror::Error)]
#[error("{stage} failed: {error}")]
pub struct StageFailure {
    pub stage: Stage,
    #[source]
    pub error: StageError,
}

impl StageFailure {
    fn at(stage: Stage) -> impl FnOnce(StageError) -> StageFailure {
        move |error| StageFailure { stage, error }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Stage(#[from] StageFailure),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Consultation not found: {0}")]
    NotFound(Uuid),

    #[error("Consultation {id} cannot be reprocessed from status {status}")]
    NotReprocessable {
        id: Uuid,
        status: ConsultationStatus,
    },

    #[error("Consultation {0} was modified concurrently")]
    Conflict(Uuid),
}

impl PipelineError {
    /// The stage that failed, for stage failures.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::Stage(f) => Some(f.stage),
            _ => None,
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Stage(f) => f.error.is_transient(),
            PipelineError::Database(_) => true,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum AdvanceOutcome {
    Completed {
        consultation_id: Uuid,
        suggestions: SuggestionOutcome,
    },
    Skipped(SkipReason),
}

/// Why a delivery did nothing. All are normal under at-least-once delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotFound,
    NotProcessable(ConsultationStatus),
    StaleTask,
    Superseded,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Deadline for the audio fetch and for each adapter call.
    pub stage_timeout: Duration,
    pub language_hint: Option<String>,
    pub scratch_dir: Option<PathBuf>,
    pub suggestion_top_n: usize,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            stage_timeout: Duration::from_secs(300),
            language_hint: Some("pt".to_string()),
            scratch_dir: None,
            suggestion_top_n: 3,
        }
    }
}

impl From<&Settings> for ControllerSettings {
    fn from(s: &Settings) -> Self {
        Self {
            stage_timeout: s.stage_timeout,
            language_hint: Some(s.language_hint.clone()),
            scratch_dir: s.scratch_dir.clone(),
            suggestion_top_n: s.suggestion_top_n,
        }
    }
}

/// External services the pipeline calls into.
#[derive(Clone)]
pub struct PipelineAdapters {
    pub transcriber: Arc<dyn Transcriber>,
    pub summarizer: Arc<dyn Summarizer>,
    pub suggester: Arc<dyn CodeSuggester>,
    pub patients: Arc<dyn PatientDirectory>,
}

pub struct PipelineController {
    store: Arc<dyn RecordStore>,
    audio: Arc<dyn AudioStore>,
    adapters: PipelineAdapters,
    dispatcher: Arc<Dispatcher>,
    settings: ControllerSettings,
}

impl PipelineController {
    pub fn new(
        store: Arc<dyn RecordStore>,
        audio: Arc<dyn AudioStore>,
        adapters: PipelineAdapters,
        dispatcher: Arc<Dispatcher>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            store,
            audio,
            adapters,
            dispatcher,
            settings,
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Advance a consultation as far as it will go in one pass.
    ///
    /// Records that are not `queued`, `transcribing` or `summarizing` are
    /// skipped, which makes duplicate deliveries harmless.
    pub async fn advance(&self, consultation_id: Uuid) -> Result<AdvanceOutcome, PipelineError> {
        let Some(record) = self.store.get(&consultation_id)? else {
            return Ok(AdvanceOutcome::Skipped(SkipReason::NotFound));
        };
        self.advance_record(record, None).await
    }

    /// Worker entry point: advance on behalf of a dispatched task.
    pub async fn run_task(&self, task: &Task) -> Result<AdvanceOutcome, PipelineError> {
        let Some(record) = self.store.get(&task.consultation_id)? else {
            return Ok(AdvanceOutcome::Skipped(SkipReason::NotFound));
        };
        if !record.status.is_in_progress() {
            return Ok(AdvanceOutcome::Skipped(SkipReason::NotProcessable(
                record.status,
            )));
        }
        if record.task_reference != Some(task.reference) {
            tracing::debug!(
                consultation_id = %task.consultation_id,
                task_reference = %task.reference,
                "Ignoring delivery for a superseded task"
            );
            return Ok(AdvanceOutcome::Skipped(SkipReason::StaleTask));
        }
        self.advance_record(record, Some(task.reference)).await
    }

    /// Mark a task's consultation `failed` once its retry budget is spent.
    ///
    /// With `failed_stage` set, the write only lands while the record still
    /// sits in that stage's status, so a concurrent copy of the task that
    /// has already moved past it is left alone. Returns `false` when the
    /// record already moved on (completed, failed, past the failing stage,
    /// or taken over by a newer task).
    pub fn record_failure(
        &self,
        consultation_id: Uuid,
        reference: TaskReference,
        failed_stage: Option<Stage>,
        message: &str,
    ) -> Result<bool, PipelineError> {
        let message = match message.trim() {
            "" => "processing failed",
            m => m,
        };
        let expected = match failed_stage {
            Some(stage) => vec![stage.running_status()],
            None => ConsultationStatus::IN_PROGRESS.to_vec(),
        };
        let patch = ConsultationPatch::status(ConsultationStatus::Failed)
            .with_error(message)
            .only_for_task(Some(reference));
        let applied = self.store.update(&consultation_id, &expected, &patch)?;

        if applied {
            tracing::error!(
                consultation_id = %consultation_id,
                task_reference = %reference,
                error = %message,
                "Consultation failed"
            );
        } else {
            tracing::debug!(
                consultation_id = %consultation_id,
                task_reference = %reference,
                stage = ?failed_stage,
                "Failure not recorded: consultation already moved on"
            );
        }
        Ok(applied)
    }

    /// Reset a `failed` or `completed` consultation and dispatch it again.
    ///
    /// The run always restarts from transcription. Reviewer-confirmed codes
    /// are kept. A `queued` record is also accepted when its task never
    /// reached the queue (no reference, or a reference with no pending
    /// delivery); it is dispatched under a fresh reference.
    pub async fn reprocess(&self, consultation_id: Uuid) -> Result<TaskReference, PipelineError> {
        let record = self
            .store
            .get(&consultation_id)?
            .ok_or(PipelineError::NotFound(consultation_id))?;

        if ConsultationStatus::REPROCESSABLE.contains(&record.status) {
            let patch = ConsultationPatch::status(ConsultationStatus::Queued).clear_run_outputs();
            if !self
                .store
                .update(&consultation_id, &[record.status], &patch)?
            {
                return Err(PipelineError::Conflict(consultation_id));
            }
        } else if record.status == ConsultationStatus::Queued {
            self.release_stranded_task(&record).await?;
        } else {
            return Err(PipelineError::NotReprocessable {
                id: consultation_id,
                status: record.status,
            });
        }

        let reference = self.dispatcher.dispatch(consultation_id).await?;
        tracing::info!(
            consultation_id = %consultation_id,
            previous_status = %record.status,
            task_reference = %reference,
            "Consultation reprocessing"
        );
        Ok(reference)
    }

    /// Clear the reference of a `queued` record whose task can no longer
    /// reach a worker. Fails with `NotReprocessable` while a delivery for it
    /// is still pending.
    async fn release_stranded_task(&self, record: &Consultation) -> Result<(), PipelineError> {
        let Some(reference) = record.task_reference else {
            return Ok(());
        };
        if self.dispatcher.is_outstanding(&reference).await? {
            return Err(PipelineError::NotReprocessable {
                id: record.id,
                status: record.status,
            });
        }

        tracing::warn!(
            consultation_id = %record.id,
            task_reference = %reference,
            "Queued consultation has no pending delivery, releasing its task"
        );
        let release = ConsultationPatch::default()
            .clear_task()
            .only_for_task(Some(reference));
        if !self
            .store
            .update(&record.id, &[ConsultationStatus::Queued], &release)?
        {
            return Err(PipelineError::Conflict(record.id));
        }
        Ok(())
    }

    async fn advance_record(
        &self,
        mut record: Consultation,
        task: Option<TaskReference>,
    ) -> Result<AdvanceOutcome, PipelineError> {
        let id = record.id;

        match record.status {
            ConsultationStatus::Queued => {
                let patch = ConsultationPatch::status(ConsultationStatus::Transcribing)
                    .only_for_task(task);
                if !self
                    .store
                    .update(&id, &[ConsultationStatus::Queued], &patch)?
                {
                    return Ok(AdvanceOutcome::Skipped(SkipReason::Superseded));
                }
                record.status = ConsultationStatus::Transcribing;
            }
            ConsultationStatus::Transcribing | ConsultationStatus::Summarizing => {
                tracing::info!(
                    consultation_id = %id,
                    status = %record.status,
                    "Resuming consultation"
                );
            }
            other => return Ok(AdvanceOutcome::Skipped(SkipReason::NotProcessable(other))),
        }

        // Transcription
        if record.status == ConsultationStatus::Transcribing {
            let transcript = self
                .transcribe(&record)
                .await
                .map_err(StageFailure::at(Stage::Transcription))?;

            let patch = ConsultationPatch::status(ConsultationStatus::Summarizing)
                .with_transcript(transcript.clone())
                .only_for_task(task);
            if !self
                .store
                .update(&id, &[ConsultationStatus::Transcribing], &patch)?
            {
                return Ok(AdvanceOutcome::Skipped(SkipReason::Superseded));
            }
            record.transcript_text = Some(transcript.text);
            record.summary = None;
            record.status = ConsultationStatus::Summarizing;
        }

        // Summarization. A summary persisted by an earlier delivery is reused.
        let summary = match record.summary.take() {
            Some(summary) => summary,
            None => {
                let summary = self
                    .summarize(&record)
                    .await
                    .map_err(StageFailure::at(Stage::Summarization))?;

                let patch = ConsultationPatch::default()
                    .with_summary(summary.clone())
                    .only_for_task(task);
                if !self
                    .store
                    .update(&id, &[ConsultationStatus::Summarizing], &patch)?
                {
                    return Ok(AdvanceOutcome::Skipped(SkipReason::Superseded));
                }
                summary
            }
        };

        // Code suggestion never fails the consultation.
        let suggestions = self.suggest(id, &summary).await;

        let patch = ConsultationPatch::status(ConsultationStatus::Completed)
            .with_summary(summary)
            .with_suggested_codes(suggestions.clone().into_codes())
            .completed_now()
            .clear_task()
            .only_for_task(task);
        if !self
            .store
            .update(&id, &[ConsultationStatus::Summarizing], &patch)?
        {
            return Ok(AdvanceOutcome::Skipped(SkipReason::Superseded));
        }

        tracing::info!(
            consultation_id = %id,
            degraded_suggestions = suggestions.is_degraded(),
            "Consultation completed"
        );
        Ok(AdvanceOutcome::Completed {
            consultation_id: id,
            suggestions,
        })
    }

    async fn transcribe(&self, record: &Consultation) -> Result<Transcript, StageError> {
        tracing::info!(consultation_id = %record.id, "Transcription: fetching audio");
        let bytes = self.within(self.audio.get(&record.audio_reference)).await?;

        // Dropped on every return path below.
        let scratch = ScratchAudio::create(
            self.settings.scratch_dir.as_deref(),
            bytes,
            extension_of(&record.audio_reference),
            &record.audio_content_type,
        )
        .await?;

        tracing::info!(
            consultation_id = %record.id,
            content_type = %record.audio_content_type,
            "Transcription: calling transcriber"
        );
        let transcript = self
            .within(
                self.adapters
                    .transcriber
                    .transcribe(&scratch, self.settings.language_hint.as_deref()),
            )
            .await?;

        tracing::info!(
            consultation_id = %record.id,
            text_length = transcript.text.len(),
            segments = transcript.segments.len(),
            duration_secs = transcript.duration_secs,
            "Transcription: done"
        );
        Ok(transcript)
    }

    async fn summarize(&self, record: &Consultation) -> Result<ClinicalSummary, StageError> {
        let text = record
            .transcript_text
            .as_deref()
            .ok_or(SummarizationError::EmptyTranscript)?;

        tracing::info!(
            consultation_id = %record.id,
            text_length = text.len(),
            "Summarization: calling summarizer"
        );
        let adapters = &self.adapters;
        let summary = self
            .within(async {
                let patient = patient_context(adapters.patients.as_ref(), &record.patient_id).await;
                adapters.summarizer.summarize(text, &patient).await
            })
            .await?;

        tracing::info!(consultation_id = %record.id, "Summarization: done");
        Ok(summary)
    }

    async fn suggest(&self, consultation_id: Uuid, summary: &ClinicalSummary) -> SuggestionOutcome {
        let timeout = self.settings.stage_timeout;
        let result =
            match tokio::time::timeout(timeout, self.adapters.suggester.suggest_codes(summary))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(SuggestionError::Timeout(timeout)),
            };

        match result {
            Ok(codes) => {
                let codes = rank(codes, self.settings.suggestion_top_n);
                tracing::info!(
                    consultation_id = %consultation_id,
                    count = codes.len(),
                    "Code suggestion: done"
                );
                SuggestionOutcome::Ranked(codes)
            }
            Err(e) => {
                tracing::warn!(
                    consultation_id = %consultation_id,
                    stage = %Stage::CodeSuggestion,
                    error = %e,
                    "Code suggestion failed, continuing without codes"
                );
                SuggestionOutcome::Degraded {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Run `fut` under the stage deadline.
    async fn within<T, E>(&self, fut: impl Future<Output = Result<T, E>>) -> Result<T, StageError>
    where
        StageError: From<E>,
    {
        match tokio::time::timeout(self.settings.stage_timeout, fut).await {
            Ok(result) => result.map_err(StageError::from),
            Err(_) => Err(StageError::Timeout(self.settings.stage_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteRecordStore;
    use crate::models::CodeSuggestion;
    use crate::pipeline::coding::LlmCodeSuggester;
    use crate::pipeline::dispatch::MemoryTaskQueue;
    use crate::pipeline::llm::MockLlmClient;
    use crate::pipeline::patients::{AnonymousDirectory, StaticDirectory};
    use crate::pipeline::summarization::LlmSummarizer;
    use crate::pipeline::transcription::MockTranscriber;
    use crate::storage::MemoryAudioStore;

    const SUMMARY_JSON: &str = r#"{
        "chief_complaint": "Cefaleia há 3 dias",
        "history_present_illness": "Dor frontal, pior à tarde",
        "physical_exam": "Não mencionado",
        "assessment": "Cefaleia tensional",
        "plan": "Dipirona se dor"
    }"#;

    const CODES_JSON: &str =
        r#"{"suggestions":[{"code":"R51","description":"Cefaleia","confidence":"high"}]}"#;

    struct Harness {
        store: Arc<SqliteRecordStore>,
        audio: Arc<MemoryAudioStore>,
        queue: Arc<MemoryTaskQueue>,
        transcriber: Arc<MockTranscriber>,
        summary_llm: Arc<MockLlmClient>,
        controller: PipelineController,
    }

    fn harness_with(
        transcriber: MockTranscriber,
        summary_llm: MockLlmClient,
        codes_llm: MockLlmClient,
        settings: ControllerSettings,
    ) -> Harness {
        let store = Arc::new(SqliteRecordStore::in_memory().unwrap());
        let audio = Arc::new(MemoryAudioStore::new());
        let queue = Arc::new(MemoryTaskQueue::new());
        let transcriber = Arc::new(transcriber);
        let summary_llm = Arc::new(summary_llm);
        let dispatcher = Arc::new(Dispatcher::new(store.clone(), queue.clone()));
        let adapters = PipelineAdapters {
            transcriber: transcriber.clone(),
            summarizer: Arc::new(LlmSummarizer::new(summary_llm.clone())),
            suggester: Arc::new(LlmCodeSuggester::new(Arc::new(codes_llm), 3)),
            patients: Arc::new(StaticDirectory::new().with_patient("P1", "Maria Souza", Some(42))),
        };
        let controller = PipelineController::new(
            store.clone(),
            audio.clone(),
            adapters,
            dispatcher,
            settings,
        );
        Harness {
            store,
            audio,
            queue,
            transcriber,
            summary_llm,
            controller,
        }
    }

    fn harness() -> Harness {
        harness_with(
            MockTranscriber::new("Doutor, estou com dor de cabeça há três dias."),
            MockLlmClient::new(SUMMARY_JSON),
            MockLlmClient::new(CODES_JSON),
            ControllerSettings::default(),
        )
    }

    /// Insert a queued record with stored audio and an outstanding task.
    async fn queued(h: &Harness) -> (Uuid, Task) {
        let id = Uuid::new_v4();
        let key = format!("D1/P1/{id}.wav");
        h.audio.put(&key, b"RIFF....WAVE", "audio/wav").await.unwrap();
        let c = Consultation::new_upload(id, "P1", "D1", &key, "audio/wav");
        h.store.insert(&c).unwrap();
        h.store
            .update(
                &id,
                &[ConsultationStatus::Uploading],
                &ConsultationPatch::status(ConsultationStatus::Queued),
            )
            .unwrap();
        let reference = h.controller.dispatcher().dispatch(id).await.unwrap();
        let delivery = h.queue.try_next().unwrap();
        assert_eq!(delivery.task.reference, reference);
        (id, delivery.task)
    }

    #[tokio::test]
    async fn happy_path_completes_with_codes() {
        let h = harness();
        let (id, task) = queued(&h).await;

        let outcome = h.controller.run_task(&task).await.unwrap();
        assert_eq!(
            outcome,
            AdvanceOutcome::Completed {
                consultation_id: id,
                suggestions: SuggestionOutcome::Ranked(vec![CodeSuggestion {
                    code: "R51".into(),
                    description: "Cefaleia".into(),
                    confidence: 0.9,
                }]),
            }
        );

        let c = h.store.get(&id).unwrap().unwrap();
        assert_eq!(c.status, ConsultationStatus::Completed);
        assert!(c.transcript_text.unwrap().contains("dor de cabeça"));
        assert_eq!(c.summary.unwrap().assessment, "Cefaleia tensional");
        assert_eq!(c.suggested_codes[0].code, "R51");
        assert!(c.completed_at.is_some());
        assert!(c.task_reference.is_none());
        assert!(c.error_message.is_none());
    }

    #[tokio::test]
    async fn patient_context_reaches_summarizer() {
        let h = harness();
        let (_, task) = queued(&h).await;
        h.controller.run_task(&task).await.unwrap();

        let requests = h.summary_llm.requests();
        assert!(requests[0].user.contains("Maria Souza"));
        assert!(requests[0].user.contains("42 anos"));
    }

    #[tokio::test]
    async fn suggestion_failure_degrades_to_empty_codes() {
        let h = harness_with(
            MockTranscriber::new("dor de cabeça"),
            MockLlmClient::new(SUMMARY_JSON),
            MockLlmClient::failing(),
            ControllerSettings::default(),
        );
        let (id, task) = queued(&h).await;

        let outcome = h.controller.run_task(&task).await.unwrap();
        assert!(matches!(
            outcome,
            AdvanceOutcome::Completed {
                suggestions: SuggestionOutcome::Degraded { .. },
                ..
            }
        ));
        let c = h.store.get(&id).unwrap().unwrap();
        assert_eq!(c.status, ConsultationStatus::Completed);
        assert!(c.suggested_codes.is_empty());
    }

    #[tokio::test]
    async fn transcription_failure_leaves_record_transcribing() {
        let h = harness_with(
            MockTranscriber::always_unavailable(),
            MockLlmClient::new(SUMMARY_JSON),
            MockLlmClient::new(CODES_JSON),
            ControllerSettings::default(),
        );
        let (id, task) = queued(&h).await;

        let err = h.controller.run_task(&task).await.unwrap_err();
        match &err {
            PipelineError::Stage(f) => assert_eq!(f.stage, Stage::Transcription),
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.is_transient());

        let c = h.store.get(&id).unwrap().unwrap();
        assert_eq!(c.status, ConsultationStatus::Transcribing);
        assert_eq!(c.task_reference, Some(task.reference));
    }

    #[tokio::test]
    async fn retry_resumes_from_transcribing() {
        let h = harness_with(
            MockTranscriber::new("dor de cabeça").then(Err(TranscriptionError::Timeout(1))),
            MockLlmClient::new(SUMMARY_JSON),
            MockLlmClient::new(CODES_JSON),
            ControllerSettings::default(),
        );
        let (id, task) = queued(&h).await;

        assert!(h.controller.run_task(&task).await.is_err());
        let outcome = h.controller.run_task(&task.retry()).await.unwrap();
        assert!(matches!(outcome, AdvanceOutcome::Completed { .. }));
        assert_eq!(h.transcriber.calls(), 2);
        assert_eq!(
            h.store.get(&id).unwrap().unwrap().status,
            ConsultationStatus::Completed
        );
    }

    #[tokio::test]
    async fn invalid_summary_fails_summarization_stage() {
        let h = harness_with(
            MockTranscriber::new("dor"),
            MockLlmClient::new(r#"{"chief_complaint":"dor"}"#),
            MockLlmClient::new(CODES_JSON),
            ControllerSettings::default(),
        );
        let (id, task) = queued(&h).await;

        let err = h.controller.run_task(&task).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Stage(StageFailure {
                stage: Stage::Summarization,
                ..
            })
        ));
        let c = h.store.get(&id).unwrap().unwrap();
        assert_eq!(c.status, ConsultationStatus::Summarizing);
        assert!(c.transcript_text.is_some());
        assert!(c.summary.is_none());
    }

    #[tokio::test]
    async fn persisted_summary_is_reused_on_resume() {
        let h = harness();
        let (id, task) = queued(&h).await;

        // Simulate a crash after the summary was persisted.
        h.store
            .update(
                &id,
                &[ConsultationStatus::Queued],
                &ConsultationPatch::status(ConsultationStatus::Transcribing),
            )
            .unwrap();
        h.store
            .update(
                &id,
                &[ConsultationStatus::Transcribing],
                &ConsultationPatch::status(ConsultationStatus::Summarizing).with_transcript(
                    Transcript {
                        text: "dor".into(),
                        segments: vec![],
                        duration_secs: None,
                    },
                ),
            )
            .unwrap();
        let summary = crate::pipeline::summarization::parse_summary_response(SUMMARY_JSON).unwrap();
        h.store
            .update(
                &id,
                &[ConsultationStatus::Summarizing],
                &ConsultationPatch::default().with_summary(summary.clone()),
            )
            .unwrap();

        let outcome = h.controller.run_task(&task).await.unwrap();
        assert!(matches!(outcome, AdvanceOutcome::Completed { .. }));
        assert_eq!(h.transcriber.calls(), 0);
        assert!(h.summary_llm.requests().is_empty());
        assert_eq!(h.store.get(&id).unwrap().unwrap().summary, Some(summary));
    }

    #[tokio::test]
    async fn duplicate_delivery_after_completion_is_skipped() {
        let h = harness();
        let (id, task) = queued(&h).await;
        h.controller.run_task(&task).await.unwrap();
        let before = h.store.get(&id).unwrap().unwrap();

        let outcome = h.controller.run_task(&task).await.unwrap();
        assert_eq!(
            outcome,
            AdvanceOutcome::Skipped(SkipReason::NotProcessable(ConsultationStatus::Completed))
        );
        assert_eq!(h.transcriber.calls(), 1);
        assert_eq!(h.store.get(&id).unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn stale_task_is_skipped() {
        let h = harness();
        let (_, task) = queued(&h).await;
        let stale = Task {
            reference: TaskReference::new(),
            ..task
        };
        assert_eq!(
            h.controller.run_task(&stale).await.unwrap(),
            AdvanceOutcome::Skipped(SkipReason::StaleTask)
        );
        assert_eq!(h.transcriber.calls(), 0);
    }

    #[tokio::test]
    async fn deleted_record_is_skipped() {
        let h = harness();
        let (id, task) = queued(&h).await;
        h.store.delete(&id).unwrap();
        assert_eq!(
            h.controller.run_task(&task).await.unwrap(),
            AdvanceOutcome::Skipped(SkipReason::NotFound)
        );
    }

    #[tokio::test]
    async fn advance_without_task_drives_record() {
        let h = harness();
        let (id, _) = queued(&h).await;
        let outcome = h.controller.advance(id).await.unwrap();
        assert!(matches!(outcome, AdvanceOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn slow_transcriber_hits_stage_deadline_and_releases_scratch() {
        let h = harness_with(
            MockTranscriber::new("dor").with_delay(Duration::from_secs(5)),
            MockLlmClient::new(SUMMARY_JSON),
            MockLlmClient::new(CODES_JSON),
            ControllerSettings {
                stage_timeout: Duration::from_millis(50),
                ..ControllerSettings::default()
            },
        );
        let (_, task) = queued(&h).await;

        let err = h.controller.run_task(&task).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Stage(StageFailure {
                error: StageError::Timeout(_),
                ..
            })
        ));
        let seen = h.transcriber.seen_files();
        assert_eq!(seen.len(), 1);
        assert!(!seen[0].exists());
    }

    #[tokio::test]
    async fn missing_audio_is_a_permanent_stage_failure() {
        let h = harness();
        let (id, task) = queued(&h).await;
        let key = h.store.get(&id).unwrap().unwrap().audio_reference;
        h.audio.remove(&key).await.unwrap();

        let err = h.controller.run_task(&task).await.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(h.transcriber.calls(), 0);
    }

    #[tokio::test]
    async fn record_failure_sets_message_and_keeps_reference() {
        let h = harness();
        let (id, task) = queued(&h).await;

        assert!(h
            .controller
            .record_failure(id, task.reference, None, "transcription failed: 503")
            .unwrap());
        let c = h.store.get(&id).unwrap().unwrap();
        assert_eq!(c.status, ConsultationStatus::Failed);
        assert_eq!(c.error_message.as_deref(), Some("transcription failed: 503"));
        assert_eq!(c.task_reference, Some(task.reference));

        // Second call is a no-op.
        assert!(!h.controller.record_failure(id, task.reference, None, "again").unwrap());
    }

    #[tokio::test]
    async fn record_failure_never_writes_blank_message() {
        let h = harness();
        let (id, task) = queued(&h).await;
        h.controller.record_failure(id, task.reference, None, "  ").unwrap();
        let c = h.store.get(&id).unwrap().unwrap();
        assert!(!c.error_message.unwrap().trim().is_empty());
    }

    #[tokio::test]
    async fn record_failure_from_stale_task_is_ignored() {
        let h = harness();
        let (id, _) = queued(&h).await;
        assert!(!h
            .controller
            .record_failure(id, TaskReference::new(), None, "late failure")
            .unwrap());
        assert_eq!(
            h.store.get(&id).unwrap().unwrap().status,
            ConsultationStatus::Queued
        );
    }

    #[tokio::test]
    async fn failure_from_an_earlier_stage_does_not_clobber_progress() {
        let h = harness();
        let (id, task) = queued(&h).await;
        for (from, to) in [
            (ConsultationStatus::Queued, ConsultationStatus::Transcribing),
            (ConsultationStatus::Transcribing, ConsultationStatus::Summarizing),
        ] {
            assert!(h
                .store
                .update(&id, &[from], &ConsultationPatch::status(to))
                .unwrap());
        }

        // A copy of the task that gave up on transcription.
        assert!(!h
            .controller
            .record_failure(id, task.reference, Some(Stage::Transcription), "503")
            .unwrap());
        assert_eq!(
            h.store.get(&id).unwrap().unwrap().status,
            ConsultationStatus::Summarizing
        );

        assert!(h
            .controller
            .record_failure(id, task.reference, Some(Stage::Summarization), "bad json")
            .unwrap());
        let c = h.store.get(&id).unwrap().unwrap();
        assert_eq!(c.status, ConsultationStatus::Failed);
        assert_eq!(c.error_message.as_deref(), Some("bad json"));
    }

    #[tokio::test]
    async fn concurrent_copies_of_one_task_complete_once() {
        let h = harness_with(
            MockTranscriber::new("Dor de cabeça há três dias.").with_delay(Duration::from_millis(50)),
            MockLlmClient::new(SUMMARY_JSON),
            MockLlmClient::new(CODES_JSON),
            ControllerSettings::default(),
        );
        let (id, task) = queued(&h).await;

        let (a, b) = tokio::join!(h.controller.run_task(&task), h.controller.run_task(&task));
        let outcomes = [a.unwrap(), b.unwrap()];

        let completed = outcomes
            .iter()
            .filter(|o| matches!(o, AdvanceOutcome::Completed { .. }))
            .count();
        let superseded = outcomes
            .iter()
            .filter(|o| **o == AdvanceOutcome::Skipped(SkipReason::Superseded))
            .count();
        assert_eq!((completed, superseded), (1, 1), "{outcomes:?}");

        let c = h.store.get(&id).unwrap().unwrap();
        assert_eq!(c.status, ConsultationStatus::Completed);
        assert_eq!(c.suggested_codes.len(), 1);
        assert!(c.task_reference.is_none());
        // Only the copy that won the transcript write went on to summarize.
        assert_eq!(h.summary_llm.requests().len(), 1);
    }

    #[tokio::test]
    async fn reprocess_with_closed_queue_leaves_explicit_failure() {
        let h = harness();
        let (id, task) = queued(&h).await;
        h.controller.record_failure(id, task.reference, None, "boom").unwrap();
        h.queue.close();

        for _ in 0..2 {
            let err = h.controller.reprocess(id).await.unwrap_err();
            assert!(matches!(err, PipelineError::Dispatch(DispatchError::QueueClosed)), "{err}");

            let c = h.store.get(&id).unwrap().unwrap();
            assert_eq!(c.status, ConsultationStatus::Failed);
            assert!(c.error_message.unwrap().contains("Task queue is closed"));
        }
    }

    #[tokio::test]
    async fn reprocess_recovers_queued_record_whose_task_was_never_enqueued() {
        let h = harness();
        let id = Uuid::new_v4();
        let key = format!("D1/P1/{id}.wav");
        h.audio.put(&key, b"RIFF", "audio/wav").await.unwrap();
        h.store
            .insert(&Consultation::new_upload(id, "P1", "D1", &key, "audio/wav"))
            .unwrap();
        h.store
            .update(
                &id,
                &[ConsultationStatus::Uploading],
                &ConsultationPatch::status(ConsultationStatus::Queued),
            )
            .unwrap();
        // Claimed, then the process died before the enqueue.
        let lost = TaskReference::new();
        assert!(h.store.claim_task(&id, &lost).unwrap());

        let reference = h.controller.reprocess(id).await.unwrap();
        assert_ne!(reference, lost);
        assert_eq!(h.store.get(&id).unwrap().unwrap().task_reference, Some(reference));

        let delivery = h.queue.try_next().unwrap();
        assert_eq!(delivery.task, Task::first(id, reference));
        assert!(matches!(
            h.controller.run_task(&delivery.task).await.unwrap(),
            AdvanceOutcome::Completed { .. }
        ));
    }

    #[tokio::test]
    async fn reprocess_dispatches_queued_record_without_task() {
        let h = harness();
        let id = Uuid::new_v4();
        h.store
            .insert(&Consultation::new_upload(id, "P1", "D1", "D1/P1/x.wav", "audio/wav"))
            .unwrap();
        h.store
            .update(
                &id,
                &[ConsultationStatus::Uploading],
                &ConsultationPatch::status(ConsultationStatus::Queued),
            )
            .unwrap();

        let reference = h.controller.reprocess(id).await.unwrap();
        assert_eq!(h.queue.try_next().unwrap().task.reference, reference);
    }

    #[tokio::test]
    async fn reprocess_failed_record_dispatches_fresh_task() {
        let h = harness();
        let (id, task) = queued(&h).await;
        h.controller.record_failure(id, task.reference, None, "boom").unwrap();
        h.store.set_confirmed_codes(&id, &["R51".into()]).unwrap();

        let reference = h.controller.reprocess(id).await.unwrap();
        assert_ne!(reference, task.reference);

        let c = h.store.get(&id).unwrap().unwrap();
        assert_eq!(c.status, ConsultationStatus::Queued);
        assert!(c.error_message.is_none());
        assert_eq!(c.task_reference, Some(reference));
        assert_eq!(c.confirmed_codes, vec!["R51".to_string()]);

        let delivery = h.queue.try_next().unwrap();
        assert_eq!(delivery.task, Task::first(id, reference));

        // The old task's retry is now stale.
        assert_eq!(
            h.controller.run_task(&task.retry()).await.unwrap(),
            AdvanceOutcome::Skipped(SkipReason::StaleTask)
        );
    }

    #[tokio::test]
    async fn reprocess_completed_record_clears_outputs() {
        let h = harness();
        let (id, task) = queued(&h).await;
        h.controller.run_task(&task).await.unwrap();

        h.controller.reprocess(id).await.unwrap();
        let c = h.store.get(&id).unwrap().unwrap();
        assert_eq!(c.status, ConsultationStatus::Queued);
        assert!(c.transcript_text.is_none());
        assert!(c.summary.is_none());
        assert!(c.suggested_codes.is_empty());
        assert!(c.completed_at.is_none());
    }

    #[tokio::test]
    async fn reprocess_in_progress_record_is_rejected() {
        let h = harness();
        let (id, _) = queued(&h).await;
        assert!(matches!(
            h.controller.reprocess(id).await,
            Err(PipelineError::NotReprocessable {
                status: ConsultationStatus::Queued,
                ..
            })
        ));
        assert!(matches!(
            h.controller.reprocess(Uuid::new_v4()).await,
            Err(PipelineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn anonymous_directory_still_summarizes() {
        let store = Arc::new(SqliteRecordStore::in_memory().unwrap());
        let queue = Arc::new(MemoryTaskQueue::new());
        let audio = Arc::new(MemoryAudioStore::new());
        let llm = Arc::new(MockLlmClient::new(SUMMARY_JSON));
        let controller = PipelineController::new(
            store.clone(),
            audio.clone(),
            PipelineAdapters {
                transcriber: Arc::new(MockTranscriber::new("dor")),
                summarizer: Arc::new(LlmSummarizer::new(llm.clone())),
                suggester: Arc::new(LlmCodeSuggester::new(Arc::new(MockLlmClient::new(CODES_JSON)), 3)),
                patients: Arc::new(AnonymousDirectory),
            },
            Arc::new(Dispatcher::new(store.clone(), queue)),
            ControllerSettings::default(),
        );

        let id = Uuid::new_v4();
        audio.put("D1/P2/a.wav", b"x", "audio/wav").await.unwrap();
        store
            .insert(&Consultation::new_upload(id, "P2", "D1", "D1/P2/a.wav", "audio/wav"))
            .unwrap();
        store
            .update(
                &id,
                &[ConsultationStatus::Uploading],
                &ConsultationPatch::status(ConsultationStatus::Queued),
            )
            .unwrap();

        assert!(matches!(
            controller.advance(id).await.unwrap(),
            AdvanceOutcome::Completed { .. }
        ));
        assert!(!llm.requests()[0].user.contains("Paciente:"));
    }
}
