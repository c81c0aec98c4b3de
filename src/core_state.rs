//! Shared application state.
//!
//! `CoreState` owns every long-lived service: the record store, the audio
//! store, the dispatcher, the pipeline controller and the ingestion gate.
//! Whatever front end sits on top (worker binary, HTTP layer, tests) holds
//! one `Arc<CoreState>` and calls into it.

use std::sync::Arc;

use uuid::Uuid;

use crate::config::Settings;
use crate::db::{DatabaseError, RecordStore, SqliteRecordStore};
use crate::intake::{AudioUpload, IngestionGate, IntakeError, IntakePolicy, IntakeReceipt};
use crate::models::{Consultation, TaskReference};
use crate::pipeline::coding::LlmCodeSuggester;
use crate::pipeline::dispatch::{BackoffPolicy, Dispatcher, SqliteTaskQueue, TaskQueue, WorkerPool};
use crate::pipeline::llm::{LlmClient, LlmError, OpenAiChatClient};
use crate::pipeline::patients::{AnonymousDirectory, DirectoryError, PatientDirectory, StaticDirectory};
use crate::pipeline::summarization::LlmSummarizer;
use crate::pipeline::transcription::{TranscriptionError, WhisperClient};
use crate::pipeline::{ControllerSettings, PipelineAdapters, PipelineController, PipelineError};
use crate::review::{self, ReviewError};
use crate::storage::{AudioStore, FsAudioStore};

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM client error: {0}")]
    Llm(#[from] LlmError),

    #[error("Transcription client error: {0}")]
    Transcription(#[from] TranscriptionError),

    #[error("Patient directory error: {0}")]
    Patients(#[from] DirectoryError),

    #[error("Cannot create {path}: {source}")]
    DataDir {
        path: String,
        source: std::io::Error,
    },
}

pub struct CoreState {
    store: Arc<dyn RecordStore>,
    controller: Arc<PipelineController>,
    gate: IngestionGate,
    retry: BackoffPolicy,
    worker_count: usize,
}

impl CoreState {
    /// Assemble state from already-built services.
    pub fn new(
        store: Arc<dyn RecordStore>,
        audio: Arc<dyn AudioStore>,
        queue: Arc<dyn TaskQueue>,
        adapters: PipelineAdapters,
        settings: &Settings,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(store.clone(), queue));
        let controller = Arc::new(PipelineController::new(
            store.clone(),
            audio.clone(),
            adapters,
            dispatcher.clone(),
            ControllerSettings::from(settings),
        ));
        let gate = IngestionGate::new(
            store.clone(),
            audio,
            dispatcher,
            IntakePolicy::from(settings),
        );
        Self {
            store,
            controller,
            gate,
            retry: settings.retry,
            worker_count: settings.worker_count,
        }
    }

    /// Production wiring: SQLite for records and queue, the filesystem for
    /// audio, OpenAI-compatible endpoints for every model call.
    pub fn from_settings(settings: &Settings) -> Result<Self, CoreError> {
        for dir in [&settings.data_dir, &settings.audio_root] {
            std::fs::create_dir_all(dir).map_err(|source| CoreError::DataDir {
                path: dir.display().to_string(),
                source,
            })?;
        }

        let store = Arc::new(SqliteRecordStore::open(&settings.database_path)?);
        let queue = Arc::new(SqliteTaskQueue::open(
            &settings.database_path,
            settings.queue_poll_interval,
            settings.queue_lease,
        )?);
        let audio = Arc::new(FsAudioStore::new(settings.audio_root.clone()));

        let timeout_secs = settings.stage_timeout.as_secs().max(1);
        let openai = &settings.openai;
        if openai.api_key.is_none() {
            tracing::warn!("No OpenAI API key configured, model calls will be rejected");
        }
        let chat: Arc<dyn LlmClient> = Arc::new(OpenAiChatClient::new(
            &openai.base_url,
            openai.api_key.clone(),
            &openai.chat_model,
            timeout_secs,
        )?);
        let transcriber = WhisperClient::new(
            &openai.base_url,
            openai.api_key.clone(),
            &openai.whisper_model,
            timeout_secs,
        )?;

        let adapters = PipelineAdapters {
            transcriber: Arc::new(transcriber),
            summarizer: Arc::new(LlmSummarizer::new(chat.clone())),
            suggester: Arc::new(LlmCodeSuggester::new(chat, settings.suggestion_top_n)),
            patients: patient_directory(settings)?,
        };

        tracing::info!(
            database = %settings.database_path.display(),
            audio_root = %settings.audio_root.display(),
            chat_model = %openai.chat_model,
            whisper_model = %openai.whisper_model,
            "Services initialized"
        );
        Ok(Self::new(store, audio, queue, adapters, settings))
    }

    pub fn controller(&self) -> &Arc<PipelineController> {
        &self.controller
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn start_workers(&self) -> WorkerPool {
        WorkerPool::start(self.controller.clone(), self.retry, self.worker_count)
    }

    pub async fn submit(&self, upload: AudioUpload) -> Result<IntakeReceipt, IntakeError> {
        self.gate.submit(upload).await
    }

    pub async fn discard(&self, consultation_id: Uuid) -> Result<(), IntakeError> {
        self.gate.discard(consultation_id).await
    }

    pub fn consultation(&self, consultation_id: Uuid) -> Result<Option<Consultation>, DatabaseError> {
        self.store.get(&consultation_id)
    }

    pub async fn reprocess(&self, consultation_id: Uuid) -> Result<TaskReference, PipelineError> {
        self.controller.reprocess(consultation_id).await
    }

    pub fn confirm_codes(
        &self,
        consultation_id: Uuid,
        codes: &[String],
    ) -> Result<Vec<String>, ReviewError> {
        review::confirm_codes(self.store.as_ref(), consultation_id, codes)
    }
}

fn patient_directory(settings: &Settings) -> Result<Arc<dyn PatientDirectory>, CoreError> {
    let Some(path) = &settings.patients_file else {
        tracing::info!("No patient file configured, summaries will be anonymous");
        return Ok(Arc::new(AnonymousDirectory));
    };
    let directory = StaticDirectory::from_json_file(path)?;
    if directory.is_empty() {
        tracing::warn!(path = %path.display(), "Patient file has no entries");
    } else {
        tracing::info!(path = %path.display(), patients = directory.len(), "Patient directory loaded");
    }
    Ok(Arc::new(directory))
}
