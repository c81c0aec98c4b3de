pub mod coding;
pub mod controller;
pub mod dispatch;
pub mod llm;
pub mod patients;
pub mod summarization;
pub mod transcription;

pub use controller::{
    AdvanceOutcome, ControllerSettings, PipelineAdapters, PipelineController, PipelineError,
    SkipReason, StageError, StageFailure,
};
