use crate::db::DatabaseError;
use serde::{Deserialize, Serialize};

/// Macro to generate enum with as_str + std::str::FromStr pattern
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(DatabaseError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

str_enum!(ConsultationStatus {
    Uploading => "uploading",
    Queued => "queued",
    Transcribing => "transcribing",
    Summarizing => "summarizing",
    Completed => "completed",
    Failed => "failed",
});

str_enum!(Stage {
    Transcription => "transcription",
    Summarization => "summarization",
    CodeSuggestion => "code_suggestion",
});

impl ConsultationStatus {
    /// States the pipeline controller is allowed to pick up.
    pub const IN_PROGRESS: [ConsultationStatus; 3] =
        [Self::Queued, Self::Transcribing, Self::Summarizing];

    /// States from which an explicit reprocess request is accepted.
    pub const REPROCESSABLE: [ConsultationStatus; 2] = [Self::Failed, Self::Completed];

    pub fn is_in_progress(&self) -> bool {
        Self::IN_PROGRESS.contains(self)
    }

    /// Edges of the consultation state graph.
    ///
    /// `Failed -> Queued` and `Completed -> Queued` exist only for reprocessing.
    pub fn can_transition_to(&self, next: ConsultationStatus) -> bool {
        use ConsultationStatus::*;
        matches!(
            (self, next),
            (Uploading, Queued)
                | (Queued, Transcribing)
                | (Transcribing, Summarizing)
                | (Summarizing, Completed)
                | (Queued, Failed)
                | (Transcribing, Failed)
                | (Summarizing, Failed)
                | (Failed, Queued)
                | (Completed, Queued)
        )
    }
}

impl Stage {
    /// Status a consultation holds while this stage runs. Code suggestion
    /// runs inside `summarizing`.
    pub fn running_status(&self) -> ConsultationStatus {
        match self {
            Stage::Transcription => ConsultationStatus::Transcribing,
            Stage::Summarization | Stage::CodeSuggestion => ConsultationStatus::Summarizing,
        }
    }
}
