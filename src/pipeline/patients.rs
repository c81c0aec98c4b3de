use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;

use crate::models::PatientContext;

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("Cannot read patient file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid patient file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Source of patient details handed to the summarizer. Patient records live
/// outside this crate.
#[async_trait]
pub trait PatientDirectory: Send + Sync {
    /// `None` when the patient is unknown; the pipeline then proceeds anonymously.
    async fn lookup(&self, patient_id: &str) -> Option<PatientContext>;
}

/// Knows no one. Every consultation is summarized without patient details.
pub struct AnonymousDirectory;

#[async_trait]
impl PatientDirectory for AnonymousDirectory {
    async fn lookup(&self, _patient_id: &str) -> Option<PatientContext> {
        None
    }
}

/// Fixed set of patients, keyed by id.
#[derive(Default)]
pub struct StaticDirectory {
    patients: HashMap<String, PatientContext>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_patient(mut self, patient_id: &str, name: &str, age_years: Option<u32>) -> Self {
        self.patients.insert(
            patient_id.to_string(),
            PatientContext {
                patient_id: patient_id.to_string(),
                name: Some(name.to_string()),
                age_years,
            },
        );
        self
    }

    /// Parse a JSON array of `{"patient_id", "name", "age_years"}` objects.
    /// A repeated id keeps the last entry.
    pub fn from_json(json: &str) -> Result<Self, DirectoryError> {
        let entries: Vec<PatientContext> = serde_json::from_str(json)?;
        let patients = entries
            .into_iter()
            .map(|p| (p.patient_id.clone(), p))
            .collect();
        Ok(Self { patients })
    }

    pub fn from_json_file(path: &Path) -> Result<Self, DirectoryError> {
        let json = std::fs::read_to_string(path).map_err(|source| DirectoryError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn len(&self) -> usize {
        self.patients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patients.is_empty()
    }
}

#[async_trait]
impl PatientDirectory for StaticDirectory {
    async fn lookup(&self, patient_id: &str) -> Option<PatientContext> {
        self.patients.get(patient_id).cloned()
    }
}

/// Context for `patient_id`, falling back to an anonymous one.
pub async fn patient_context(directory: &dyn PatientDirectory, patient_id: &str) -> PatientContext {
    directory
        .lookup(patient_id)
        .await
        .unwrap_or_else(|| PatientContext::anonymous(patient_id))
}
