//! Reviewer-confirmed diagnostic codes.
//!
//! The pipeline only ever writes `suggested_codes`. What a clinician signs
//! off on lives in `confirmed_codes`, survives reprocessing, and is written
//! only through this module.

use uuid::Uuid;

use crate::db::{DatabaseError, RecordStore};
use crate::pipeline::coding::{is_valid_code, normalize_code};

#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    #[error("Invalid ICD-10 code: {0:?}")]
    InvalidCode(String),

    #[error("Consultation not found: {0}")]
    NotFound(Uuid),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Replace the confirmed codes of a consultation.
///
/// Codes are trimmed and uppercased, duplicates are dropped keeping the
/// first occurrence, and any code that is not ICD-10 shaped rejects the
/// whole call. An empty list clears the confirmation.
pub fn confirm_codes(
    store: &dyn RecordStore,
    consultation_id: Uuid,
    codes: &[String],
) -> Result<Vec<String>, ReviewError> {
    let mut confirmed: Vec<String> = Vec::with_capacity(codes.len());
    for raw in codes {
        let code = normalize_code(raw);
        if !is_valid_code(&code) {
            return Err(ReviewError::InvalidCode(raw.clone()));
        }
        if !confirmed.contains(&code) {
            confirmed.push(code);
        }
    }

    match store.set_confirmed_codes(&consultation_id, &confirmed) {
        Ok(()) => {}
        Err(DatabaseError::NotFound { .. }) => return Err(ReviewError::NotFound(consultation_id)),
        Err(e) => return Err(e.into()),
    }

    tracing::info!(
        consultation_id = %consultation_id,
        count = confirmed.len(),
        "Confirmed codes updated"
    );
    Ok(confirmed)
}
