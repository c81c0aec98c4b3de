pub mod fs;
pub mod memory;
pub mod scratch;

pub use fs::FsAudioStore;
pub use memory::MemoryAudioStore;
pub use scratch::ScratchAudio;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Audio object not found: {0}")]
    NotFound(String),

    #[error("Invalid audio key: {0}")]
    InvalidKey(String),

    #[error("Background task failed: {0}")]
    Join(String),
}

/// Blob store holding consultation audio, addressed by relative key
/// (`{doctor_id}/{patient_id}/{uuid}.{ext}`).
#[async_trait]
pub trait AudioStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<(), StorageError>;

    async fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Reject keys that could escape the store root.
pub(crate) fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() || key.starts_with('/') || key.contains('\\') {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    if key
        .split('/')
        .any(|part| part.is_empty() || part == "." || part == "..")
    {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}
