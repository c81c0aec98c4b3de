use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{validate_key, AudioStore, StorageError};

/// In-process audio store. Used by tests and local tooling.
#[derive(Default)]
pub struct MemoryAudioStore {
    objects: RwLock<HashMap<String, (Vec<u8>, String)>>,
    fail_puts: AtomicBool,
}

impl MemoryAudioStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put` fail with an I/O error.
    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.objects.read().await.contains_key(key)
    }

    pub async fn content_type(&self, key: &str) -> Option<String> {
        self.objects.read().await.get(key).map(|(_, ct)| ct.clone())
    }
}

#[async_trait]
impl AudioStore for MemoryAudioStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .read()
            .await
            .get(key)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::other("audio store unavailable")));
        }
        self.objects
            .write()
            .await
            .insert(key.to_string(), (bytes.to_vec(), content_type.to_string()));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.objects
            .write()
            .await
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failing_puts_store_nothing() {
        let store = MemoryAudioStore::new();
        store.fail_puts(true);
        assert!(store.put("D1/P1/a.wav", b"x", "audio/wav").await.is_err());
        assert!(!store.contains("D1/P1/a.wav").await);

        store.fail_puts(false);
        store.put("D1/P1/a.wav", b"x", "audio/wav").await.unwrap();
        assert_eq!(store.content_type("D1/P1/a.wav").await.as_deref(), Some("audio/wav"));
    }
}
