//! In-memory blob store.
//!
//! Holds blob metadata and pin counts only; bytes live wherever the URI
//! points. Used by the CLI walkthrough and by tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use cachet_abstraction::{BlobError, BlobInfo, BlobStore};
use tracing::debug;

#[derive(Debug)]
struct BlobRecord {
    info: BlobInfo,
    pins: u64,
}

#[derive(Debug, Default)]
struct Inner {
    blobs: HashMap<String, BlobRecord>,
    failing_releases: u32,
}

/// A [`BlobStore`] backed by a map of known blobs.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    inner: Mutex<Inner>,
}

impl InMemoryBlobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a blob so it can be retained.
    pub fn insert(&self, uri: impl Into<String>, mime_type: impl Into<String>, size_bytes: u64) {
        let uri = uri.into();
        let info = BlobInfo { uri: uri.clone(), mime_type: mime_type.into(), size_bytes };
        if let Ok(mut inner) = self.inner.lock() {
            inner.blobs.insert(uri, BlobRecord { info, pins: 0 });
        }
    }

    /// Current pin count for `uri`, or `None` if the blob is unknown.
    pub fn pin_count(&self, uri: &str) -> Option<u64> {
        self.inner.lock().ok()?.blobs.get(uri).map(|record| record.pins)
    }

    /// Makes the next `count` releases fail with `Unavailable`.
    pub fn fail_next_releases(&self, count: u32) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.failing_releases = count;
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, BlobError> {
        self.inner.lock().map_err(|_| BlobError::Unavailable("blob store lock poisoned".to_string()))
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn retain(&self, uri: &str, mime_type: &str) -> Result<BlobInfo, BlobError> {
        let mut inner = self.lock()?;
        let record = inner.blobs.get_mut(uri).ok_or_else(|| BlobError::NotFound(uri.to_string()))?;

        if record.info.mime_type != mime_type {
            return Err(BlobError::MimeMismatch {
                uri: uri.to_string(),
                expected: mime_type.to_string(),
                actual: record.info.mime_type.clone(),
            });
        }

        record.pins += 1;
        debug!(uri = %uri, pins = record.pins, "Retained blob");
        Ok(record.info.clone())
    }

    async fn release(&self, uri: &str) -> Result<(), BlobError> {
        let mut inner = self.lock()?;
        if inner.failing_releases > 0 {
            inner.failing_releases -= 1;
            return Err(BlobError::Unavailable(format!("release of {uri} failed")));
        }

        if let Some(record) = inner.blobs.get_mut(uri) {
            record.pins = record.pins.saturating_sub(1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_retain_and_release() {
        let store = InMemoryBlobStore::new();
        store.insert("gs://b/a.pdf", "application/pdf", 1024);

        let info = store.retain("gs://b/a.pdf", "application/pdf").await.unwrap();
        assert_eq!(info.size_bytes, 1024);
        store.retain("gs://b/a.pdf", "application/pdf").await.unwrap();
        assert_eq!(store.pin_count("gs://b/a.pdf"), Some(2));

        store.release("gs://b/a.pdf").await.unwrap();
        assert_eq!(store.pin_count("gs://b/a.pdf"), Some(1));
        store.release("gs://b/unknown.pdf").await.unwrap();
    }

    #[tokio::test]
    async fn test_retain_errors() {
        let store = InMemoryBlobStore::new();
        store.insert("gs://b/a.pdf", "application/pdf", 1024);

        assert!(matches!(
            store.retain("gs://b/missing.pdf", "application/pdf").await,
            Err(BlobError::NotFound(_))
        ));
        assert!(matches!(
            store.retain("gs://b/a.pdf", "video/mp4").await,
            Err(BlobError::MimeMismatch { .. })
        ));
        assert_eq!(store.pin_count("gs://b/a.pdf"), Some(0));
    }

    #[tokio::test]
    async fn test_injected_release_failures() {
        let store = InMemoryBlobStore::new();
        store.insert("gs://b/a.pdf", "application/pdf", 1024);
        store.retain("gs://b/a.pdf", "application/pdf").await.unwrap();

        store.fail_next_releases(1);
        assert!(store.release("gs://b/a.pdf").await.is_err());
        assert!(store.release("gs://b/a.pdf").await.is_ok());
        assert_eq!(store.pin_count("gs://b/a.pdf"), Some(0));
    }
}
