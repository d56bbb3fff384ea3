//! Storage for cached content records.
//!
//! The store keeps the ordered parts and system instruction of every cache,
//! together with the token count computed at `put`. Media parts are never
//! copied: the store pins them in a [`BlobStore`] and releases the pin when
//! the record is deleted. Releases that fail are queued and retried by
//! [`ContentStore::reclaim_pending`], which the expiration sweep calls.

use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Mutex, RwLock};

use cachet_abstraction::{BlobStore, ContentPart, Tokenizer};
use tracing::{debug, warn};

use crate::error::{CacheError, Result};
use crate::types::{ContentRef, ModelId, StoredContent};

#[derive(Debug)]
struct Record {
    content: Arc<StoredContent>,
    blobs: Vec<String>,
}

/// Outcome of a reclamation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Blob pins released in this pass.
    pub released: usize,
    /// Releases that failed and stay queued.
    pub failed: usize,
}

/// Owns cached content records.
pub struct ContentStore {
    tokenizer: Arc<dyn Tokenizer>,
    blobs: Arc<dyn BlobStore>,
    min_cacheable_tokens: u64,
    records: RwLock<HashMap<ContentRef, Record>>,
    pending_release: Mutex<Vec<String>>,
}

impl std::fmt::Debug for ContentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentStore")
            .field("min_cacheable_tokens", &self.min_cacheable_tokens)
            .field("records", &self.len().unwrap_or_default())
            .field("pending_release", &self.pending_reclaims())
            .finish_non_exhaustive()
    }
}

impl ContentStore {
    /// Creates an empty store.
    ///
    /// # Arguments
    /// * `tokenizer` - Counts tokens for the bound model
    /// * `blobs` - Resolves and pins media parts
    /// * `min_cacheable_tokens` - Floor below which `put` fails
    #[must_use]
    pub fn new(
        tokenizer: Arc<dyn Tokenizer>,
        blobs: Arc<dyn BlobStore>,
        min_cacheable_tokens: u64,
    ) -> Self {
        Self {
            tokenizer,
            blobs,
            min_cacheable_tokens,
            records: RwLock::new(HashMap::new()),
            pending_release: Mutex::new(Vec::new()),
        }
    }

    /// Stores content and returns a handle to it.
    ///
    /// Counts tokens with `model_id`'s tokenizer and pins every media part.
    /// On any failure, pins already taken are released before returning. If
    /// the future is dropped part-way, they are queued for the next
    /// reclamation pass instead.
    ///
    /// # Errors
    /// * `InvalidArgument` - no parts and no system instruction
    /// * `ContentTooSmall` - fewer tokens than the configured floor
    /// * `Blob` / `Tokenizer` - a collaborator failed
    pub async fn put(
        &self,
        model_id: &ModelId,
        parts: Vec<ContentPart>,
        system_instruction: Option<String>,
    ) -> Result<(ContentRef, Arc<StoredContent>)> {
        let system_instruction = system_instruction.filter(|s| !s.trim().is_empty());
        if parts.is_empty() && system_instruction.is_none() {
            return Err(CacheError::InvalidArgument(
                "cached content needs at least one part or a system instruction".to_string(),
            ));
        }

        let mut retained = RetainedBlobs { store: self, uris: Vec::new() };
        let counted = self
            .count_and_retain(model_id, &parts, system_instruction.as_deref(), &mut retained)
            .await;

        let token_count = match counted {
            Ok(count) if count >= self.min_cacheable_tokens => count,
            Ok(count) => {
                retained.release_now().await;
                return Err(CacheError::ContentTooSmall {
                    token_count: count,
                    minimum: self.min_cacheable_tokens,
                });
            }
            Err(e) => {
                retained.release_now().await;
                return Err(e);
            }
        };

        let content_ref = ContentRef(uuid::Uuid::new_v4());
        let content = Arc::new(StoredContent { system_instruction, parts, token_count });
        let record = Record { content: Arc::clone(&content), blobs: retained.into_uris() };

        {
            let mut records = self.records.write().map_err(|_| CacheError::poisoned("content store"))?;
            records.insert(content_ref.clone(), record);
        }

        debug!(content_ref = %content_ref, token_count, "Stored cached content");
        Ok((content_ref, content))
    }

    async fn count_and_retain(
        &self,
        model_id: &ModelId,
        parts: &[ContentPart],
        system_instruction: Option<&str>,
        retained: &mut RetainedBlobs<'_>,
    ) -> Result<u64> {
        let model = model_id.as_str();
        let mut total = match system_instruction {
            Some(text) => self.tokenizer.count_text(model, text).await?,
            None => 0,
        };

        for part in parts {
            let tokens = match part {
                ContentPart::Text { text } => self.tokenizer.count_text(model, text).await?,
                ContentPart::FileData { uri, mime_type } => {
                    let info = self.blobs.retain(uri, mime_type).await?;
                    retained.uris.push(uri.clone());
                    self.tokenizer.count_blob(model, &info).await?
                }
            };
            total = total.saturating_add(tokens);
        }

        Ok(total)
    }

    /// Looks up stored content.
    pub fn get(&self, content_ref: &ContentRef) -> Result<Option<Arc<StoredContent>>> {
        let records = self.records.read().map_err(|_| CacheError::poisoned("content store"))?;
        Ok(records.get(content_ref).map(|record| Arc::clone(&record.content)))
    }

    /// Deletes stored content and releases its blob pins.
    ///
    /// Idempotent: deleting an unknown or already-deleted handle returns
    /// `Ok(false)`. Failed releases are queued, not reported.
    pub async fn delete(&self, content_ref: &ContentRef) -> Result<bool> {
        let removed = {
            let mut records = self.records.write().map_err(|_| CacheError::poisoned("content store"))?;
            records.remove(content_ref)
        };

        let Some(record) = removed else {
            return Ok(false);
        };

        for uri in record.blobs {
            self.release_or_queue(uri).await;
        }

        debug!(content_ref = %content_ref, "Deleted cached content");
        Ok(true)
    }

    /// Deletes stored content without awaiting; blob pins are queued.
    ///
    /// Used where the caller cannot await, such as a rollback on drop.
    pub fn discard(&self, content_ref: &ContentRef) {
        let removed = match self.records.write() {
            Ok(mut records) => records.remove(content_ref),
            Err(_) => {
                warn!(content_ref = %content_ref, "Content store lock poisoned during discard");
                return;
            }
        };

        if let Some(record) = removed {
            self.queue_release(record.blobs);
            debug!(content_ref = %content_ref, "Discarded uncommitted content");
        }
    }

    /// Retries queued blob releases.
    pub async fn reclaim_pending(&self) -> ReclaimReport {
        let queued = match self.pending_release.lock() {
            Ok(mut pending) => mem::take(&mut *pending),
            Err(_) => {
                warn!("Reclaim queue lock poisoned");
                return ReclaimReport::default();
            }
        };

        let mut report = ReclaimReport::default();
        for uri in queued {
            match self.blobs.release(&uri).await {
                Ok(()) => report.released += 1,
                Err(e) => {
                    warn!(uri = %uri, error = %e, "Blob release failed, will retry");
                    report.failed += 1;
                    self.queue_release(vec![uri]);
                }
            }
        }
        report
    }

    /// Number of blob releases waiting for the next reclamation pass.
    pub fn pending_reclaims(&self) -> usize {
        self.pending_release.lock().map(|pending| pending.len()).unwrap_or_default()
    }

    /// Number of stored records.
    pub fn len(&self) -> Result<usize> {
        let records = self.records.read().map_err(|_| CacheError::poisoned("content store"))?;
        Ok(records.len())
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    async fn release_or_queue(&self, uri: String) {
        if let Err(e) = self.blobs.release(&uri).await {
            warn!(uri = %uri, error = %e, "Blob release failed, queued for reclamation");
            self.queue_release(vec![uri]);
        }
    }

    fn queue_release(&self, uris: Vec<String>) {
        if uris.is_empty() {
            return;
        }
        match self.pending_release.lock() {
            Ok(mut pending) => pending.extend(uris),
            Err(_) => warn!(count = uris.len(), "Reclaim queue lock poisoned, dropping releases"),
        }
    }
}

/// Blob pins taken during a `put` that has not finished yet.
struct RetainedBlobs<'a> {
    store: &'a ContentStore,
    uris: Vec<String>,
}

impl RetainedBlobs<'_> {
    async fn release_now(mut self) {
        // A uri stays in the guard until its release finishes, so a drop
        // mid-loop queues everything not yet released.
        while let Some(uri) = self.uris.last().cloned() {
            self.store.release_or_queue(uri).await;
            self.uris.pop();
        }
    }

    fn into_uris(mut self) -> Vec<String> {
        mem::take(&mut self.uris)
    }
}

impl Drop for RetainedBlobs<'_> {
    fn drop(&mut self) {
        self.store.queue_release(mem::take(&mut self.uris));
    }
}

/// Content stored for a cache that has not been committed to the registry.
///
/// Dropping the guard without calling [`PendingContent::commit`] discards the
/// content, so a failed or cancelled creation leaves nothing behind.
pub(crate) struct PendingContent<'a> {
    store: &'a ContentStore,
    content_ref: Option<ContentRef>,
}

impl<'a> PendingContent<'a> {
    pub(crate) fn new(store: &'a ContentStore, content_ref: ContentRef) -> Self {
        Self { store, content_ref: Some(content_ref) }
    }

    pub(crate) fn commit(mut self) {
        self.content_ref = None;
    }
}

impl Drop for PendingContent<'_> {
    fn drop(&mut self) {
        if let Some(content_ref) = self.content_ref.take() {
            self.store.discard(&content_ref);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::InMemoryBlobStore;
    use crate::tokenizer::EstimatingTokenizer;

    fn model() -> ModelId {
        ModelId::parse("gemini-1.5-pro-001").unwrap()
    }

    fn store_with(blobs: Arc<InMemoryBlobStore>, floor: u64) -> ContentStore {
        ContentStore::new(Arc::new(EstimatingTokenizer::default()), blobs, floor)
    }

    #[tokio::test]
    async fn test_put_counts_tokens_and_get_returns_content() {
        let store = store_with(Arc::new(InMemoryBlobStore::new()), 2);
        let parts = vec![ContentPart::text("aaaa bbbb"), ContentPart::text("cccc")];

        let (content_ref, content) =
            store.put(&model(), parts.clone(), Some("S".to_string())).await.unwrap();

        assert_eq!(content.parts, parts);
        assert_eq!(content.system_instruction.as_deref(), Some("S"));
        assert_eq!(content.token_count, 5);
        assert_eq!(store.get(&content_ref).unwrap().unwrap(), content);
    }

    #[tokio::test]
    async fn test_put_below_floor_releases_blobs() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        blobs.insert("gs://b/small.pdf", "application/pdf", 16);
        let store = store_with(Arc::clone(&blobs), 1_000);

        let err = store
            .put(&model(), vec![ContentPart::file_data("gs://b/small.pdf", "application/pdf")], None)
            .await
            .unwrap_err();

        assert!(matches!(err, CacheError::ContentTooSmall { minimum: 1_000, .. }));
        assert_eq!(blobs.pin_count("gs://b/small.pdf"), Some(0));
        assert!(store.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_put_missing_blob_releases_earlier_pins() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        blobs.insert("gs://b/a.pdf", "application/pdf", 1 << 20);
        let store = store_with(Arc::clone(&blobs), 1);

        let err = store
            .put(
                &model(),
                vec![
                    ContentPart::file_data("gs://b/a.pdf", "application/pdf"),
                    ContentPart::file_data("gs://b/missing.pdf", "application/pdf"),
                ],
                None,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, CacheError::Blob(_)));
        assert_eq!(blobs.pin_count("gs://b/a.pdf"), Some(0));
    }

    #[tokio::test]
    async fn test_put_rejects_empty_content() {
        let store = store_with(Arc::new(InMemoryBlobStore::new()), 1);
        let err = store.put(&model(), vec![], Some("  ".to_string())).await.unwrap_err();
        assert!(matches!(err, CacheError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent_and_releases() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        blobs.insert("gs://b/a.pdf", "application/pdf", 1 << 20);
        let store = store_with(Arc::clone(&blobs), 1);

        let (content_ref, _) = store
            .put(&model(), vec![ContentPart::file_data("gs://b/a.pdf", "application/pdf")], None)
            .await
            .unwrap();
        assert_eq!(blobs.pin_count("gs://b/a.pdf"), Some(1));

        assert!(store.delete(&content_ref).await.unwrap());
        assert!(!store.delete(&content_ref).await.unwrap());
        assert_eq!(blobs.pin_count("gs://b/a.pdf"), Some(0));
        assert!(store.get(&content_ref).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_release_is_retried_by_reclaim() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        blobs.insert("gs://b/a.pdf", "application/pdf", 1 << 20);
        let store = store_with(Arc::clone(&blobs), 1);

        let (content_ref, _) = store
            .put(&model(), vec![ContentPart::file_data("gs://b/a.pdf", "application/pdf")], None)
            .await
            .unwrap();

        blobs.fail_next_releases(2);
        assert!(store.delete(&content_ref).await.unwrap());
        assert_eq!(store.pending_reclaims(), 1);

        let report = store.reclaim_pending().await;
        assert_eq!(report, ReclaimReport { released: 0, failed: 1 });
        assert_eq!(store.pending_reclaims(), 1);

        let report = store.reclaim_pending().await;
        assert_eq!(report, ReclaimReport { released: 1, failed: 0 });
        assert_eq!(store.pending_reclaims(), 0);
        assert_eq!(blobs.pin_count("gs://b/a.pdf"), Some(0));
    }

    #[tokio::test]
    async fn test_pending_content_discards_on_drop() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        blobs.insert("gs://b/a.pdf", "application/pdf", 1 << 20);
        let store = store_with(Arc::clone(&blobs), 1);

        let (content_ref, _) = store
            .put(&model(), vec![ContentPart::file_data("gs://b/a.pdf", "application/pdf")], None)
            .await
            .unwrap();

        drop(PendingContent::new(&store, content_ref.clone()));
        assert!(store.get(&content_ref).unwrap().is_none());
        assert_eq!(store.pending_reclaims(), 1);

        store.reclaim_pending().await;
        assert_eq!(blobs.pin_count("gs://b/a.pdf"), Some(0));

        let (kept, _) = store.put(&model(), vec![ContentPart::text("keep me")], None).await.unwrap();
        PendingContent::new(&store, kept.clone()).commit();
        assert!(store.get(&kept).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_put_dropped_during_release_queues_unreleased_pins() {
        use std::future::Future;
        use std::pin::pin;
        use std::task::{Context, Poll};

        let blobs = Arc::new(StallingReleaseStore::default());
        let store = ContentStore::new(Arc::new(EstimatingTokenizer::default()), blobs.clone(), u64::MAX);

        {
            let model = model();
            let mut put = pin!(store.put(
                &model,
                vec![
                    ContentPart::file_data("gs://b/a.pdf", "application/pdf"),
                    ContentPart::file_data("gs://b/stall.pdf", "application/pdf"),
                ],
                None,
            ));
            let mut cx = Context::from_waker(std::task::Waker::noop());
            assert!(matches!(put.as_mut().poll(&mut cx), Poll::Pending));
        }

        assert_eq!(blobs.released(), 0);
        assert_eq!(store.pending_reclaims(), 2);
        assert!(store.is_empty().unwrap());
    }

    /// Pins anything; never finishes releasing `gs://b/stall.pdf`.
    #[derive(Debug, Default)]
    struct StallingReleaseStore {
        released: std::sync::atomic::AtomicUsize,
    }

    impl StallingReleaseStore {
        fn released(&self) -> usize {
            self.released.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl BlobStore for StallingReleaseStore {
        async fn retain(
            &self,
            uri: &str,
            mime_type: &str,
        ) -> std::result::Result<cachet_abstraction::BlobInfo, cachet_abstraction::BlobError> {
            Ok(cachet_abstraction::BlobInfo {
                uri: uri.to_string(),
                mime_type: mime_type.to_string(),
                size_bytes: 1 << 20,
            })
        }

        async fn release(&self, uri: &str) -> std::result::Result<(), cachet_abstraction::BlobError> {
            if uri == "gs://b/stall.pdf" {
                std::future::pending::<()>().await;
            }
            self.released.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }
}
