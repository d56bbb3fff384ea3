//! The context cache service facade.
//!
//! Wires the content store, expiration manager, registry, binder, and a
//! generation engine together, and exposes the public cache API. Caches can
//! be addressed by id or by full resource name.

use std::sync::Arc;
use std::time::Duration;

use cachet_abstraction::{
    BlobStore, ContentPart, GenerationEngine, GenerationParameters, Tokenizer, Turn,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::binding::PrefixBindingService;
use crate::config::{CacheServiceConfig, ConfigError};
use crate::content_store::ContentStore;
use crate::error::{CacheError, Result};
use crate::expiration::ExpirationManager;
use crate::registry::CacheRegistry;
use crate::sweeper::ExpirationSweeper;
use crate::types::{
    CacheId, CachedContentInfo, CreateCacheRequest, DeleteOutcome, ExpirationPolicy,
};

/// Token accounting for one generation call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMetadata {
    /// Prompt tokens, cached content included.
    pub prompt_token_count: u64,
    /// Prompt tokens served from the cache.
    pub cached_content_token_count: u64,
    /// Tokens generated.
    pub candidates_token_count: u64,
    /// Prompt plus generated tokens.
    pub total_token_count: u64,
}

/// Result of a generation call against a cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationResponse {
    /// Generated text.
    pub text: String,
    /// Token usage.
    pub usage_metadata: UsageMetadata,
}

/// Context cache service.
pub struct CacheService {
    config: CacheServiceConfig,
    resource_prefix: String,
    registry: Arc<CacheRegistry>,
    binder: PrefixBindingService,
    engine: Arc<dyn GenerationEngine>,
    parameters: Option<GenerationParameters>,
}

impl std::fmt::Debug for CacheService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheService")
            .field("resource_prefix", &self.resource_prefix)
            .field("engine", &self.engine.engine_id())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl CacheService {
    /// Builds a service from validated configuration and its collaborators.
    ///
    /// # Errors
    /// Returns `ConfigError` if `config` does not validate.
    pub fn new(
        config: CacheServiceConfig,
        tokenizer: Arc<dyn Tokenizer>,
        blobs: Arc<dyn BlobStore>,
        engine: Arc<dyn GenerationEngine>,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;

        let store = ContentStore::new(tokenizer, blobs, config.min_cacheable_tokens);
        let expiration = ExpirationManager::new(config.max_ttl(), config.expired_retention());
        let registry = Arc::new(CacheRegistry::new(store, expiration, config.default_ttl()));

        Ok(Self {
            resource_prefix: config.resource_prefix(),
            binder: PrefixBindingService::new(Arc::clone(&registry)),
            registry,
            engine,
            parameters: None,
            config,
        })
    }

    /// Sets the generation parameters sent with every request.
    #[must_use]
    pub fn with_parameters(mut self, parameters: GenerationParameters) -> Self {
        self.parameters = Some(parameters);
        self
    }

    /// Creates a cache.
    pub async fn create_cache(&self, request: CreateCacheRequest) -> Result<CachedContentInfo> {
        let entry = self.registry.create(request, Utc::now()).await?;
        Ok(self.info(&entry))
    }

    /// Returns a cache's metadata; expired caches are reported, not hidden.
    pub fn get_cache(&self, name: &str) -> Result<CachedContentInfo> {
        let id = self.resolve(name)?;
        let entry = self.registry.get(&id, Utc::now())?;
        debug!(cache_id = %id, state = %entry.state, "Fetched cache");
        Ok(self.info(&entry))
    }

    /// Lists ACTIVE and EXPIRED caches, oldest first.
    pub fn list_caches(&self) -> Result<Vec<CachedContentInfo>> {
        let entries = self.registry.list(Utc::now())?;
        Ok(entries.iter().map(|entry| self.info(entry)).collect())
    }

    /// Replaces a cache's expiration with a new TTL or expire time.
    ///
    /// # Errors
    /// * `AmbiguousExpiration` - both were given
    /// * `InvalidArgument` - neither was given, or the deadline is invalid
    /// * `NotFound` / `InvalidState` - see [`CacheRegistry::update_ttl`]
    pub fn update_cache(
        &self,
        name: &str,
        ttl: Option<Duration>,
        expire_time: Option<DateTime<Utc>>,
    ) -> Result<CachedContentInfo> {
        let policy = ExpirationPolicy::from_options(ttl, expire_time)?.ok_or_else(|| {
            CacheError::InvalidArgument("nothing to update: set ttl or expire_time".to_string())
        })?;
        let id = self.resolve(name)?;
        let entry = self.registry.update_ttl(&id, policy, Utc::now())?;
        Ok(self.info(&entry))
    }

    /// Deletes a cache; repeating the call is a no-op.
    pub async fn delete_cache(&self, name: &str) -> Result<DeleteOutcome> {
        let id = self.resolve(name)?;
        self.registry.delete(&id).await
    }

    /// Generates a response with the cache as a fixed prefix.
    ///
    /// # Errors
    /// * `NotFound` - unknown or deleted cache
    /// * `ModelMismatch` - `model_id` differs from the cache's model
    /// * `Expired` - the cache has expired; the request is not sent uncached
    /// * `Generation` - the engine failed
    pub async fn generate_with_cache(
        &self,
        name: &str,
        model_id: &str,
        input: Vec<ContentPart>,
    ) -> Result<GenerationResponse> {
        self.generate_with_history(name, model_id, &[], input).await
    }

    /// Like [`CacheService::generate_with_cache`], with prior turns placed
    /// between the cached prefix and the new input.
    pub async fn generate_with_history(
        &self,
        name: &str,
        model_id: &str,
        history: &[Turn],
        input: Vec<ContentPart>,
    ) -> Result<GenerationResponse> {
        if input.is_empty() {
            return Err(CacheError::InvalidArgument("generation input is empty".to_string()));
        }

        let id = self.resolve(name)?;
        let bound = self.binder.bind(&id, model_id, Utc::now())?;
        let cached_tokens = bound.token_count();
        let request = self
            .binder
            .compose_with_history(&bound, history.to_vec(), input)
            .into_generation_request(self.parameters.clone());

        let output = match self.engine.generate(request).await {
            Ok(output) => output,
            Err(e) => {
                warn!(cache_id = %id, engine = %self.engine.engine_id(), error = %e, "Generation failed");
                return Err(e.into());
            }
        };

        let usage = output.usage.unwrap_or_default();
        let prompt_token_count = usage.prompt_tokens.max(cached_tokens);
        let usage_metadata = UsageMetadata {
            prompt_token_count,
            cached_content_token_count: cached_tokens,
            candidates_token_count: usage.completion_tokens,
            total_token_count: prompt_token_count + usage.completion_tokens,
        };

        info!(
            cache_id = %id,
            model_id = model_id,
            prompt_tokens = usage_metadata.prompt_token_count,
            cached_tokens,
            "Generated with cache"
        );
        Ok(GenerationResponse { text: output.text, usage_metadata })
    }

    /// Spawns the background expiration sweeper at the configured interval.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start_sweeper(&self) -> ExpirationSweeper {
        ExpirationSweeper::start(Arc::clone(&self.registry), self.config.sweep_interval())
    }

    /// Parses a cache id or a resource name issued by this service.
    ///
    /// # Errors
    /// Returns `NotFound` for malformed ids and resource names from another
    /// project or location.
    pub fn resolve(&self, name: &str) -> Result<CacheId> {
        let raw = if name.contains('/') {
            name.strip_prefix(self.resource_prefix.as_str())
                .ok_or_else(|| CacheError::NotFound(name.to_string()))?
        } else {
            name
        };
        CacheId::parse(raw)
    }

    /// Full resource name for `id`.
    #[must_use]
    pub fn resource_name(&self, id: &CacheId) -> String {
        format!("{}{id}", self.resource_prefix)
    }

    /// The service configuration.
    #[must_use]
    pub fn config(&self) -> &CacheServiceConfig {
        &self.config
    }

    /// The registry behind this service.
    #[must_use]
    pub fn registry(&self) -> &Arc<CacheRegistry> {
        &self.registry
    }

    fn info(&self, entry: &crate::types::CacheEntry) -> CachedContentInfo {
        CachedContentInfo::from_entry(entry, &self.resource_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::InMemoryBlobStore;
    use crate::engine::MockEngine;
    use crate::tokenizer::EstimatingTokenizer;
    use crate::types::CacheState;

    const MODEL: &str = "gemini-1.5-pro-001";

    fn service() -> CacheService {
        let config = CacheServiceConfig {
            project: "demo".to_string(),
            min_cacheable_tokens: 4,
            ..Default::default()
        };
        CacheService::new(
            config,
            Arc::new(EstimatingTokenizer),
            Arc::new(InMemoryBlobStore::new()),
            Arc::new(MockEngine::default()),
        )
        .unwrap()
    }

    fn request() -> CreateCacheRequest {
        CreateCacheRequest::new(MODEL)
            .with_system_instruction("S")
            .with_part(ContentPart::text("P1 text"))
            .with_part(ContentPart::text("P2 text"))
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = CacheServiceConfig { sweep_interval_secs: 0, ..Default::default() };
        let result = CacheService::new(
            config,
            Arc::new(EstimatingTokenizer),
            Arc::new(InMemoryBlobStore::new()),
            Arc::new(MockEngine::default()),
        );
        assert!(matches!(result, Err(ConfigError::InvalidSweepInterval)));
    }

    #[tokio::test]
    async fn test_resource_name_and_id_both_resolve() {
        let service = service();
        let info = service.create_cache(request()).await.unwrap();

        assert_eq!(
            info.resource_name,
            format!("projects/demo/locations/us-central1/cachedContents/{}", info.id)
        );
        assert_eq!(service.get_cache(&info.id).unwrap().id, info.id);
        assert_eq!(service.get_cache(&info.resource_name).unwrap().id, info.id);

        let foreign = format!("projects/other/locations/us-central1/cachedContents/{}", info.id);
        assert!(matches!(service.get_cache(&foreign), Err(CacheError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_update_cache_requires_exactly_one_option() {
        let service = service();
        let info = service.create_cache(request()).await.unwrap();

        assert!(matches!(
            service.update_cache(&info.id, None, None),
            Err(CacheError::InvalidArgument(_))
        ));
        assert_eq!(
            service.update_cache(&info.id, Some(Duration::from_secs(60)), Some(Utc::now())),
            Err(CacheError::AmbiguousExpiration)
        );

        let updated = service.update_cache(&info.id, Some(Duration::from_secs(7200)), None).unwrap();
        assert!(updated.expire_time > info.expire_time);
        assert_eq!(updated.state, CacheState::Active);
    }

    #[tokio::test]
    async fn test_generate_reports_cached_usage() {
        let service = service();
        let info = service.create_cache(request()).await.unwrap();

        let response = service
            .generate_with_cache(&info.resource_name, MODEL, vec![ContentPart::text("Q")])
            .await
            .unwrap();

        let usage = response.usage_metadata;
        assert_eq!(usage.cached_content_token_count, info.token_count);
        assert!(usage.prompt_token_count > usage.cached_content_token_count);
        assert_eq!(usage.total_token_count, usage.prompt_token_count + usage.candidates_token_count);
        assert!(response.text.ends_with(": Q"));
    }

    #[tokio::test]
    async fn test_generate_surfaces_engine_failure() {
        let engine = Arc::new(MockEngine::default());
        let service = CacheService::new(
            CacheServiceConfig { min_cacheable_tokens: 1, ..Default::default() },
            Arc::new(EstimatingTokenizer),
            Arc::new(InMemoryBlobStore::new()),
            engine.clone(),
        )
        .unwrap();
        let info = service.create_cache(request()).await.unwrap();

        engine.fail_next(1);
        let err = service
            .generate_with_cache(&info.id, MODEL, vec![ContentPart::text("Q")])
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Generation(_)));
    }

    #[tokio::test]
    async fn test_generate_rejects_empty_input() {
        let service = service();
        let info = service.create_cache(request()).await.unwrap();
        assert!(matches!(
            service.generate_with_cache(&info.id, MODEL, vec![]).await,
            Err(CacheError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_generate_accepts_model_id_spelled_as_at_create() {
        let service = service();
        let mut request = request();
        request.model_id = " gemini-1.5-pro-001".to_string();
        let info = service.create_cache(request).await.unwrap();

        let response = service
            .generate_with_cache(&info.id, " gemini-1.5-pro-001", vec![ContentPart::text("Q")])
            .await
            .unwrap();
        assert_eq!(response.usage_metadata.cached_content_token_count, info.token_count);
    }

    #[tokio::test]
    async fn test_generate_on_expired_cache_fails_expired() {
        let service = service();
        let info = service
            .create_cache(request().with_ttl(Duration::from_millis(50)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(
            service.generate_with_cache(&info.id, MODEL, vec![ContentPart::text("Q")]).await,
            Err(CacheError::Expired(info.id.clone()))
        );
        assert_eq!(service.get_cache(&info.id).unwrap().state, CacheState::Expired);
    }

    #[tokio::test]
    async fn test_delete_then_generate_is_not_found() {
        let service = service();
        let info = service.create_cache(request()).await.unwrap();

        assert_eq!(service.delete_cache(&info.resource_name).await.unwrap(), DeleteOutcome::Deleted);
        assert_eq!(service.delete_cache(&info.id).await.unwrap(), DeleteOutcome::AlreadyDeleted);
        assert!(matches!(
            service.generate_with_cache(&info.id, MODEL, vec![ContentPart::text("Q")]).await,
            Err(CacheError::NotFound(_))
        ));
        assert!(service.list_caches().unwrap().is_empty());
    }
}
