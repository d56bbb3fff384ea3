//! Prefix binding: turning a cache id plus new input into an effective request.
//!
//! The cached system instruction and parts always come first, in insertion
//! order, followed by any prior conversation turns and then the new input.
//! The cached portion is shared by `Arc`, so every request composed from the
//! same binding carries an identical prefix.

use std::sync::Arc;

use cachet_abstraction::{
    CachedPrefix, ContentPart, GenerationParameters, GenerationRequest, Role, Turn,
};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::{CacheError, Result};
use crate::registry::CacheRegistry;
use crate::types::{CacheEntry, CacheId, CacheState, ModelId, StoredContent};

/// A cache that passed validation for one model.
#[derive(Debug, Clone)]
pub struct BoundContext {
    id: CacheId,
    model_id: ModelId,
    content: Arc<StoredContent>,
}

impl BoundContext {
    /// The bound cache id.
    #[must_use]
    pub fn cache_id(&self) -> &CacheId {
        &self.id
    }

    /// The model the cache was built for.
    #[must_use]
    pub fn model_id(&self) -> &ModelId {
        &self.model_id
    }

    /// The cached system instruction.
    #[must_use]
    pub fn system_instruction(&self) -> Option<&str> {
        self.content.system_instruction.as_deref()
    }

    /// The cached parts, in insertion order.
    #[must_use]
    pub fn cached_parts(&self) -> &[ContentPart] {
        &self.content.parts
    }

    /// Tokens served from the cache.
    #[must_use]
    pub fn token_count(&self) -> u64 {
        self.content.token_count
    }
}

/// One element of an effective request, in model order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment<'a> {
    /// The cached system instruction.
    SystemInstruction(&'a str),
    /// A cached part.
    Cached(&'a ContentPart),
    /// A prior conversation turn.
    History(&'a Turn),
    /// A part of the new input.
    Input(&'a ContentPart),
}

/// Cached prefix plus per-call suffix.
#[derive(Debug, Clone)]
pub struct EffectiveRequest {
    context: BoundContext,
    history: Vec<Turn>,
    input: Vec<ContentPart>,
}

impl EffectiveRequest {
    /// The binding this request was composed from.
    #[must_use]
    pub fn context(&self) -> &BoundContext {
        &self.context
    }

    /// Prior turns placed between the cached prefix and the new input.
    #[must_use]
    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    /// The new input parts.
    #[must_use]
    pub fn input(&self) -> &[ContentPart] {
        &self.input
    }

    /// Every segment in the order the model sees it.
    #[must_use]
    pub fn segments(&self) -> Vec<Segment<'_>> {
        let mut segments = Vec::with_capacity(
            1 + self.context.cached_parts().len() + self.history.len() + self.input.len(),
        );
        if let Some(instruction) = self.context.system_instruction() {
            segments.push(Segment::SystemInstruction(instruction));
        }
        segments.extend(self.context.cached_parts().iter().map(Segment::Cached));
        segments.extend(self.history.iter().map(Segment::History));
        segments.extend(self.input.iter().map(Segment::Input));
        segments
    }

    /// Builds the request handed to a generation engine.
    ///
    /// Cached parts form the first user turn, history follows unchanged, and
    /// the new input is the final user turn.
    #[must_use]
    pub fn into_generation_request(self, parameters: Option<GenerationParameters>) -> GenerationRequest {
        let mut contents = Vec::with_capacity(self.history.len() + 2);
        if !self.context.cached_parts().is_empty() {
            contents.push(Turn::user(self.context.cached_parts().to_vec()));
        }
        let cached = CachedPrefix {
            name: self.context.id.to_string(),
            leading_turns: contents.len(),
            token_count: self.context.token_count(),
        };
        contents.extend(self.history);
        if !self.input.is_empty() {
            contents.push(Turn { role: Role::User, parts: self.input });
        }

        GenerationRequest {
            model_id: self.context.model_id.to_string(),
            cached_content: Some(cached),
            system_instruction: self.context.content.system_instruction.clone(),
            contents,
            parameters,
        }
    }
}

/// Validates cache usage and composes effective requests.
#[derive(Debug, Clone)]
pub struct PrefixBindingService {
    registry: Arc<CacheRegistry>,
}

impl PrefixBindingService {
    /// Creates a binder over `registry`.
    #[must_use]
    pub fn new(registry: Arc<CacheRegistry>) -> Self {
        Self { registry }
    }

    /// Binds a request for `model_id` to a cache.
    ///
    /// The entry is re-read on every call, with the lazy expiry check
    /// applied, so an expired cache is never bound.
    ///
    /// # Errors
    /// * `NotFound` - unknown or deleted cache
    /// * `ModelMismatch` - `model_id` is not the model the cache was built for
    /// * `Expired` - the cache is past its expiration time
    pub fn bind(&self, id: &CacheId, model_id: &str, now: DateTime<Utc>) -> Result<BoundContext> {
        let entry = self.registry.get(id, now)?;
        Self::check(&entry, model_id)?;

        debug!(cache_id = %id, model_id = %entry.model_id, "Bound request to cache");
        Ok(BoundContext { id: entry.id, model_id: entry.model_id, content: entry.content })
    }

    fn check(entry: &CacheEntry, model_id: &str) -> Result<()> {
        // Stored ids are trimmed by `ModelId::parse`.
        if entry.model_id.as_str() != model_id.trim() {
            warn!(cache_id = %entry.id, cached = %entry.model_id, requested = model_id, "Model mismatch");
            return Err(CacheError::ModelMismatch {
                id: entry.id.to_string(),
                cached: entry.model_id.to_string(),
                requested: model_id.to_string(),
            });
        }

        match entry.state {
            CacheState::Active => Ok(()),
            CacheState::Expired => {
                warn!(cache_id = %entry.id, expire_at = %entry.expire_at.to_rfc3339(), "Rejected expired cache");
                Err(CacheError::Expired(entry.id.to_string()))
            }
            CacheState::Deleted => Err(CacheError::NotFound(entry.id.to_string())),
        }
    }

    /// Places the cached prefix ahead of `input`.
    #[must_use]
    pub fn compose(&self, context: &BoundContext, input: Vec<ContentPart>) -> EffectiveRequest {
        self.compose_with_history(context, Vec::new(), input)
    }

    /// Places the cached prefix, then `history`, then `input`.
    #[must_use]
    pub fn compose_with_history(
        &self,
        context: &BoundContext,
        history: Vec<Turn>,
        input: Vec<ContentPart>,
    ) -> EffectiveRequest {
        EffectiveRequest { context: context.clone(), history, input }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::InMemoryBlobStore;
    use crate::content_store::ContentStore;
    use crate::expiration::ExpirationManager;
    use crate::tokenizer::EstimatingTokenizer;
    use crate::types::CreateCacheRequest;
    use chrono::TimeZone;
    use std::time::Duration;

    const MODEL: &str = "gemini-1.5-pro-001";

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    async fn setup() -> (Arc<CacheRegistry>, PrefixBindingService, CacheId) {
        let store = ContentStore::new(
            Arc::new(EstimatingTokenizer),
            Arc::new(InMemoryBlobStore::new()),
            1,
        );
        let registry = Arc::new(CacheRegistry::new(
            store,
            ExpirationManager::new(Duration::from_secs(86_400), Duration::from_secs(3600)),
            Duration::from_secs(3600),
        ));
        let entry = registry
            .create(
                CreateCacheRequest::new(MODEL)
                    .with_system_instruction("S")
                    .with_part(ContentPart::text("P1 text"))
                    .with_part(ContentPart::text("P2 text")),
                t0(),
            )
            .await
            .unwrap();
        let binder = PrefixBindingService::new(Arc::clone(&registry));
        (registry, binder, entry.id)
    }

    fn flatten(request: &EffectiveRequest) -> Vec<String> {
        request
            .segments()
            .into_iter()
            .map(|segment| match segment {
                Segment::SystemInstruction(text) => text.to_string(),
                Segment::Cached(part) | Segment::Input(part) => part.to_string(),
                Segment::History(turn) => format!("{}:{}", turn.role, turn.parts.len()),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_compose_orders_prefix_then_input() {
        let (_registry, binder, id) = setup().await;
        let bound = binder.bind(&id, MODEL, t0()).unwrap();

        let first = binder.compose(&bound, vec![ContentPart::text("Q")]);
        let second = binder.compose(&bound, vec![ContentPart::text("Q2")]);

        assert_eq!(flatten(&first), ["S", "P1 text", "P2 text", "Q"]);
        assert_eq!(flatten(&second), ["S", "P1 text", "P2 text", "Q2"]);
    }

    #[tokio::test]
    async fn test_compose_with_history_sits_between_prefix_and_input() {
        let (_registry, binder, id) = setup().await;
        let bound = binder.bind(&id, MODEL, t0()).unwrap();
        let history = vec![
            Turn::user(vec![ContentPart::text("Q1")]),
            Turn::model(vec![ContentPart::text("A1")]),
        ];

        let request = binder.compose_with_history(&bound, history, vec![ContentPart::text("Q2")]);
        assert_eq!(flatten(&request), ["S", "P1 text", "P2 text", "user:1", "model:1", "Q2"]);

        let generation = request.into_generation_request(None);
        assert_eq!(generation.system_instruction.as_deref(), Some("S"));
        let cached = generation.cached_content.as_ref().unwrap();
        assert_eq!(cached.name, id.as_str());
        assert_eq!(cached.leading_turns, 1);
        assert_eq!(cached.token_count, bound.token_count());
        let roles: Vec<Role> = generation.contents.iter().map(|turn| turn.role).collect();
        assert_eq!(roles, [Role::User, Role::User, Role::Model, Role::User]);
        assert_eq!(generation.contents[0].parts.len(), 2);
    }

    #[tokio::test]
    async fn test_bind_rejects_other_model_version() {
        let (_registry, binder, id) = setup().await;
        let err = binder.bind(&id, "gemini-1.5-pro-002", t0()).unwrap_err();
        assert!(matches!(err, CacheError::ModelMismatch { .. }));
    }

    #[tokio::test]
    async fn test_bind_ignores_surrounding_whitespace_in_model_id() {
        let (_registry, binder, id) = setup().await;
        let bound = binder.bind(&id, " gemini-1.5-pro-001\n", t0()).unwrap();
        assert_eq!(bound.model_id().as_str(), MODEL);
    }

    #[tokio::test]
    async fn test_bind_fails_expired_without_sweep() {
        let (registry, binder, id) = setup().await;
        let later = t0() + chrono::Duration::hours(1);

        assert_eq!(binder.bind(&id, MODEL, later).unwrap_err(), CacheError::Expired(id.to_string()));
        assert_eq!(registry.get(&id, later).unwrap().state, CacheState::Expired);
    }

    #[tokio::test]
    async fn test_bind_deleted_is_not_found() {
        let (registry, binder, id) = setup().await;
        registry.delete(&id).await.unwrap();
        assert!(matches!(binder.bind(&id, MODEL, t0()), Err(CacheError::NotFound(_))));
    }
}
