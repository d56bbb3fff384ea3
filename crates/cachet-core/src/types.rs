//! Core data types for context caching.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use cachet_abstraction::ContentPart;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

/// Server-generated cache identifier.
///
/// There is intentionally no way to build a `CacheId` from caller input other
/// than [`CacheId::parse`], which only accepts ids in the generated format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheId(String);

impl CacheId {
    /// Allocates a fresh id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Parses an id previously issued by [`CacheId::generate`].
    pub fn parse(raw: &str) -> Result<Self> {
        uuid::Uuid::try_parse(raw)
            .map(|uuid| Self(uuid.simple().to_string()))
            .map_err(|_| CacheError::NotFound(raw.to_string()))
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

static FIXED_VERSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[a-z0-9][a-z0-9.\-]*/)?[a-z0-9][a-z0-9.\-]*-\d{3}$")
        .expect("model version regex should be valid")
});

/// A fixed (non-aliased) model version such as `gemini-1.5-pro-001`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(String);

impl ModelId {
    /// Validates that `raw` names a fixed model version.
    ///
    /// One leading path segment is tolerated, e.g. `models/gemini-1.5-pro-001`.
    /// Aliases such as `gemini-1.5-pro` or `gemini-1.5-pro-latest` are rejected.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if !FIXED_VERSION.is_match(trimmed) {
            return Err(CacheError::UnversionedModel(raw.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// The model id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a cache entry.
///
/// Transitions: `Active -> Active` (TTL update), `Active -> Expired`,
/// `Active | Expired -> Deleted`. Nothing leaves `Deleted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheState {
    /// Usable for binding.
    Active,
    /// Past its expiration time; readable but not bindable.
    Expired,
    /// Removed; content reclaimed.
    Deleted,
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Expired => write!(f, "EXPIRED"),
            Self::Deleted => write!(f, "DELETED"),
        }
    }
}

/// How a cache's expiration is specified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpirationPolicy {
    /// Relative to the time of the call.
    Ttl(Duration),
    /// Absolute instant.
    ExpireAt(DateTime<Utc>),
}

impl ExpirationPolicy {
    /// Builds a policy from the two optional request fields.
    ///
    /// Returns `Ok(None)` when neither is set.
    pub fn from_options(
        ttl: Option<Duration>,
        expire_time: Option<DateTime<Utc>>,
    ) -> Result<Option<Self>> {
        match (ttl, expire_time) {
            (Some(_), Some(_)) => Err(CacheError::AmbiguousExpiration),
            (Some(ttl), None) => Ok(Some(Self::Ttl(ttl))),
            (None, Some(at)) => Ok(Some(Self::ExpireAt(at))),
            (None, None) => Ok(None),
        }
    }
}

/// Opaque handle to a record in the [`ContentStore`](crate::content_store::ContentStore).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentRef(pub(crate) uuid::Uuid);

impl fmt::Display for ContentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "content:{}", self.0.simple())
    }
}

/// Immutable cached content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredContent {
    /// Optional system instruction, placed before the parts.
    pub system_instruction: Option<String>,
    /// Cached parts in insertion order.
    pub parts: Vec<ContentPart>,
    /// Tokens counted for instruction and parts together.
    pub token_count: u64,
}

/// A cache entry as owned by the registry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Cache id.
    pub id: CacheId,
    /// Model version the content was tokenized for.
    pub model_id: ModelId,
    /// Optional human-readable label.
    pub display_name: Option<String>,
    /// Handle into the content store.
    pub content_ref: ContentRef,
    /// The cached content, shared with every binding.
    pub content: Arc<StoredContent>,
    /// When the entry was committed.
    pub created_at: DateTime<Utc>,
    /// When the expiration was last set.
    pub updated_at: DateTime<Utc>,
    /// When the entry stops being usable.
    pub expire_at: DateTime<Utc>,
    /// Lifecycle state.
    pub state: CacheState,
}

impl CacheEntry {
    /// Token count of the cached content.
    #[must_use]
    pub fn token_count(&self) -> u64 {
        self.content.token_count
    }

    /// Moves an active entry past its deadline to `Expired`.
    ///
    /// Returns `true` if this call made the transition.
    pub fn expire_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if self.state == CacheState::Active && self.expire_at <= now {
            self.state = CacheState::Expired;
            true
        } else {
            false
        }
    }
}

/// Result of a delete call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteOutcome {
    /// This call deleted the entry.
    Deleted,
    /// Nothing to do: the id was already deleted or never issued.
    AlreadyDeleted,
}

/// Public metadata for a cache, as returned by the service API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedContentInfo {
    /// Cache id.
    pub id: String,
    /// Fully qualified resource name.
    pub resource_name: String,
    /// Model version the cache is bound to.
    pub model_id: String,
    /// Optional human-readable label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Creation time.
    pub create_time: DateTime<Utc>,
    /// Last expiration update.
    pub update_time: DateTime<Utc>,
    /// Expiration time.
    pub expire_time: DateTime<Utc>,
    /// Lifecycle state.
    pub state: CacheState,
    /// Tokens held by the cache.
    pub token_count: u64,
}

impl CachedContentInfo {
    /// Builds the public view of `entry` under `resource_prefix`.
    #[must_use]
    pub fn from_entry(entry: &CacheEntry, resource_prefix: &str) -> Self {
        Self {
            id: entry.id.to_string(),
            resource_name: format!("{resource_prefix}{}", entry.id),
            model_id: entry.model_id.to_string(),
            display_name: entry.display_name.clone(),
            create_time: entry.created_at,
            update_time: entry.updated_at,
            expire_time: entry.expire_at,
            state: entry.state,
            token_count: entry.token_count(),
        }
    }
}

/// Request to create a cache.
///
/// There is no id field: ids are always generated by the registry.
#[derive(Debug, Clone, Default)]
pub struct CreateCacheRequest {
    /// Fixed model version the content is cached for.
    pub model_id: String,
    /// Content to cache, in order.
    pub contents: Vec<ContentPart>,
    /// Optional system instruction.
    pub system_instruction: Option<String>,
    /// Optional human-readable label.
    pub display_name: Option<String>,
    /// Relative expiration; mutually exclusive with `expire_time`.
    pub ttl: Option<Duration>,
    /// Absolute expiration; mutually exclusive with `ttl`.
    pub expire_time: Option<DateTime<Utc>>,
}

impl CreateCacheRequest {
    /// Starts a request for `model_id`.
    pub fn new(model_id: impl Into<String>) -> Self {
        Self { model_id: model_id.into(), ..Default::default() }
    }

    /// Appends a content part.
    #[must_use]
    pub fn with_part(mut self, part: ContentPart) -> Self {
        self.contents.push(part);
        self
    }

    /// Sets the system instruction.
    #[must_use]
    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Sets a relative TTL.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets an absolute expire time.
    #[must_use]
    pub fn with_expire_time(mut self, at: DateTime<Utc>) -> Self {
        self.expire_time = Some(at);
        self
    }
}
