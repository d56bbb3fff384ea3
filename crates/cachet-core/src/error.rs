//! Error types for the context cache service.

use cachet_abstraction::{BlobError, EngineError, TokenizerError};
use thiserror::Error;

use crate::types::CacheState;

/// Errors returned by cache lifecycle, binding, and generation operations.
///
/// Every error is surfaced to the caller of the failing operation. In
/// particular an expired cache is reported as [`CacheError::Expired`], never
/// silently dropped from the request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Content is below the minimum cacheable token count.
    #[error("Content too small to cache: {token_count} tokens, minimum is {minimum}")]
    ContentTooSmall {
        /// Tokens counted for the content.
        token_count: u64,
        /// Configured floor.
        minimum: u64,
    },

    /// Both a TTL and an absolute expire time were supplied.
    #[error("Specify either ttl or expire_time, not both")]
    AmbiguousExpiration,

    /// The cache id is unknown or the cache was deleted.
    #[error("Cache not found: {0}")]
    NotFound(String),

    /// The operation is not valid in the cache's current lifecycle state.
    #[error("Cache {id} is {state}; {operation} requires an active cache")]
    InvalidState {
        /// Cache id.
        id: String,
        /// State observed when the operation ran.
        state: CacheState,
        /// Operation that was attempted.
        operation: &'static str,
    },

    /// The request names a different model version than the cache was built for.
    #[error("Cache {id} was created for model {cached}, request uses {requested}")]
    ModelMismatch {
        /// Cache id.
        id: String,
        /// Model the cache is bound to.
        cached: String,
        /// Model the caller asked for.
        requested: String,
    },

    /// The cache exists but has passed its expiration time.
    #[error("Cache expired: {0}")]
    Expired(String),

    /// The model id is an alias rather than a fixed version.
    #[error("Model {0} is not a fixed model version (expected a -NNN suffix, e.g. gemini-1.5-pro-001)")]
    UnversionedModel(String),

    /// A request argument is invalid.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A referenced blob could not be resolved or pinned.
    #[error("Blob store error: {0}")]
    Blob(#[from] BlobError),

    /// The tokenizer failed.
    #[error("Tokenizer error: {0}")]
    Tokenizer(#[from] TokenizerError),

    /// The generation engine failed.
    #[error("Generation error: {0}")]
    Generation(#[from] EngineError),

    /// Internal failure such as a poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

impl CacheError {
    /// Builds the error for a poisoned lock.
    pub(crate) fn poisoned(what: &str) -> Self {
        Self::Internal(format!("{what} lock poisoned"))
    }
}
