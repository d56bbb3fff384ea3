//! Cachet Core - context cache manager for LLM inference.
//!
//! A cache holds a large, reused prompt prefix (a system instruction plus
//! text and media parts) so that repeated generation requests only pay for
//! their new input. This crate provides:
//! - Content storage with token counting and blob pinning
//! - Expiration scheduling with lazy checks and a background sweeper
//! - A registry with per-entry locking and cancellation-safe creation
//! - Prefix binding that composes cached content ahead of new input
//! - A service facade and a chat session built on top of it
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use cachet_abstraction::ContentPart;
//! use cachet_core::{
//!     CacheService, CacheServiceConfig, CreateCacheRequest, EstimatingTokenizer,
//!     InMemoryBlobStore, MockEngine,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let blobs = Arc::new(InMemoryBlobStore::new());
//!     blobs.insert("gs://papers/a.pdf", "application/pdf", 2_000_000);
//!
//!     let service = CacheService::new(
//!         CacheServiceConfig::default(),
//!         Arc::new(EstimatingTokenizer),
//!         blobs,
//!         Arc::new(MockEngine::default()),
//!     )?;
//!
//!     let cache = service
//!         .create_cache(
//!             CreateCacheRequest::new("gemini-1.5-pro-001")
//!                 .with_part(ContentPart::file_data("gs://papers/a.pdf", "application/pdf")),
//!         )
//!         .await?;
//!     let answer = service
//!         .generate_with_cache(&cache.id, "gemini-1.5-pro-001", vec![ContentPart::text("Summarize")])
//!         .await?;
//!     println!("{}", answer.text);
//!     Ok(())
//! }
//! ```

pub mod binding;
pub mod blob;
pub mod chat;
pub mod config;
pub mod content_store;
pub mod engine;
pub mod error;
pub mod expiration;
pub mod registry;
pub mod service;
pub mod sweeper;
pub mod tokenizer;
pub mod types;

pub use binding::{BoundContext, EffectiveRequest, PrefixBindingService, Segment};
pub use blob::InMemoryBlobStore;
pub use chat::ChatSession;
pub use config::{
    CacheServiceConfig, ConfigError, DEFAULT_MIN_CACHEABLE_TOKENS, default_config_path,
    load_service_config,
};
pub use content_store::{ContentStore, ReclaimReport};
pub use engine::MockEngine;
pub use error::{CacheError, Result};
pub use expiration::ExpirationManager;
pub use registry::{CacheRegistry, SweepReport};
pub use service::{CacheService, GenerationResponse, UsageMetadata};
pub use sweeper::ExpirationSweeper;
pub use tokenizer::EstimatingTokenizer;
pub use types::{
    CacheEntry, CacheId, CacheState, CachedContentInfo, ContentRef, CreateCacheRequest,
    DeleteOutcome, ExpirationPolicy, ModelId, StoredContent,
};
