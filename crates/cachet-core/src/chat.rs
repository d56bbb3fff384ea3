//! Multi-turn chat over a cached context.

use std::sync::Arc;

use cachet_abstraction::{ContentPart, Turn};
use tracing::debug;

use crate::error::Result;
use crate::service::{CacheService, GenerationResponse};

/// A conversation whose every turn is prefixed by the same cache.
///
/// The session only remembers the cache name; the cache is re-validated on
/// each message, so an expired or deleted cache fails the next turn.
#[derive(Debug)]
pub struct ChatSession {
    service: Arc<CacheService>,
    cache: String,
    model_id: String,
    history: Vec<Turn>,
}

impl ChatSession {
    /// Starts an empty conversation against `cache` (an id or resource name).
    pub fn new(service: Arc<CacheService>, cache: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self { service, cache: cache.into(), model_id: model_id.into(), history: Vec::new() }
    }

    /// Sends one user message and records the exchange.
    ///
    /// History is only extended when generation succeeds.
    pub async fn send_message(&mut self, parts: Vec<ContentPart>) -> Result<GenerationResponse> {
        let response = self
            .service
            .generate_with_history(&self.cache, &self.model_id, &self.history, parts.clone())
            .await?;

        self.history.push(Turn::user(parts));
        self.history.push(Turn::model(vec![ContentPart::text(response.text.clone())]));
        debug!(cache = %self.cache, turns = self.history.len(), "Chat turn recorded");
        Ok(response)
    }

    /// Turns exchanged so far, oldest first.
    #[must_use]
    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    /// The cache this session is bound to.
    #[must_use]
    pub fn cache(&self) -> &str {
        &self.cache
    }
}
