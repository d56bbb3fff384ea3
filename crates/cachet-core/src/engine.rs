//! Mock generation engine for testing and the CLI walkthrough.

use std::fmt::Write;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use cachet_abstraction::{
    ContentPart, EngineError, EngineUsage, GenerationEngine, GenerationOutput, GenerationRequest,
    Role,
};
use tracing::debug;

use crate::tokenizer::EstimatingTokenizer;

/// Echoes a summary of the request it was given.
///
/// Usage is estimated with [`EstimatingTokenizer`]; the cached prefix is
/// counted at the token count the request carries for it.
#[derive(Debug)]
pub struct MockEngine {
    id: String,
    failing: AtomicU32,
}

impl MockEngine {
    /// Creates a new `MockEngine` with the given ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), failing: AtomicU32::new(0) }
    }

    /// Makes the next `count` calls fail with `Unavailable`.
    pub fn fail_next(&self, count: u32) {
        self.failing.store(count, Ordering::SeqCst);
    }

    fn take_failure(&self) -> bool {
        self.failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new("mock")
    }
}

fn text_tokens(parts: &[ContentPart]) -> u64 {
    parts.iter().filter_map(ContentPart::as_text).map(EstimatingTokenizer::estimate_text).sum()
}

#[async_trait]
impl GenerationEngine for MockEngine {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationOutput, EngineError> {
        debug!(
            engine = %self.id,
            model_id = %request.model_id,
            turns = request.contents.len(),
            cached = request.cached_content.is_some(),
            "MockEngine generating"
        );

        if self.take_failure() {
            return Err(EngineError::Unavailable {
                engine: self.id.clone(),
                message: Some("injected failure".to_string()),
            });
        }

        let (cached_turns, cached_tokens) = match &request.cached_content {
            Some(prefix) => (prefix.leading_turns, prefix.token_count),
            None => {
                let instruction = request
                    .system_instruction
                    .as_deref()
                    .map_or(0, EstimatingTokenizer::estimate_text);
                (0, instruction)
            }
        };
        let fresh_tokens: u64 =
            request.contents.iter().skip(cached_turns).map(|turn| text_tokens(&turn.parts)).sum();

        let question = request
            .contents
            .iter()
            .rev()
            .find(|turn| turn.role == Role::User)
            .map(|turn| turn.parts.iter().map(ToString::to_string).collect::<Vec<_>>().join(" "))
            .unwrap_or_default();

        let mut text = format!("Mock response from {} for {}", self.id, request.model_id);
        if let Some(prefix) = &request.cached_content {
            let _ = write!(text, " using cache {} ({} tokens)", prefix.name, prefix.token_count);
        }
        let prior = request.contents.len().saturating_sub(cached_turns + 1);
        if prior > 0 {
            let _ = write!(text, " after {prior} prior turns");
        }
        let _ = write!(text, ": {question}");

        let completion_tokens = EstimatingTokenizer::estimate_text(&text);
        Ok(GenerationOutput {
            text,
            usage: Some(EngineUsage {
                prompt_tokens: cached_tokens + fresh_tokens,
                completion_tokens,
            }),
        })
    }

    fn engine_id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachet_abstraction::{CachedPrefix, Turn};

    fn request(cached: Option<CachedPrefix>) -> GenerationRequest {
        GenerationRequest {
            model_id: "gemini-1.5-pro-001".to_string(),
            cached_content: cached,
            system_instruction: Some("You are an expert researcher.".to_string()),
            contents: vec![
                Turn::user(vec![ContentPart::file_data("gs://b/a.pdf", "application/pdf")]),
                Turn::user(vec![ContentPart::text("What is common?")]),
            ],
            parameters: None,
        }
    }

    #[tokio::test]
    async fn test_mock_engine_counts_cached_prefix() {
        let engine = MockEngine::default();
        let output = engine
            .generate(request(Some(CachedPrefix {
                name: "abc".to_string(),
                leading_turns: 1,
                token_count: 40_000,
            })))
            .await
            .unwrap();

        let usage = output.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 40_000 + EstimatingTokenizer::estimate_text("What is common?"));
        assert!(usage.completion_tokens > 0);
        assert!(output.text.contains("using cache abc"));
        assert!(output.text.ends_with(": What is common?"));
    }

    #[tokio::test]
    async fn test_mock_engine_failure_injection() {
        let engine = MockEngine::new("flaky");
        engine.fail_next(1);

        assert!(matches!(
            engine.generate(request(None)).await,
            Err(EngineError::Unavailable { .. })
        ));
        assert!(engine.generate(request(None)).await.is_ok());
        assert_eq!(engine.engine_id(), "flaky");
    }
}
