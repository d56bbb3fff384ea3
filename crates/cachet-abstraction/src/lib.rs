//! Collaborator contracts for the cachet context cache service.
//!
//! The cache manager never tokenizes, stores media bytes, or runs a model
//! itself. It talks to three collaborators through the traits defined here:
//!
//! - [`Tokenizer`]: counts tokens for text and for referenced blobs.
//! - [`BlobStore`]: resolves and pins media referenced by URI.
//! - [`GenerationEngine`]: runs a model over a composed request.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single piece of model input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Inline text.
    Text {
        /// The text itself.
        text: String,
    },
    /// A reference to a blob (pdf, audio, video...) held by a [`BlobStore`].
    FileData {
        /// Blob location, e.g. `gs://bucket/paper.pdf`.
        uri: String,
        /// MIME type of the referenced blob.
        mime_type: String,
    },
}

impl ContentPart {
    /// Creates a text part.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Creates a blob reference part.
    pub fn file_data(uri: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self::FileData { uri: uri.into(), mime_type: mime_type.into() }
    }

    /// Returns the inline text, if this is a text part.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::FileData { .. } => None,
        }
    }
}

impl fmt::Display for ContentPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text { text } => write!(f, "{text}"),
            Self::FileData { uri, mime_type } => write!(f, "[{mime_type}] {uri}"),
        }
    }
}

/// Author of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The caller.
    User,
    /// The model.
    Model,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Model => write!(f, "model"),
        }
    }
}

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    /// Who produced this turn.
    pub role: Role,
    /// The turn content, in order.
    pub parts: Vec<ContentPart>,
}

impl Turn {
    /// Creates a user turn.
    #[must_use]
    pub fn user(parts: Vec<ContentPart>) -> Self {
        Self { role: Role::User, parts }
    }

    /// Creates a model turn.
    #[must_use]
    pub fn model(parts: Vec<ContentPart>) -> Self {
        Self { role: Role::Model, parts }
    }
}

/// Parameters for controlling generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParameters {
    /// Sampling temperature, between 0 and 2.
    pub temperature: Option<f32>,

    /// Nucleus sampling probability mass.
    pub top_p: Option<f32>,

    /// The maximum number of tokens to generate.
    pub max_output_tokens: Option<u32>,
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self { temperature: Some(0.7), top_p: Some(1.0), max_output_tokens: Some(512) }
    }
}

/// Describes the part of a request served from a context cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedPrefix {
    /// Cache id the prefix was read from.
    pub name: String,
    /// Number of leading `contents` turns that came from the cache. The
    /// system instruction, when present, is always cached as well.
    pub leading_turns: usize,
    /// Tokens the cached prefix accounts for.
    pub token_count: u64,
}

/// The full input handed to a [`GenerationEngine`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Fixed model version to run.
    pub model_id: String,
    /// The cached prefix, if the request was composed from a cache.
    pub cached_content: Option<CachedPrefix>,
    /// System instruction, always first.
    pub system_instruction: Option<String>,
    /// Conversation turns in the order the model must see them.
    pub contents: Vec<Turn>,
    /// Optional generation parameters.
    pub parameters: Option<GenerationParameters>,
}

/// Token usage reported by an engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineUsage {
    /// Tokens consumed by the prompt, cached prefix included.
    pub prompt_tokens: u64,
    /// Tokens produced by the model.
    pub completion_tokens: u64,
}

/// What an engine returns for a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutput {
    /// The generated text.
    pub text: String,
    /// Usage, when the engine reports it.
    pub usage: Option<EngineUsage>,
}

/// Errors raised by a [`GenerationEngine`].
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineError {
    /// The request was rejected before running (bad input, unknown model).
    #[error("Request Error: {0}")]
    RequestError(String),

    /// The engine is overloaded or out of quota.
    #[error("Engine '{engine}' unavailable{}", message.as_ref().map(|m| format!(": {}", m)).unwrap_or_default())]
    Unavailable {
        /// The engine name.
        engine: String,
        /// Optional detail from the engine.
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Other unexpected errors.
    #[error("Other Engine Error: {0}")]
    Other(String),
}

/// Runs a model over a composed request.
///
/// Engines must be `Send + Sync` so a single instance can serve concurrent callers.
#[async_trait]
pub trait GenerationEngine: Send + Sync {
    /// Generates a response for `request`.
    ///
    /// # Errors
    /// Returns an `EngineError` if generation fails.
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationOutput, EngineError>;

    /// Returns the engine identifier, used in logs.
    fn engine_id(&self) -> &str;
}

/// Metadata for a blob resolved by a [`BlobStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobInfo {
    /// Blob location.
    pub uri: String,
    /// MIME type recorded by the store.
    pub mime_type: String,
    /// Blob size in bytes.
    pub size_bytes: u64,
}

/// Errors raised by a [`BlobStore`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlobError {
    /// No blob exists at the URI.
    #[error("Blob not found: {0}")]
    NotFound(String),

    /// The blob exists but its MIME type differs from the one requested.
    #[error("Blob {uri} has MIME type {actual}, expected {expected}")]
    MimeMismatch {
        /// Blob location.
        uri: String,
        /// MIME type the caller declared.
        expected: String,
        /// MIME type the store holds.
        actual: String,
    },

    /// The store could not be reached or failed mid-operation.
    #[error("Blob store unavailable: {0}")]
    Unavailable(String),
}

/// Resolves and pins media referenced by cached content.
///
/// `retain` and `release` are reference counted by the store: content that
/// references a blob retains it once per part and releases it once per part.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Resolves the blob at `uri` and pins it for the lifetime of a cache.
    ///
    /// # Errors
    /// Returns `BlobError` if the blob is missing, mistyped, or the store fails.
    async fn retain(&self, uri: &str, mime_type: &str) -> Result<BlobInfo, BlobError>;

    /// Drops one pin on the blob at `uri`.
    ///
    /// # Errors
    /// Returns `BlobError` if the store fails. Releasing an unknown blob is not an error.
    async fn release(&self, uri: &str) -> Result<(), BlobError>;
}

/// Errors raised by a [`Tokenizer`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenizerError {
    /// The tokenizer does not know this model.
    #[error("Unsupported model for tokenization: {0}")]
    UnsupportedModel(String),

    /// The tokenizer cannot count this MIME type.
    #[error("Unsupported MIME type for tokenization: {0}")]
    UnsupportedMimeType(String),

    /// Any other failure.
    #[error("Tokenizer error: {0}")]
    Other(String),
}

/// Counts tokens with a specific model's tokenizer.
#[async_trait]
pub trait Tokenizer: Send + Sync {
    /// Counts tokens in `text` for `model_id`.
    ///
    /// # Errors
    /// Returns `TokenizerError` if the model is unknown.
    async fn count_text(&self, model_id: &str, text: &str) -> Result<u64, TokenizerError>;

    /// Counts tokens a resolved blob contributes for `model_id`.
    ///
    /// # Errors
    /// Returns `TokenizerError` if the model or MIME type is unsupported.
    async fn count_blob(&self, model_id: &str, blob: &BlobInfo) -> Result<u64, TokenizerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_part_serializes_tagged() {
        let part = ContentPart::file_data("gs://bucket/a.pdf", "application/pdf");
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json["type"], "file_data");
        assert_eq!(json["uri"], "gs://bucket/a.pdf");

        let text: ContentPart = serde_json::from_str(r#"{"type":"text","text":"hi"}"#).unwrap();
        assert_eq!(text.as_text(), Some("hi"));
    }

    #[test]
    fn test_content_part_display() {
        assert_eq!(ContentPart::text("hello").to_string(), "hello");
        assert_eq!(
            ContentPart::file_data("gs://b/v.mp4", "video/mp4").to_string(),
            "[video/mp4] gs://b/v.mp4"
        );
    }

    #[test]
    fn test_engine_error_display() {
        let err = EngineError::Unavailable { engine: "mock".to_string(), message: None };
        assert_eq!(err.to_string(), "Engine 'mock' unavailable");

        let err = EngineError::Unavailable {
            engine: "mock".to_string(),
            message: Some("quota".to_string()),
        };
        assert_eq!(err.to_string(), "Engine 'mock' unavailable: quota");
    }

    #[test]
    fn test_role_display() {
        assert_eq!(Role::User.to_string(), "user");
        assert_eq!(Role::Model.to_string(), "model");
        assert_eq!(Turn::model(vec![]).role, Role::Model);
    }
}
