//! Token estimation.
//!
//! Real token counts come from the model's own tokenizer. The
//! [`EstimatingTokenizer`] is a stand-in with stable, documented ratios so the
//! cache can be exercised without one.

use async_trait::async_trait;
use cachet_abstraction::{BlobInfo, Tokenizer, TokenizerError};

/// Approximate characters per text token.
pub const CHARS_PER_TOKEN: u64 = 4;

/// Approximate bytes per token for media blobs.
pub const BYTES_PER_BLOB_TOKEN: u64 = 32;

const SUPPORTED_MEDIA: &[&str] = &["application/pdf", "text/", "image/", "audio/", "video/"];

/// Counts tokens by character and byte ratios.
#[derive(Debug, Clone, Copy, Default)]
pub struct EstimatingTokenizer;

impl EstimatingTokenizer {
    /// Estimated tokens for a piece of text.
    #[must_use]
    pub fn estimate_text(text: &str) -> u64 {
        (text.chars().count() as u64).div_ceil(CHARS_PER_TOKEN)
    }
}

#[async_trait]
impl Tokenizer for EstimatingTokenizer {
    async fn count_text(&self, _model_id: &str, text: &str) -> Result<u64, TokenizerError> {
        Ok(Self::estimate_text(text))
    }

    async fn count_blob(&self, _model_id: &str, blob: &BlobInfo) -> Result<u64, TokenizerError> {
        if !SUPPORTED_MEDIA.iter().any(|prefix| blob.mime_type.starts_with(prefix)) {
            return Err(TokenizerError::UnsupportedMimeType(blob.mime_type.clone()));
        }
        Ok(blob.size_bytes.div_ceil(BYTES_PER_BLOB_TOKEN))
    }
}
