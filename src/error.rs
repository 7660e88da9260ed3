//! Error handling for the documentation assistant

use std::time::Duration;
use thiserror::Error;

/// Result type alias for the assistant
pub type Result<T> = std::result::Result<T, AssistantError>;

/// Main error type for the assistant
#[derive(Error, Debug)]
pub enum AssistantError {
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("vector store error: {0}")]
    Store(#[from] StoreError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("chunking error: {0}")]
    Chunk(#[from] ChunkError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("conversation error: {0}")]
    Conversation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("cancelled")]
    Cancelled,
}

/// Errors raised by source fetchers
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("authentication required for {0}")]
    AuthRequired(String),

    #[error("document too large: {size} bytes exceeds limit of {limit}")]
    TooLarge { size: u64, limit: u64 },

    #[error("rate limited by remote")]
    RateLimited { retry_after: Option<Duration> },

    #[error("transient fetch failure: {0}")]
    Transient(String),

    #[error("malformed source data: {0}")]
    Malformed(String),
}

/// Errors raised by the embedding provider
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("embedder rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("embedding quota exceeded")]
    QuotaExceeded,

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("transient embedding failure: {0}")]
    Transient(String),
}

/// Errors raised by the vector store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("invalid metadata filter: {0}")]
    InvalidFilter(String),
}

/// Errors raised by the LLM client
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("LLM rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("LLM has no capacity")]
    NoCapacity,

    #[error("prompt exceeds the model context window")]
    ContextTooLong,

    #[error("transient LLM failure: {0}")]
    Transient(String),

    #[error("completion refused by policy: {0}")]
    PolicyRefusal(String),

    #[error("invalid LLM response: {0}")]
    InvalidResponse(String),

    #[error("timeout: LLM call took too long")]
    Timeout,
}

/// Errors raised by the chunker
#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("chunking timed out after {elapsed_ms} ms")]
    Timeout { elapsed_ms: u64 },
}

impl AssistantError {
    /// Check if the error is retryable with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AssistantError::Fetch(FetchError::Transient(_))
                | AssistantError::Fetch(FetchError::RateLimited { .. })
                | AssistantError::Embedding(EmbeddingError::Transient(_))
                | AssistantError::Embedding(EmbeddingError::RateLimited { .. })
                | AssistantError::Embedding(EmbeddingError::QuotaExceeded)
                | AssistantError::Store(StoreError::Transient(_))
                | AssistantError::Llm(LlmError::Transient(_))
                | AssistantError::Llm(LlmError::Timeout)
                | AssistantError::Http(_)
        )
    }

    /// Server-advised retry delay, when the remote provided one
    pub fn advised_delay(&self) -> Option<Duration> {
        match self {
            AssistantError::Fetch(FetchError::RateLimited { retry_after })
            | AssistantError::Embedding(EmbeddingError::RateLimited { retry_after })
            | AssistantError::Llm(LlmError::RateLimited { retry_after }) => *retry_after,
            _ => None,
        }
    }

    /// A dimension mismatch anywhere is fatal for the request and must stop ingestion
    pub fn is_dimension_mismatch(&self) -> bool {
        matches!(
            self,
            AssistantError::Embedding(EmbeddingError::DimensionMismatch { .. })
                | AssistantError::Store(StoreError::DimensionMismatch { .. })
        )
    }

    /// Get error category for logging/metrics
    pub fn category(&self) -> &'static str {
        match self {
            AssistantError::Fetch(_) => "fetch",
            AssistantError::Embedding(_) => "embedding",
            AssistantError::Store(_) => "store",
            AssistantError::Llm(_) => "llm",
            AssistantError::Chunk(_) => "chunk",
            AssistantError::Config(_) => "config",
            AssistantError::Conversation(_) => "conversation",
            AssistantError::Io(_) => "io",
            AssistantError::Serialization(_) => "serialization",
            AssistantError::Http(_) => "http",
            AssistantError::Database(_) => "database",
            AssistantError::Cancelled => "cancelled",
        }
    }

    /// Short user-facing message; technical detail stays in the logs
    pub fn user_message(&self) -> &'static str {
        match self {
            AssistantError::Llm(LlmError::RateLimited { .. })
            | AssistantError::Llm(LlmError::NoCapacity) => {
                "The assistant is briefly overloaded. Please retry in a few seconds."
            }
            AssistantError::Llm(LlmError::ContextTooLong) => {
                "The conversation has grown too large. Please start a new conversation."
            }
            AssistantError::Config(_) => "The service is misconfigured.",
            AssistantError::Cancelled => "The request was cancelled.",
            _ => "Something went wrong while answering. Please try again.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        let transient = AssistantError::Fetch(FetchError::Transient("reset".into()));
        assert!(transient.is_retryable());

        let config = AssistantError::Config("bad threshold".into());
        assert!(!config.is_retryable());

        let not_found = AssistantError::Fetch(FetchError::NotFound("README.md".into()));
        assert!(!not_found.is_retryable());
    }

    #[test]
    fn test_advised_delay_passthrough() {
        let err = AssistantError::Embedding(EmbeddingError::RateLimited {
            retry_after: Some(Duration::from_secs(7)),
        });
        assert_eq!(err.advised_delay(), Some(Duration::from_secs(7)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_dimension_mismatch_is_fatal() {
        let err = AssistantError::Store(StoreError::DimensionMismatch {
            expected: 1536,
            actual: 768,
        });
        assert!(err.is_dimension_mismatch());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_category() {
        let err = AssistantError::Llm(LlmError::NoCapacity);
        assert_eq!(err.category(), "llm");

        let err = AssistantError::Chunk(ChunkError::Timeout { elapsed_ms: 3000 });
        assert_eq!(err.category(), "chunk");
    }
}
