//! Retrieval-augmented question answering over developer documentation
//!
//! The crate hosts two pipelines:
//! - Ingestion: fetch documents from Git trees, wikis, issues, and diagram
//!   summaries; deduplicate by content sha; chunk with overlap; embed; and
//!   upsert into a vector store under memory and rate limits.
//! - Answering: retrieve relevant chunks, assemble a prompt with bounded
//!   conversation memory, stream the completion, and rewrite repository
//!   URLs onto their canonical forms.
//!
//! # Example
//!
//! ```rust,no_run
//! use docpilot::api::{self, AppState};
//! use docpilot::config::AssistantConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = AssistantConfig::default();
//!     config.apply_env();
//!     config.validate()?;
//!     api::serve(config).await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod chunker;
pub mod config;
pub mod conversation;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod llm;
pub mod memstat;
pub mod orchestrator;
pub mod registry;
pub mod retrieval;
pub mod sources;
pub mod store;

// Re-export main types
pub use chunker::{ChunkPiece, TextChunker};
pub use config::AssistantConfig;
pub use conversation::{
    ConversationMemory, ConversationState, ConversationStore, InMemoryConversationStore,
};
pub use embedding::{Embedder, HttpEmbedder};
pub use error::{AssistantError, Result};
pub use ingest::{IngestOptions, IngestReport, IngestStatus, IngestionOrchestrator};
pub use llm::{ChatMessage, CompletionResponse, HttpLlmClient, LlmClient, Role};
pub use memstat::{MemoryProbe, SystemMemoryProbe};
pub use orchestrator::{Answer, AnswerOrchestrator, StreamFrame};
pub use registry::{RepoRegistry, UrlValidator};
pub use retrieval::{Citation, RetrievalService, RetrievedContext};
pub use sources::{
    DocumentRef, FetcherRegistry, RawDocument, SourceFetcher, SourceSpec, SourceType,
};
pub use store::{MetadataFilter, QueryMatch, SqliteVectorStore, VectorRecord, VectorStore};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(VERSION.starts_with(char::is_numeric));
    }
}
