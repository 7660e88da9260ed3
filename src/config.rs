//! Configuration management for the documentation assistant

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Main configuration for the assistant
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AssistantConfig {
    /// LLM configuration
    #[serde(default)]
    pub llm: LlmConfig,

    /// Embedding provider configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Vector store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Ingestion pipeline configuration
    #[serde(default)]
    pub ingestion: IngestionConfig,

    /// Retrieval configuration
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Conversation memory configuration
    #[serde(default)]
    pub conversation: ConversationConfig,

    /// Repository registry and URL validation configuration
    #[serde(default)]
    pub registry: RegistryConfig,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Source access configuration (hosts, tokens, crawl bounds)
    #[serde(default)]
    pub sources: SourcesConfig,
}

/// Language model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Chat endpoint base URL (Ollama-compatible)
    pub base_url: String,

    /// Model for chat completion
    pub chat_model: String,

    /// Maximum tokens for generation
    pub max_tokens: u32,

    /// Temperature for generation
    pub temperature: f32,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

/// Embedding provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Embedding endpoint base URL
    pub base_url: String,

    /// Model for embeddings
    pub model: String,

    /// Fixed embedding dimension for the deployment
    pub dimension: usize,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

/// Vector store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database URL (for the SQLite store)
    pub database_url: String,

    /// Fixed vector dimension; must match the embedder
    pub dimension: usize,
}

/// Ingestion pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    /// Target chunk size in characters
    pub chunk_size: usize,

    /// Overlap between consecutive chunks in characters
    pub chunk_overlap: usize,

    /// Chunks shorter than this are dropped unless they are the only chunk
    pub min_chunk_size: usize,

    /// Documents longer than this are pre-split into sections
    pub pre_split_threshold: usize,

    /// Chunking deadline per section in seconds
    pub chunk_timeout_secs: u64,

    /// Maximum declared file size in bytes
    pub max_file_bytes: u64,

    /// Maximum extracted content length in characters
    pub max_content_chars: usize,

    /// Texts per embedder call
    pub embed_batch_size: usize,

    /// Memory utilization above which the soft guard waits
    pub memory_soft_watermark: f32,

    /// Memory utilization at or above which documents are dropped
    pub memory_high_watermark: f32,

    /// Seconds to wait for memory to drop before skipping a document
    pub memory_wait_secs: u64,

    /// Seconds to wait for memory to drop before an embed batch
    pub batch_memory_wait_secs: u64,

    /// Poll interval while waiting on memory, in milliseconds
    pub memory_poll_interval_ms: u64,

    /// Maximum attempts for transient fetch failures
    pub max_fetch_attempts: u32,

    /// Base backoff delay in milliseconds
    pub backoff_base_ms: u64,

    /// Backoff cap in milliseconds
    pub backoff_cap_ms: u64,
}

/// Retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Candidates requested from the vector store
    pub top_k_raw: usize,

    /// Results kept after filtering
    pub top_k: usize,

    /// Minimum similarity score for the primary result set
    pub relevance_threshold: f32,

    /// Repository substrings excluded from retrieval (case-insensitive)
    #[serde(default)]
    pub blocked_repositories: Vec<String>,
}

/// Conversation memory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Maximum retained messages before summarization
    pub max_messages: usize,

    /// Estimated token budget for the retained history
    pub max_history_tokens: usize,

    /// Enable LLM-assisted summarization
    pub summarization_enabled: bool,

    /// Retries for a failed summarization call
    pub max_summarization_retries: u32,
}

/// Repository registry and URL validation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Host for canonical repository URLs
    pub host: String,

    /// Canonical owner for catalogued components
    pub canonical_owner: String,

    /// Component name to repository name catalogue
    #[serde(default)]
    pub components: HashMap<String, String>,

    /// Domains trusted without a reachability probe
    #[serde(default)]
    pub trusted_domains: Vec<String>,

    /// Reachability probe timeout in seconds
    pub probe_timeout_secs: u64,

    /// Reachability cache TTL in seconds
    pub cache_ttl_secs: u64,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    pub bind: String,
}

/// Source access configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    /// Git hosting API base URL (GitHub-compatible)
    pub api_base_url: String,

    /// Git hosting web base URL, used to build document links
    pub web_base_url: String,

    /// API token for private repositories and wikis
    pub api_token: Option<String>,

    /// Maximum declared blob size fetched from Git sources, in bytes
    pub max_file_bytes: u64,

    /// Maximum directory depth for the recursive tree walk fallback
    pub max_walk_depth: u32,

    /// Maximum files visited per recursive scan
    pub max_walk_files: usize,

    /// Delay between recursive walk calls in milliseconds
    pub walk_delay_ms: u64,

    /// Maximum BFS depth for wiki crawling
    pub max_crawl_depth: u32,

    /// Maximum pages per wiki crawl
    pub max_crawl_pages: usize,

    /// Maximum linked pages fetched per crawl; 0 means unlimited
    pub max_linked_pages: usize,

    /// Concurrency cap for linked-URL fan-out
    pub linked_fetch_concurrency: usize,

    /// Fetch timeout in seconds
    pub timeout_secs: u64,

    /// Maximum comment pages fetched per issue
    pub max_comment_pages: u32,
}

fn default_chunk_size() -> usize {
    1000
}

fn default_chunk_overlap() -> usize {
    200
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            chat_model: "llama3.2".to_string(),
            max_tokens: 4096,
            temperature: 0.2,
            timeout_secs: 120,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "nomic-embed-text".to_string(),
            dimension: 1536,
            timeout_secs: 60,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:docpilot.db".to_string(),
            dimension: 1536,
        }
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            min_chunk_size: 100,
            pre_split_threshold: 15_000,
            chunk_timeout_secs: 3,
            max_file_bytes: 5 * 1024 * 1024,
            max_content_chars: 100_000,
            embed_batch_size: 8,
            memory_soft_watermark: 0.85,
            memory_high_watermark: 0.90,
            memory_wait_secs: 30,
            batch_memory_wait_secs: 60,
            memory_poll_interval_ms: 500,
            max_fetch_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 30_000,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k_raw: 10,
            top_k: 3,
            relevance_threshold: 0.70,
            blocked_repositories: vec![],
        }
    }
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_messages: 20,
            max_history_tokens: 6_000,
            summarization_enabled: true,
            max_summarization_retries: 2,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            host: "github.com".to_string(),
            canonical_owner: "wso2".to_string(),
            components: HashMap::new(),
            trusted_domains: vec![],
            probe_timeout_secs: 5,
            cache_ttl_secs: 600,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.github.com".to_string(),
            web_base_url: "https://github.com".to_string(),
            api_token: None,
            max_file_bytes: 5 * 1024 * 1024,
            max_walk_depth: 10,
            max_walk_files: 500,
            walk_delay_ms: 100,
            max_crawl_depth: 3,
            max_crawl_pages: 100,
            max_linked_pages: 10,
            linked_fetch_concurrency: 5,
            timeout_secs: 30,
            max_comment_pages: 5,
        }
    }
}

impl AssistantConfig {
    /// Load configuration from a file
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        let config = match path.as_ref().extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            Some("toml") => toml::from_str(&content)?,
            Some("yaml") | Some("yml") => serde_yml::from_str(&content)?,
            _ => return Err(anyhow::anyhow!("Unsupported config file format")),
        };
        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file<P: AsRef<std::path::Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = match path.as_ref().extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::to_string_pretty(self)?,
            Some("toml") => toml::to_string(self)?,
            Some("yaml") | Some("yml") => serde_yml::to_string(self)?,
            _ => return Err(anyhow::anyhow!("Unsupported config file format")),
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply `DOCPILOT_*` environment overrides for endpoints, tokens,
    /// thresholds, and blocklists.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("DOCPILOT_LLM_URL") {
            self.llm.base_url = v;
        }
        if let Ok(v) = std::env::var("DOCPILOT_LLM_MODEL") {
            self.llm.chat_model = v;
        }
        if let Ok(v) = std::env::var("DOCPILOT_EMBEDDING_URL") {
            self.embedding.base_url = v;
        }
        if let Ok(v) = std::env::var("DOCPILOT_EMBEDDING_MODEL") {
            self.embedding.model = v;
        }
        if let Ok(v) = std::env::var("DOCPILOT_EMBEDDING_DIMENSION") {
            if let Ok(dim) = v.parse() {
                self.embedding.dimension = dim;
                self.store.dimension = dim;
            }
        }
        if let Ok(v) = std::env::var("DOCPILOT_DATABASE_URL") {
            self.store.database_url = v;
        }
        if let Ok(v) = std::env::var("DOCPILOT_API_TOKEN") {
            self.sources.api_token = Some(v);
        }
        if let Ok(v) = std::env::var("DOCPILOT_RELEVANCE_THRESHOLD") {
            if let Ok(t) = v.parse() {
                self.retrieval.relevance_threshold = t;
            }
        }
        if let Ok(v) = std::env::var("DOCPILOT_TOP_K") {
            if let Ok(k) = v.parse() {
                self.retrieval.top_k = k;
            }
        }
        if let Ok(v) = std::env::var("DOCPILOT_BLOCKED_REPOSITORIES") {
            self.retrieval.blocked_repositories = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(v) = std::env::var("DOCPILOT_TRUSTED_DOMAINS") {
            self.registry.trusted_domains = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(v) = std::env::var("DOCPILOT_BIND") {
            self.server.bind = v;
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.llm.base_url.starts_with("http") {
            return Err(anyhow::anyhow!("Invalid LLM URL: {}", self.llm.base_url));
        }

        if !self.embedding.base_url.starts_with("http") {
            return Err(anyhow::anyhow!(
                "Invalid embedding URL: {}",
                self.embedding.base_url
            ));
        }

        if self.llm.chat_model.is_empty() {
            return Err(anyhow::anyhow!("Chat model name cannot be empty"));
        }

        if self.embedding.model.is_empty() {
            return Err(anyhow::anyhow!("Embedding model name cannot be empty"));
        }

        if self.embedding.dimension == 0 {
            return Err(anyhow::anyhow!("Embedding dimension must be greater than 0"));
        }

        if self.embedding.dimension != self.store.dimension {
            return Err(anyhow::anyhow!(
                "Embedding dimension {} does not match store dimension {}",
                self.embedding.dimension,
                self.store.dimension
            ));
        }

        if !(0.0..=1.0).contains(&self.retrieval.relevance_threshold) {
            return Err(anyhow::anyhow!(
                "Relevance threshold must be between 0.0 and 1.0"
            ));
        }

        if self.ingestion.chunk_overlap >= self.ingestion.chunk_size {
            return Err(anyhow::anyhow!("Chunk overlap must be below chunk size"));
        }

        if self.ingestion.embed_batch_size == 0 {
            return Err(anyhow::anyhow!("Embed batch size must be greater than 0"));
        }

        if self.ingestion.memory_soft_watermark > self.ingestion.memory_high_watermark {
            return Err(anyhow::anyhow!(
                "Soft memory watermark cannot exceed the high watermark"
            ));
        }

        if self.conversation.max_messages == 0 {
            return Err(anyhow::anyhow!("Max messages must be greater than 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AssistantConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ingestion.chunk_size, 1000);
        assert_eq!(config.ingestion.chunk_overlap, 200);
        assert_eq!(config.retrieval.relevance_threshold, 0.70);
        assert_eq!(config.conversation.max_messages, 20);
    }

    #[test]
    fn test_config_validation() {
        let mut config = AssistantConfig::default();
        assert!(config.validate().is_ok());

        config.llm.base_url = "not-a-url".to_string();
        assert!(config.validate().is_err());

        config = AssistantConfig::default();
        config.store.dimension = 768;
        assert!(config.validate().is_err());

        config = AssistantConfig::default();
        config.ingestion.chunk_overlap = config.ingestion.chunk_size;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_blocklist_env_override() {
        let mut config = AssistantConfig::default();
        std::env::set_var("DOCPILOT_BLOCKED_REPOSITORIES", "blocked-org, other-org");
        config.apply_env();
        std::env::remove_var("DOCPILOT_BLOCKED_REPOSITORIES");

        assert_eq!(
            config.retrieval.blocked_repositories,
            vec!["blocked-org".to_string(), "other-org".to_string()]
        );
    }

    #[test]
    fn test_roundtrip_toml() {
        let config = AssistantConfig::default();
        let serialized = toml::to_string(&config).unwrap();
        let parsed: AssistantConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.ingestion.chunk_size, config.ingestion.chunk_size);
        assert_eq!(parsed.registry.host, config.registry.host);
    }
}
