//! Source enumeration and retrieval
//!
//! One fetcher per source kind, all behind the `SourceFetcher` trait and a
//! registry keyed by `SourceType`. Adding a source is a matter of
//! implementing the trait and registering it.

pub mod diagrams;
pub mod git;
pub mod issues;
pub mod wiki;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

pub use diagrams::{DiagramFetcher, DiagramPipeline, DiagramSummary};
pub use git::{GitFileFilter, GitTreeFetcher};
pub use issues::IssueFetcher;
pub use wiki::WikiFetcher;

/// Kind of a source document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    GitMarkdown,
    GitApiDef,
    WikiPage,
    LinkedPage,
    Issue,
    DiagramSummary,
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::GitMarkdown => "git_markdown",
            Self::GitApiDef => "git_api_def",
            Self::WikiPage => "wiki_page",
            Self::LinkedPage => "linked_page",
            Self::Issue => "issue",
            Self::DiagramSummary => "diagram_summary",
        };
        write!(f, "{name}")
    }
}

/// What to ingest; fields are interpreted per source kind
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SourceSpec {
    /// Repository owner (organization or user)
    #[serde(default)]
    pub owner: String,

    /// Repository name
    #[serde(default)]
    pub repository: String,

    /// Branch for Git listings; the repository default when absent
    #[serde(default)]
    pub branch: Option<String>,

    /// Root URL for public wiki crawls
    #[serde(default)]
    pub wiki_url: Option<String>,

    /// Clone the wiki with a token-bearing URL instead of crawling
    #[serde(default)]
    pub private_wiki: bool,

    /// Issue state filter (open, closed, all)
    #[serde(default)]
    pub state: Option<String>,

    /// Issue label filter
    #[serde(default)]
    pub labels: Vec<String>,

    /// Only issues updated after this instant
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,

    /// Image references handed to the diagram pipeline
    #[serde(default)]
    pub images: Vec<String>,
}

impl SourceSpec {
    pub fn repo(owner: impl Into<String>, repository: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repository: repository.into(),
            ..Default::default()
        }
    }
}

/// Reference to a document: path and sha, no bytes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRef {
    pub path: String,

    /// Content-derived sha when known at listing time; empty otherwise
    #[serde(default)]
    pub sha: String,

    /// Declared size in bytes when the source reports one
    #[serde(default)]
    pub size: Option<u64>,

    pub url: String,
}

/// A fetched document; destroyed after chunking
#[derive(Debug, Clone)]
pub struct RawDocument {
    /// Stable identity: all chunks of this document share it
    pub source_id: String,
    pub source_type: SourceType,
    pub path: String,
    pub raw_bytes: Vec<u8>,
    pub sha: String,
    pub fetched_at: DateTime<Utc>,
    pub repository: String,
    pub owner: String,
    pub url: String,
    /// Per-kind extras carried into chunk metadata
    pub extra: HashMap<String, String>,
}

impl RawDocument {
    /// The `repository` metadata value, `owner/name`
    pub fn qualified_repository(&self) -> String {
        if self.owner.is_empty() {
            self.repository.clone()
        } else {
            format!("{}/{}", self.owner, self.repository)
        }
    }
}

/// Stable document identity derived from the source kind and path
pub fn source_id_for(source_type: SourceType, owner: &str, repository: &str, path: &str) -> String {
    format!("{source_type}:{owner}/{repository}:{path}")
}

/// Trait for source fetchers
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// The kind of documents this fetcher produces
    fn source_type(&self) -> SourceType;

    /// Lazy enumeration of document references
    async fn list(&self, spec: &SourceSpec) -> Result<Vec<DocumentRef>>;

    /// Retrieve one document's bytes
    async fn fetch(&self, spec: &SourceSpec, doc: &DocumentRef) -> Result<RawDocument>;
}

/// Registry of fetchers keyed by source type
#[derive(Default, Clone)]
pub struct FetcherRegistry {
    fetchers: HashMap<SourceType, Arc<dyn SourceFetcher>>,
}

impl FetcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, fetcher: Arc<dyn SourceFetcher>) {
        self.fetchers.insert(fetcher.source_type(), fetcher);
    }

    pub fn get(&self, source_type: SourceType) -> Option<Arc<dyn SourceFetcher>> {
        self.fetchers.get(&source_type).cloned()
    }

    pub fn registered_types(&self) -> Vec<SourceType> {
        self.fetchers.keys().copied().collect()
    }
}
