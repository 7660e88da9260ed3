//! Retrieval: query embedding, vector search, policy filtering, context assembly

use crate::config::RetrievalConfig;
use crate::embedding::Embedder;
use crate::error::Result;
use crate::store::{MetadataFilter, QueryMatch, VectorStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

const SNIPPET_CHARS: usize = 200;

/// A source citation for an answer, ordered by descending score
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub repository: String,
    pub path: String,
    pub url: String,
    pub score: f32,
    pub snippet: String,
}

/// Context text plus the citations backing it
#[derive(Debug, Clone, Default)]
pub struct RetrievedContext {
    pub context: String,
    pub citations: Vec<Citation>,
}

impl RetrievedContext {
    pub fn is_empty(&self) -> bool {
        self.citations.is_empty()
    }
}

/// Retrieval over the vector store
pub struct RetrievalService {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    config: RetrievalConfig,
}

impl RetrievalService {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            embedder,
            store,
            config,
        }
    }

    /// Retrieve context for a query.
    ///
    /// Candidates from blocked repositories never survive filtering. When no
    /// candidate clears the relevance threshold the top filtered candidates
    /// are used as a fallback rather than returning nothing.
    pub async fn retrieve(
        &self,
        query: &str,
        top_k: Option<usize>,
        filter: Option<&MetadataFilter>,
    ) -> Result<RetrievedContext> {
        let top_k = top_k.unwrap_or(self.config.top_k);
        if top_k == 0 {
            return Ok(RetrievedContext::default());
        }

        let vectors = self.embedder.embed(&[query.to_string()]).await?;
        let query_vector = vectors.into_iter().next().unwrap_or_default();

        let top_k_raw = self.config.top_k_raw.max(top_k);
        let candidates = self
            .store
            .query(&query_vector, top_k_raw, filter)
            .await?;
        debug!("Vector store returned {} candidates", candidates.len());

        let allowed: Vec<QueryMatch> = candidates
            .into_iter()
            .filter(|candidate| !self.is_blocked(candidate))
            .collect();

        let primary: Vec<&QueryMatch> = allowed
            .iter()
            .filter(|candidate| candidate.score >= self.config.relevance_threshold)
            .collect();

        let selected: Vec<&QueryMatch> = if !primary.is_empty() {
            primary.into_iter().take(top_k).collect()
        } else if !allowed.is_empty() {
            info!(
                "No candidate above threshold {}; falling back to top {}",
                self.config.relevance_threshold, top_k
            );
            allowed.iter().take(top_k).collect()
        } else {
            return Ok(RetrievedContext::default());
        };

        let context = selected
            .iter()
            .map(|candidate| candidate.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let citations = selected
            .iter()
            .map(|candidate| {
                let meta = |key: &str| candidate.metadata.get(key).cloned().unwrap_or_default();
                Citation {
                    repository: meta("repository"),
                    path: meta("path"),
                    url: meta("url"),
                    score: candidate.score,
                    snippet: snippet(&candidate.content),
                }
            })
            .collect();

        Ok(RetrievedContext { context, citations })
    }

    /// Case-insensitive substring match against the repository blocklist
    fn is_blocked(&self, candidate: &QueryMatch) -> bool {
        let repository = candidate
            .metadata
            .get("repository")
            .map(|r| r.to_lowercase())
            .unwrap_or_default();

        self.config
            .blocked_repositories
            .iter()
            .any(|pattern| repository.contains(&pattern.to_lowercase()))
    }
}

fn snippet(content: &str) -> String {
    if content.chars().count() <= SNIPPET_CHARS {
        return content.to_string();
    }
    let cut: String = content.chars().take(SNIPPET_CHARS).collect();
    format!("{cut}…")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::store::VectorRecord;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Embedder returning a constant unit vector
    struct ConstEmbedder;

    #[async_trait]
    impl Embedder for ConstEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
        fn dimension(&self) -> usize {
            2
        }
    }

    /// Store returning pre-seeded matches
    struct StaticStore {
        matches: Vec<QueryMatch>,
    }

    #[async_trait]
    impl VectorStore for StaticStore {
        async fn upsert(&self, _records: Vec<VectorRecord>) -> Result<usize> {
            Ok(0)
        }
        async fn query(
            &self,
            _vector: &[f32],
            top_k: usize,
            _filter: Option<&MetadataFilter>,
        ) -> Result<Vec<QueryMatch>> {
            let mut matches = self.matches.clone();
            matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
            matches.truncate(top_k);
            Ok(matches)
        }
        async fn find(
            &self,
            _filter: &MetadataFilter,
            _limit: usize,
        ) -> Result<Vec<VectorRecord>> {
            Ok(vec![])
        }
        async fn delete(&self, _filter: &MetadataFilter) -> Result<u64> {
            Ok(0)
        }
        async fn count(&self) -> Result<usize> {
            Ok(self.matches.len())
        }
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    fn candidate(id: &str, repository: &str, score: f32) -> QueryMatch {
        let mut metadata = HashMap::new();
        metadata.insert("repository".to_string(), repository.to_string());
        metadata.insert("path".to_string(), format!("{id}.md"));
        metadata.insert("url".to_string(), format!("https://github.com/{repository}"));
        QueryMatch {
            id: id.to_string(),
            score,
            content: format!("content of {id}"),
            metadata,
        }
    }

    fn service(matches: Vec<QueryMatch>, blocked: Vec<String>) -> RetrievalService {
        RetrievalService::new(
            Arc::new(ConstEmbedder),
            Arc::new(StaticStore { matches }),
            RetrievalConfig {
                blocked_repositories: blocked,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_blocklist_excludes_high_scoring_candidate() {
        let service = service(
            vec![
                candidate("a", "ORG/alpha", 0.8),
                candidate("b", "blocked-org/beta", 0.95),
            ],
            vec!["blocked-org".to_string()],
        );

        let retrieved = service.retrieve("question", None, None).await.unwrap();
        assert_eq!(retrieved.citations.len(), 1);
        assert_eq!(retrieved.citations[0].repository, "ORG/alpha");
    }

    #[tokio::test]
    async fn test_blocklist_is_case_insensitive() {
        let service = service(
            vec![candidate("b", "Blocked-Org/beta", 0.95)],
            vec!["blocked-org".to_string()],
        );
        let retrieved = service.retrieve("question", None, None).await.unwrap();
        assert!(retrieved.is_empty());
    }

    #[tokio::test]
    async fn test_threshold_fallback() {
        let service = service(
            vec![
                candidate("a", "ORG/alpha", 0.5),
                candidate("b", "ORG/beta", 0.4),
            ],
            vec![],
        );

        // Nothing clears 0.70, but filtered candidates exist: fall back.
        let retrieved = service.retrieve("question", None, None).await.unwrap();
        assert_eq!(retrieved.citations.len(), 2);
        assert_eq!(retrieved.citations[0].repository, "ORG/alpha");
    }

    #[tokio::test]
    async fn test_primary_set_truncates_to_top_k() {
        let service = service(
            vec![
                candidate("a", "ORG/a", 0.9),
                candidate("b", "ORG/b", 0.85),
                candidate("c", "ORG/c", 0.8),
                candidate("d", "ORG/d", 0.75),
            ],
            vec![],
        );

        let retrieved = service.retrieve("question", None, None).await.unwrap();
        assert_eq!(retrieved.citations.len(), 3);
        // Ordered by descending score.
        assert!(retrieved.citations[0].score >= retrieved.citations[1].score);
        assert!(retrieved.citations[1].score >= retrieved.citations[2].score);
    }

    #[tokio::test]
    async fn test_top_k_zero_returns_empty() {
        let service = service(vec![candidate("a", "ORG/alpha", 0.9)], vec![]);
        let retrieved = service.retrieve("question", Some(0), None).await.unwrap();
        assert!(retrieved.is_empty());
        assert!(retrieved.context.is_empty());
    }

    #[tokio::test]
    async fn test_empty_store_returns_empty() {
        let service = service(vec![], vec![]);
        let retrieved = service.retrieve("question", None, None).await.unwrap();
        assert!(retrieved.is_empty());
    }

    #[tokio::test]
    async fn test_context_joined_with_newline() {
        let service = service(
            vec![
                candidate("a", "ORG/a", 0.9),
                candidate("b", "ORG/b", 0.85),
            ],
            vec![],
        );
        let retrieved = service.retrieve("question", None, None).await.unwrap();
        assert_eq!(retrieved.context, "content of a\ncontent of b");
    }
}
