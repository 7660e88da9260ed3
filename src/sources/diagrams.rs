//! Diagram summaries from an out-of-band image pipeline
//!
//! The OCR/graph extraction step lives outside this service; only its
//! per-image text summaries enter ingestion.

use super::{source_id_for, DocumentRef, RawDocument, SourceFetcher, SourceSpec, SourceType};
use crate::chunker::content_sha;
use crate::error::{FetchError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// A per-image text summary produced by the external pipeline
#[derive(Debug, Clone)]
pub struct DiagramSummary {
    /// Image name or path, unique within the source spec
    pub name: String,
    pub text: String,
    /// Link back to the image, when the pipeline knows one
    pub url: Option<String>,
}

/// Opaque image-to-text pipeline
#[async_trait]
pub trait DiagramPipeline: Send + Sync {
    async fn summarize(&self, spec: &SourceSpec) -> Result<Vec<DiagramSummary>>;
}

/// Fetcher adapting pipeline summaries into documents
pub struct DiagramFetcher {
    pipeline: std::sync::Arc<dyn DiagramPipeline>,
    cache: Mutex<HashMap<String, DiagramSummary>>,
}

impl DiagramFetcher {
    pub fn new(pipeline: std::sync::Arc<dyn DiagramPipeline>) -> Self {
        Self {
            pipeline,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SourceFetcher for DiagramFetcher {
    fn source_type(&self) -> SourceType {
        SourceType::DiagramSummary
    }

    async fn list(&self, spec: &SourceSpec) -> Result<Vec<DocumentRef>> {
        let summaries = self.pipeline.summarize(spec).await?;

        let mut cache = self.cache.lock().await;
        let refs = summaries
            .into_iter()
            .map(|summary| {
                let sha = content_sha(summary.text.as_bytes());
                let doc_ref = DocumentRef {
                    path: summary.name.clone(),
                    sha,
                    size: Some(summary.text.len() as u64),
                    url: summary.url.clone().unwrap_or_default(),
                };
                cache.insert(summary.name.clone(), summary);
                doc_ref
            })
            .collect();

        Ok(refs)
    }

    async fn fetch(&self, spec: &SourceSpec, doc: &DocumentRef) -> Result<RawDocument> {
        let summary = {
            let cache = self.cache.lock().await;
            cache.get(&doc.path).cloned()
        }
        .ok_or_else(|| FetchError::NotFound(doc.path.clone()))?;

        Ok(RawDocument {
            source_id: source_id_for(
                SourceType::DiagramSummary,
                &spec.owner,
                &spec.repository,
                &doc.path,
            ),
            source_type: SourceType::DiagramSummary,
            path: doc.path.clone(),
            raw_bytes: summary.text.into_bytes(),
            sha: doc.sha.clone(),
            fetched_at: chrono::Utc::now(),
            repository: spec.repository.clone(),
            owner: spec.owner.clone(),
            url: doc.url.clone(),
            extra: Default::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct StaticPipeline;

    #[async_trait]
    impl DiagramPipeline for StaticPipeline {
        async fn summarize(&self, _spec: &SourceSpec) -> Result<Vec<DiagramSummary>> {
            Ok(vec![DiagramSummary {
                name: "architecture.png".to_string(),
                text: "Gateway routes traffic to the Alpha service.".to_string(),
                url: Some("https://example.com/architecture.png".to_string()),
            }])
        }
    }

    #[tokio::test]
    async fn test_list_then_fetch() {
        let fetcher = DiagramFetcher::new(Arc::new(StaticPipeline));
        let spec = SourceSpec::repo("wso2", "docs");

        let refs = fetcher.list(&spec).await.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].path, "architecture.png");

        let doc = fetcher.fetch(&spec, &refs[0]).await.unwrap();
        assert_eq!(doc.source_type, SourceType::DiagramSummary);
        assert!(String::from_utf8_lossy(&doc.raw_bytes).contains("Gateway"));
    }

    #[tokio::test]
    async fn test_fetch_unknown_is_not_found() {
        let fetcher = DiagramFetcher::new(Arc::new(StaticPipeline));
        let spec = SourceSpec::repo("wso2", "docs");

        let doc_ref = DocumentRef {
            path: "missing.png".to_string(),
            sha: String::new(),
            size: None,
            url: String::new(),
        };
        let err = fetcher.fetch(&spec, &doc_ref).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::AssistantError::Fetch(FetchError::NotFound(_))
        ));
    }
}
