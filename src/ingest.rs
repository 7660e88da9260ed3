//! Ingestion orchestration: fetch, dedup, chunk, embed, upsert
//!
//! Documents move through the pipeline one at a time under memory, size, and
//! rate limits. Per-document failures are recorded and never abort the
//! batch; a dimension mismatch is the one fatal exception.

use crate::chunker::{stable_chunk_id, ChunkPiece, TextChunker};
use crate::config::IngestionConfig;
use crate::embedding::Embedder;
use crate::error::{AssistantError, FetchError, Result};
use crate::extract::{extract, file_type_for_path};
use crate::memstat::MemoryProbe;
use crate::sources::{DocumentRef, FetcherRegistry, RawDocument, SourceSpec, SourceType};
use crate::store::{MetadataFilter, VectorRecord, VectorStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Per-request overrides for an ingest job
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IngestOptions {
    #[serde(default)]
    pub embed_batch_size: Option<usize>,
}

/// Outcome of one ingest job
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IngestReport {
    pub files_considered: usize,
    pub files_fetched: usize,
    pub files_skipped: usize,
    pub files_dropped_memory: usize,
    pub chunks_created: usize,
    pub vectors_upserted: usize,
    pub failed: Vec<FailedDocument>,
    pub status: IngestStatus,
}

/// A document that could not be ingested, with the reason
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedDocument {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    #[default]
    Completed,
    CompletedWithErrors,
}

/// Drives the ingest pipeline for one source spec at a time
pub struct IngestionOrchestrator {
    fetchers: FetcherRegistry,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    probe: Arc<dyn MemoryProbe>,
    chunker: TextChunker,
    config: IngestionConfig,
}

impl IngestionOrchestrator {
    pub fn new(
        fetchers: FetcherRegistry,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        probe: Arc<dyn MemoryProbe>,
        config: IngestionConfig,
    ) -> Self {
        Self {
            fetchers,
            embedder,
            store,
            probe,
            chunker: TextChunker::from_config(&config),
            config,
        }
    }

    /// Run one ingest job.
    ///
    /// Returns a partial report with `completed_with_errors` when individual
    /// documents fail; only configuration problems and dimension mismatches
    /// surface as errors.
    pub async fn ingest(
        &self,
        source_type: SourceType,
        spec: &SourceSpec,
        options: &IngestOptions,
        cancel: &CancellationToken,
    ) -> Result<IngestReport> {
        let fetcher = self.fetchers.get(source_type).ok_or_else(|| {
            AssistantError::Config(format!("no fetcher registered for {source_type}"))
        })?;

        let batch_size = options
            .embed_batch_size
            .unwrap_or(self.config.embed_batch_size)
            .max(1);

        let mut report = IngestReport::default();

        let refs = self
            .with_retry(|| fetcher.list(spec), cancel)
            .await?;
        info!("Ingesting {} documents from {}", refs.len(), source_type);

        for doc_ref in &refs {
            if cancel.is_cancelled() {
                info!("Ingest cancelled after {} documents", report.files_considered);
                break;
            }

            report.files_considered += 1;

            // Memory guard: above the high watermark the document is dropped
            // after a bounded wait for utilization to fall.
            let utilization = self
                .wait_for_memory_below(
                    self.config.memory_high_watermark,
                    Duration::from_secs(self.config.memory_wait_secs),
                )
                .await;
            if utilization >= self.config.memory_high_watermark {
                warn!(
                    "Dropping {} at {:.1}% memory utilization",
                    doc_ref.path,
                    utilization * 100.0
                );
                report.files_dropped_memory += 1;
                continue;
            }

            if let Some(size) = doc_ref.size {
                if size > self.config.max_file_bytes {
                    debug!("Skipping oversized {} ({} bytes)", doc_ref.path, size);
                    report.files_skipped += 1;
                    continue;
                }
            }

            match self
                .ingest_document(fetcher.as_ref(), spec, doc_ref, batch_size, cancel, &mut report)
                .await
            {
                Ok(()) => {}
                Err(err) if err.is_dimension_mismatch() => {
                    // Fatal: ingestion stops until an operator resolves dimensions.
                    error!(
                        "Dimension mismatch while ingesting {}: {}",
                        doc_ref.path, err
                    );
                    return Err(err);
                }
                Err(AssistantError::Cancelled) => break,
                Err(err) => {
                    warn!("Failed to ingest {}: {}", doc_ref.path, err);
                    report.failed.push(FailedDocument {
                        path: doc_ref.path.clone(),
                        reason: failure_reason(&err),
                    });
                }
            }
        }

        report.status = if report.failed.is_empty() {
            IngestStatus::Completed
        } else {
            IngestStatus::CompletedWithErrors
        };

        info!(
            "Ingest finished: {} considered, {} fetched, {} skipped, {} dropped, {} chunks, {} vectors, {} failed",
            report.files_considered,
            report.files_fetched,
            report.files_skipped,
            report.files_dropped_memory,
            report.chunks_created,
            report.vectors_upserted,
            report.failed.len()
        );
        Ok(report)
    }

    async fn ingest_document(
        &self,
        fetcher: &dyn crate::sources::SourceFetcher,
        spec: &SourceSpec,
        doc_ref: &DocumentRef,
        batch_size: usize,
        cancel: &CancellationToken,
        report: &mut IngestReport,
    ) -> Result<()> {
        // When the listing already carries a content sha the dedup check
        // happens before the fetch round-trip.
        let existing_sha = self.stored_sha_for(fetcher.source_type(), spec, &doc_ref.path).await?;
        if !doc_ref.sha.is_empty() {
            if let Some(stored) = &existing_sha {
                if *stored == doc_ref.sha {
                    debug!("Skipping unchanged {}", doc_ref.path);
                    report.files_skipped += 1;
                    return Ok(());
                }
            }
        }

        let document = match self
            .with_retry(|| fetcher.fetch(spec, doc_ref), cancel)
            .await
        {
            Ok(document) => document,
            Err(AssistantError::Fetch(FetchError::TooLarge { size, limit })) => {
                debug!(
                    "Skipping oversized {} ({} bytes over limit {})",
                    doc_ref.path, size, limit
                );
                report.files_skipped += 1;
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        report.files_fetched += 1;

        if let Some(stored) = &existing_sha {
            if *stored == document.sha {
                debug!("Skipping unchanged {} after fetch", document.path);
                report.files_skipped += 1;
                return Ok(());
            }
        }

        let content = extract(&document.raw_bytes, document.source_type);
        if content.chars().count() > self.config.max_content_chars {
            debug!(
                "Skipping {}: extracted content exceeds {} chars",
                document.path, self.config.max_content_chars
            );
            report.files_skipped += 1;
            return Ok(());
        }

        let pieces = self.chunker.chunk(&content)?;
        if pieces.is_empty() {
            debug!("No chunks produced for {}", document.path);
            return Ok(());
        }
        report.chunks_created += pieces.len();

        // Replace-per-file: stale vectors for this source go before new ones
        // arrive. The store need not be transactional across files.
        if existing_sha.is_some() {
            let filter = MetadataFilter::new().eq("source_id", document.source_id.clone());
            let removed = self.store.delete(&filter).await?;
            debug!("Replaced {} stale vectors of {}", removed, document.source_id);
        }

        let total_chunks = pieces.len();
        for batch in pieces.chunks(batch_size) {
            if cancel.is_cancelled() {
                return Err(AssistantError::Cancelled);
            }

            // Pre-batch memory check: the high watermark aborts the rest of
            // the document, the soft band waits for utilization to fall.
            let utilization = self.probe.utilization();
            if utilization >= self.config.memory_high_watermark {
                warn!(
                    "Aborting remaining chunks of {} at {:.1}% memory",
                    document.path,
                    utilization * 100.0
                );
                return Ok(());
            }
            if utilization >= self.config.memory_soft_watermark {
                self.wait_for_memory_below(
                    self.config.memory_soft_watermark,
                    Duration::from_secs(self.config.batch_memory_wait_secs),
                )
                .await;
            }

            let texts: Vec<String> = batch.iter().map(|piece| piece.text.clone()).collect();
            let vectors = self.with_retry(|| self.embedder.embed(&texts), cancel).await?;

            let records: Vec<VectorRecord> = batch
                .iter()
                .zip(vectors)
                .map(|(piece, vector)| self.to_record(&document, piece, total_chunks, vector))
                .collect();

            let upserted = self.store.upsert(records).await?;
            report.vectors_upserted += upserted;
            // Batch buffers drop here, keeping peak memory bounded.
        }

        Ok(())
    }

    /// Stored file sha for a source id, when any of its chunks exist
    async fn stored_sha_for(
        &self,
        source_type: SourceType,
        spec: &SourceSpec,
        path: &str,
    ) -> Result<Option<String>> {
        let source_id = crate::sources::source_id_for(source_type, &spec.owner, &spec.repository, path);
        let filter = MetadataFilter::new().eq("source_id", source_id);
        let existing = self.store.find(&filter, 1).await?;
        Ok(existing
            .into_iter()
            .next()
            .and_then(|record| record.metadata.get("file_sha").cloned()))
    }

    fn to_record(
        &self,
        document: &RawDocument,
        piece: &ChunkPiece,
        total_chunks: usize,
        vector: Vec<f32>,
    ) -> VectorRecord {
        let mut metadata: HashMap<String, String> = document.extra.clone();
        metadata.insert("source_id".to_string(), document.source_id.clone());
        metadata.insert("source_type".to_string(), document.source_type.to_string());
        metadata.insert("repository".to_string(), document.qualified_repository());
        metadata.insert("owner".to_string(), document.owner.clone());
        metadata.insert("path".to_string(), document.path.clone());
        metadata.insert(
            "file_type".to_string(),
            file_type_for_path(&document.path).to_string(),
        );
        metadata.insert("url".to_string(), document.url.clone());
        metadata.insert("file_sha".to_string(), document.sha.clone());
        metadata.insert("chunk_index".to_string(), piece.index.to_string());
        metadata.insert("total_chunks".to_string(), total_chunks.to_string());
        metadata.insert("start_char".to_string(), piece.start_char.to_string());
        metadata.insert("end_char".to_string(), piece.end_char.to_string());

        VectorRecord {
            id: stable_chunk_id(&document.source_id, &document.sha, piece.index),
            vector,
            content: piece.text.clone(),
            metadata,
        }
    }

    /// Retry a retryable operation with exponential backoff, honoring any
    /// server-advised delay.
    async fn with_retry<T, F, Fut>(&self, operation: F, cancel: &CancellationToken) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if !err.is_retryable() || attempt >= self.config.max_fetch_attempts {
                        return Err(err);
                    }

                    let backoff = Duration::from_millis(
                        (self.config.backoff_base_ms * 2u64.pow(attempt - 1))
                            .min(self.config.backoff_cap_ms),
                    );
                    let delay = err.advised_delay().unwrap_or(backoff);
                    debug!(
                        "Attempt {} failed ({}), retrying in {:?}",
                        attempt, err, delay
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(AssistantError::Cancelled),
                    }
                }
            }
        }
    }

    /// Poll the probe until utilization falls below the threshold or the
    /// budget runs out; returns the last sampled value.
    async fn wait_for_memory_below(&self, threshold: f32, budget: Duration) -> f32 {
        let mut utilization = self.probe.utilization();
        if utilization < threshold {
            return utilization;
        }

        let deadline = tokio::time::Instant::now() + budget;
        let interval = Duration::from_millis(self.config.memory_poll_interval_ms.max(1));

        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(interval.min(deadline - tokio::time::Instant::now())).await;
            utilization = self.probe.utilization();
            if utilization < threshold {
                return utilization;
            }
        }

        utilization
    }
}

fn failure_reason(err: &AssistantError) -> String {
    match err {
        AssistantError::Chunk(_) => "chunking_timeout".to_string(),
        AssistantError::Fetch(FetchError::NotFound(_)) => "not_found".to_string(),
        AssistantError::Fetch(FetchError::AuthRequired(_)) => "auth_required".to_string(),
        AssistantError::Fetch(FetchError::Malformed(_)) => "malformed".to_string(),
        AssistantError::Fetch(FetchError::RateLimited { .. }) => "rate_limited".to_string(),
        other => format!("{}: {}", other.category(), other),
    }
}
