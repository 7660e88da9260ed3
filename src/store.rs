//! Vector store interface and SQLite-backed implementation

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, info};

/// A record keyed by a stable chunk id
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub content: String,
    pub metadata: HashMap<String, String>,
}

/// A scored query result
#[derive(Debug, Clone)]
pub struct QueryMatch {
    pub id: String,
    pub score: f32,
    pub content: String,
    pub metadata: HashMap<String, String>,
}

/// Conjunction of metadata equality clauses
#[derive(Debug, Clone, Default)]
pub struct MetadataFilter {
    clauses: Vec<(String, String)>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.clauses.push((key.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn matches(&self, metadata: &HashMap<String, String>) -> bool {
        self.clauses
            .iter()
            .all(|(key, value)| metadata.get(key).map(|v| v == value).unwrap_or(false))
    }
}

/// Trait for vector stores
///
/// A successfully acknowledged upsert must be visible to subsequent queries
/// within bounded time; the store owns its consistency beyond that.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace records by id
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<usize>;

    /// Search for the most similar records
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<QueryMatch>>;

    /// Fetch records by metadata alone
    async fn find(&self, filter: &MetadataFilter, limit: usize) -> Result<Vec<VectorRecord>>;

    /// Delete all records matching the filter; returns the count removed
    async fn delete(&self, filter: &MetadataFilter) -> Result<u64>;

    /// Total record count
    async fn count(&self) -> Result<usize>;

    /// Cheap liveness probe for health reporting
    async fn ping(&self) -> Result<()>;
}

/// SQLite-backed vector store with brute-force cosine search
pub struct SqliteVectorStore {
    pool: SqlitePool,
    config: StoreConfig,
}

impl SqliteVectorStore {
    /// Connect and run the schema
    pub async fn connect(config: StoreConfig) -> Result<Self> {
        info!("Initializing SQLite vector store at {}", config.database_url);

        let options = SqliteConnectOptions::from_str(&config.database_url)
            .map_err(|e| StoreError::Transient(e.to_string()))?
            .create_if_missing(true);

        // An in-memory database exists per connection; keep a single one.
        let max_connections = if config.database_url.contains(":memory:") {
            1
        } else {
            5
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vectors (
                id TEXT PRIMARY KEY,
                embedding BLOB NOT NULL,
                content TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                source_id TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_vectors_source_id ON vectors(source_id)")
            .execute(&pool)
            .await?;

        Ok(Self { pool, config })
    }

    /// Calculate cosine similarity between two vectors
    pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() {
            return 0.0;
        }

        let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }

        dot_product / (norm_a * norm_b)
    }

    /// Serialize embedding for storage
    pub fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
        embedding
            .iter()
            .flat_map(|f| f.to_le_bytes().to_vec())
            .collect()
    }

    /// Deserialize embedding from storage
    pub fn deserialize_embedding(data: &[u8]) -> Vec<f32> {
        data.chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.config.dimension {
            return Err(StoreError::DimensionMismatch {
                expected: self.config.dimension,
                actual: vector.len(),
            }
            .into());
        }
        Ok(())
    }

    fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<VectorRecord> {
        let id: String = row.get("id");
        let embedding_blob: Vec<u8> = row.get("embedding");
        let content: String = row.get("content");
        let metadata_json: String = row.get("metadata");

        Ok(VectorRecord {
            id,
            vector: Self::deserialize_embedding(&embedding_blob),
            content,
            metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
        })
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<usize> {
        let count = records.len();

        for record in records {
            self.check_dimension(&record.vector)?;

            let embedding_blob = Self::serialize_embedding(&record.vector);
            let metadata_json = serde_json::to_string(&record.metadata)?;
            let source_id = record
                .metadata
                .get("source_id")
                .cloned()
                .unwrap_or_default();

            sqlx::query(
                r#"
                INSERT OR REPLACE INTO vectors (id, embedding, content, metadata, source_id, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )
            .bind(&record.id)
            .bind(&embedding_blob)
            .bind(&record.content)
            .bind(&metadata_json)
            .bind(&source_id)
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        }

        debug!("Upserted {} vector records", count);
        Ok(count)
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<QueryMatch>> {
        self.check_dimension(vector)?;

        if top_k == 0 {
            return Ok(vec![]);
        }

        // Brute-force scan; the corpus is bounded by ingestion limits.
        let rows = sqlx::query("SELECT * FROM vectors").fetch_all(&self.pool).await?;

        let mut results = Vec::new();
        for row in &rows {
            let record = Self::record_from_row(row)?;

            if let Some(filter) = filter {
                if !filter.matches(&record.metadata) {
                    continue;
                }
            }

            let score = Self::cosine_similarity(vector, &record.vector);
            results.push(QueryMatch {
                id: record.id,
                score,
                content: record.content,
                metadata: record.metadata,
            });
        }

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(top_k);

        debug!("Query returned {} matches", results.len());
        Ok(results)
    }

    async fn find(&self, filter: &MetadataFilter, limit: usize) -> Result<Vec<VectorRecord>> {
        if filter.is_empty() {
            return Err(StoreError::InvalidFilter(
                "find requires at least one clause".to_string(),
            )
            .into());
        }
        if limit == 0 {
            return Ok(vec![]);
        }

        let rows = sqlx::query("SELECT * FROM vectors").fetch_all(&self.pool).await?;

        let mut records = Vec::new();
        for row in &rows {
            let record = Self::record_from_row(row)?;
            if filter.matches(&record.metadata) {
                records.push(record);
                if records.len() >= limit {
                    break;
                }
            }
        }

        Ok(records)
    }

    async fn delete(&self, filter: &MetadataFilter) -> Result<u64> {
        if filter.is_empty() {
            return Err(StoreError::InvalidFilter(
                "refusing to delete with an empty filter".to_string(),
            )
            .into());
        }

        let rows = sqlx::query("SELECT id, metadata FROM vectors")
            .fetch_all(&self.pool)
            .await?;

        let mut deleted = 0u64;
        for row in &rows {
            let id: String = row.get("id");
            let metadata_json: String = row.get("metadata");
            let metadata: HashMap<String, String> =
                serde_json::from_str(&metadata_json).unwrap_or_default();

            if filter.matches(&metadata) {
                sqlx::query("DELETE FROM vectors WHERE id = ?1")
                    .bind(&id)
                    .execute(&self.pool)
                    .await?;
                deleted += 1;
            }
        }

        debug!("Deleted {} vector records", deleted);
        Ok(deleted)
    }

    async fn count(&self) -> Result<usize> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM vectors")
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.get("count");
        Ok(count as usize)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
