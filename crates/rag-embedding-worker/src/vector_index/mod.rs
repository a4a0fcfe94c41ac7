pub mod pool;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::Row;

use crate::core::Payload;
use crate::error::WorkerError;

pub use pool::DbPool;

/// A single point to upsert: deterministic id, embedding vector, and the
/// tagged payload the retrieval engine reads back.
#[derive(Debug, Clone)]
pub struct Point {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: Payload,
}

/// One `must` clause of a filter expression: `payload[key] == value`.
#[derive(Debug, Clone)]
pub struct FilterCondition {
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub must: Vec<FilterCondition>,
}

impl Filter {
    pub fn eq(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            must: vec![FilterCondition {
                key: key.into(),
                value: value.into(),
            }],
        }
    }

    pub fn and(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.must.push(FilterCondition {
            key: key.into(),
            value: value.into(),
        });
        self
    }
}

#[derive(Debug, Clone)]
pub struct SearchMatch {
    pub id: String,
    pub score: f32,
    pub payload: Payload,
}

#[derive(Debug, Clone, Copy)]
pub struct CollectionInfo {
    pub dimension: usize,
    pub point_count: i64,
}

/// Abstract vector index operations: upsert points, delete by filter,
/// ensure a collection exists at a given dimension, and search top-k with
/// an optional payload filter. The pipeline and retrieval engine depend
/// only on this trait, never on `sqlx`/`pgvector` directly.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn ensure_collection(&self, dim: usize) -> Result<(), WorkerError>;
    async fn drop_collection(&self) -> Result<(), WorkerError>;
    async fn upsert(&self, points: Vec<Point>) -> Result<(), WorkerError>;
    async fn delete_by_filter(&self, filter: Filter) -> Result<u64, WorkerError>;
    async fn search(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<Filter>,
    ) -> Result<Vec<SearchMatch>, WorkerError>;
    async fn collection_info(&self) -> Result<CollectionInfo, WorkerError>;
}

/// Postgres + pgvector backed implementation. One table per collection,
/// `id text primary key`, `embedding vector(dim)`, `payload jsonb`.
pub struct PgVectorIndex {
    pool: DbPool,
    collection: String,
}

impl PgVectorIndex {
    pub fn new(pool: DbPool, collection: String) -> Self {
        Self { pool, collection }
    }

    /// Table name is taken verbatim from configuration (not user input),
    /// so simple interpolation is safe here; every value that *is* user-
    /// or payload-derived goes through a bound parameter below.
    fn table(&self) -> &str {
        &self.collection
    }

    fn where_clause(&self, filter: &Filter, param_offset: usize) -> (String, Vec<String>) {
        if filter.must.is_empty() {
            return (String::new(), Vec::new());
        }
        let mut clauses = Vec::new();
        let mut params = Vec::new();
        for (i, cond) in filter.must.iter().enumerate() {
            let placeholder = format!("${}", param_offset + i + 1);
            let value = match &cond.value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            clauses.push(format!("payload->>'{}' = {placeholder}", cond.key));
            params.push(value);
        }
        (format!(" WHERE {}", clauses.join(" AND ")), params)
    }
}

#[async_trait]
impl VectorIndex for PgVectorIndex {
    async fn ensure_collection(&self, dim: usize) -> Result<(), WorkerError> {
        sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
            .execute(self.pool.get_pool())
            .await
            .map_err(|e| WorkerError::VectorIndexError(e.to_string()))?;

        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
                id TEXT PRIMARY KEY, \
                embedding vector({dim}) NOT NULL, \
                payload JSONB NOT NULL\
             )",
            table = self.table(),
        );
        sqlx::query(&ddl)
            .execute(self.pool.get_pool())
            .await
            .map_err(|e| WorkerError::VectorIndexError(e.to_string()))?;

        let idx = format!(
            "CREATE INDEX IF NOT EXISTS {table}_embedding_idx ON {table} \
             USING ivfflat (embedding vector_cosine_ops) WITH (lists = 100)",
            table = self.table(),
        );
        sqlx::query(&idx)
            .execute(self.pool.get_pool())
            .await
            .map_err(|e| WorkerError::VectorIndexError(e.to_string()))?;

        Ok(())
    }

    async fn drop_collection(&self) -> Result<(), WorkerError> {
        let ddl = format!("DROP TABLE IF EXISTS {}", self.table());
        sqlx::query(&ddl)
            .execute(self.pool.get_pool())
            .await
            .map_err(|e| WorkerError::VectorIndexError(e.to_string()))?;
        Ok(())
    }

    async fn upsert(&self, points: Vec<Point>) -> Result<(), WorkerError> {
        if points.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "INSERT INTO {table} (id, embedding, payload) VALUES ($1, $2, $3) \
             ON CONFLICT (id) DO UPDATE SET embedding = EXCLUDED.embedding, payload = EXCLUDED.payload",
            table = self.table(),
        );
        for point in points {
            let vector = pgvector::Vector::from(point.vector);
            let payload = serde_json::to_value(&point.payload)
                .map_err(|e| WorkerError::VectorIndexError(format!("serializing payload: {e}")))?;
            sqlx::query(&sql)
                .bind(&point.id)
                .bind(vector)
                .bind(payload)
                .execute(self.pool.get_pool())
                .await
                .map_err(|e| WorkerError::VectorIndexError(e.to_string()))?;
        }
        Ok(())
    }

    async fn delete_by_filter(&self, filter: Filter) -> Result<u64, WorkerError> {
        let (where_sql, params) = self.where_clause(&filter, 0);
        if where_sql.is_empty() {
            return Err(WorkerError::VectorIndexError(
                "delete_by_filter refuses an unconditional delete".to_string(),
            ));
        }
        let sql = format!("DELETE FROM {}{}", self.table(), where_sql);
        let mut query = sqlx::query(&sql);
        for param in &params {
            query = query.bind(param);
        }
        let result = query
            .execute(self.pool.get_pool())
            .await
            .map_err(|e| WorkerError::VectorIndexError(e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn search(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<Filter>,
    ) -> Result<Vec<SearchMatch>, WorkerError> {
        let filter = filter.unwrap_or_default();
        let (where_sql, params) = self.where_clause(&filter, 1);
        let sql = format!(
            "SELECT id, payload, 1 - (embedding <=> $1) AS score FROM {table}{where_sql} \
             ORDER BY embedding <=> $1 LIMIT {k}",
            table = self.table(),
        );
        let pg_vector = pgvector::Vector::from(vector.to_vec());
        let mut query = sqlx::query(&sql).bind(pg_vector);
        for param in &params {
            query = query.bind(param);
        }
        let rows = query
            .fetch_all(self.pool.get_pool())
            .await
            .map_err(|e| WorkerError::VectorIndexError(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                let id: String = row.try_get("id").map_err(|e| WorkerError::VectorIndexError(e.to_string()))?;
                let score: f64 = row.try_get("score").map_err(|e| WorkerError::VectorIndexError(e.to_string()))?;
                let payload_json: serde_json::Value =
                    row.try_get("payload").map_err(|e| WorkerError::VectorIndexError(e.to_string()))?;
                let payload: Payload = serde_json::from_value(payload_json)
                    .map_err(|e| WorkerError::VectorIndexError(format!("decoding payload: {e}")))?;
                Ok(SearchMatch {
                    id,
                    score: score as f32,
                    payload,
                })
            })
            .collect()
    }

    async fn collection_info(&self) -> Result<CollectionInfo, WorkerError> {
        let dim_sql = format!(
            "SELECT atttypmod FROM pg_attribute \
             WHERE attrelid = '{table}'::regclass AND attname = 'embedding'",
            table = self.table(),
        );
        let dimension: i32 = sqlx::query_scalar(&dim_sql)
            .fetch_optional(self.pool.get_pool())
            .await
            .map_err(|e| WorkerError::VectorIndexError(e.to_string()))?
            .unwrap_or(0);

        let count_sql = format!("SELECT COUNT(*) FROM {}", self.table());
        let point_count: i64 = sqlx::query_scalar(&count_sql)
            .fetch_one(self.pool.get_pool())
            .await
            .map_err(|e| WorkerError::VectorIndexError(e.to_string()))?;

        Ok(CollectionInfo {
            dimension: dimension.max(0) as usize,
            point_count,
        })
    }
}
