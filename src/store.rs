use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use uuid::Uuid;

use crate::error::{RagError, Result};

/// Document identity and metadata as persisted in the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub file_hash: String,
    pub file_path: String,
    pub file_name: String,
    pub title: Option<String>,
    pub author: Option<String>,
    pub subject: Option<String>,
    pub keywords: Option<String>,
    pub creator: Option<String>,
    pub producer: Option<String>,
    pub page_count: i32,
}

/// One chunk ready for persistence: its text, embedding, content hash
/// and the page the chunk starts on.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub text: String,
    pub vector: Vec<f32>,
    pub hash: u64,
    pub page: i32,
}

/// A similarity hit from the store's own vector search.
#[derive(Debug, Clone)]
pub struct SimilarMatch {
    pub text: String,
    pub similarity: f32,
    pub hash: u64,
}

/// A retrieved chunk with its provenance, as handed to the chat layer
/// and surfaced in results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextChunk {
    pub text: String,
    pub similarity: f32,
    pub hash: u64,
    pub file_path: String,
    pub file_name: String,
    pub title: Option<String>,
    pub author: Option<String>,
    pub page_count: i32,
    pub page_number: i32,
}

/// The persistence capability the pipeline needs, described by its
/// operations. The production implementation is [`RelationalStore`];
/// tests substitute an in-memory one.
#[async_trait]
pub trait Store: Send + Sync {
    /// Creates extensions, tables, indexes and triggers idempotently.
    async fn initialize(&self) -> Result<()>;

    /// Inserts a document by file hash, or updates every column except
    /// the surrogate id and creation time when the hash already exists.
    async fn upsert_document(&self, meta: &DocumentMeta) -> Result<Uuid>;

    /// Persists chunks for the document identified by `file_hash` in a
    /// single transaction. Rows whose embedding hash already exists
    /// are left untouched. Returns the last inserted surrogate id, or
    /// -1 when nothing was inserted.
    async fn save_chunks(&self, file_hash: &str, records: &[ChunkRecord]) -> Result<i64>;

    /// Resolves chunk text plus joined document columns for each hash
    /// that has a stored row.
    async fn chunks_by_hashes(&self, hashes: &[u64]) -> Result<HashMap<u64, ContextChunk>>;

    /// Top-k rows by cosine similarity against the query vector,
    /// descending.
    async fn search_similar(&self, query: &[f32], k: usize) -> Result<Vec<SimilarMatch>>;

    /// Removes the chunks of one document, keeping the document row.
    /// Used before re-ingesting so stale embeddings never linger.
    async fn delete_chunks_by_file_hash(&self, file_hash: &str) -> Result<u64>;

    /// Removes the document row; chunk rows follow via cascade.
    /// Returns whether a document existed.
    async fn delete_document(&self, file_hash: &str) -> Result<bool>;

    /// Releases any backing connections. Further operations may fail.
    async fn close(&self) {}
}

/// Renders a pgvector literal like `[0.1,0.2,0.3]`.
fn vector_literal(vector: &[f32]) -> String {
    let mut out = String::with_capacity(vector.len() * 10 + 2);
    out.push('[');
    for (i, v) in vector.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&v.to_string());
    }
    out.push(']');
    out
}

/// Embedding hashes are u64; Postgres has no unsigned 64-bit column,
/// so they travel as decimal strings.
fn hash_to_db(hash: u64) -> String {
    hash.to_string()
}

fn hash_from_db(s: &str) -> Result<u64> {
    s.parse()
        .map_err(|_| RagError::Parse(format!("invalid embedding hash in store: {s:?}")))
}

/// Postgres-backed store using the pgvector extension for similarity
/// search. Connections are shared through the driver's pool; each
/// logical operation holds at most one connection for its duration.
pub struct RelationalStore {
    pool: PgPool,
    dimension: usize,
}

impl RelationalStore {
    pub async fn connect(conn_string: &str, pool_size: u32, dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(RagError::Config(
                "embedding dimension must be positive".into(),
            ));
        }
        let pool = PgPoolOptions::new()
            .max_connections(pool_size)
            .connect(conn_string)
            .await?;
        Ok(Self { pool, dimension })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(RagError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Store for RelationalStore {
    async fn initialize(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id UUID PRIMARY KEY,
                file_hash TEXT UNIQUE NOT NULL,
                file_path TEXT NOT NULL,
                file_name TEXT NOT NULL,
                title TEXT,
                author TEXT,
                subject TEXT,
                keywords TEXT,
                creator TEXT,
                producer TEXT,
                page_count INT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE OR REPLACE FUNCTION documents_touch_updated_at() RETURNS trigger AS $$
            BEGIN
                NEW.updated_at = now();
                RETURN NEW;
            END;
            $$ LANGUAGE plpgsql
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("DROP TRIGGER IF EXISTS documents_updated_at ON documents")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "CREATE TRIGGER documents_updated_at BEFORE UPDATE ON documents \
             FOR EACH ROW EXECUTE FUNCTION documents_touch_updated_at()",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS embeddings (
                id BIGSERIAL PRIMARY KEY,
                document_id UUID NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
                chunk_text TEXT NOT NULL,
                embedding_hash TEXT UNIQUE NOT NULL,
                embedding vector({dimension}) NOT NULL,
                chunk_page_num INT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
            dimension = self.dimension
        ))
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS embeddings_vector_idx ON embeddings \
             USING ivfflat (embedding vector_cosine_ops) WITH (lists = 100)",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::info!(dimension = self.dimension, "relational store initialized");
        Ok(())
    }

    async fn upsert_document(&self, meta: &DocumentMeta) -> Result<Uuid> {
        let row = sqlx::query(
            r#"
            INSERT INTO documents
                (id, file_hash, file_path, file_name, title, author, subject,
                 keywords, creator, producer, page_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (file_hash) DO UPDATE SET
                file_path = EXCLUDED.file_path,
                file_name = EXCLUDED.file_name,
                title = EXCLUDED.title,
                author = EXCLUDED.author,
                subject = EXCLUDED.subject,
                keywords = EXCLUDED.keywords,
                creator = EXCLUDED.creator,
                producer = EXCLUDED.producer,
                page_count = EXCLUDED.page_count
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&meta.file_hash)
        .bind(&meta.file_path)
        .bind(&meta.file_name)
        .bind(&meta.title)
        .bind(&meta.author)
        .bind(&meta.subject)
        .bind(&meta.keywords)
        .bind(&meta.creator)
        .bind(&meta.producer)
        .bind(meta.page_count)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("id")?)
    }

    async fn save_chunks(&self, file_hash: &str, records: &[ChunkRecord]) -> Result<i64> {
        for record in records {
            self.check_dimension(&record.vector)?;
        }

        let mut tx = self.pool.begin().await?;

        let document_id: Uuid = sqlx::query("SELECT id FROM documents WHERE file_hash = $1")
            .bind(file_hash)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| RagError::NotFound(format!("document with hash {file_hash}")))?
            .try_get("id")?;

        let mut last_id = -1i64;
        for record in records {
            let inserted = sqlx::query(
                r#"
                INSERT INTO embeddings
                    (document_id, chunk_text, embedding_hash, embedding, chunk_page_num)
                VALUES ($1, $2, $3, $4::vector, $5)
                ON CONFLICT (embedding_hash) DO NOTHING
                RETURNING id
                "#,
            )
            .bind(document_id)
            .bind(&record.text)
            .bind(hash_to_db(record.hash))
            .bind(vector_literal(&record.vector))
            .bind(record.page)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(row) = inserted {
                last_id = row.try_get("id")?;
            }
        }

        tx.commit().await?;
        Ok(last_id)
    }

    async fn chunks_by_hashes(&self, hashes: &[u64]) -> Result<HashMap<u64, ContextChunk>> {
        if hashes.is_empty() {
            return Ok(HashMap::new());
        }
        let hash_strings: Vec<String> = hashes.iter().copied().map(hash_to_db).collect();

        let rows = sqlx::query(
            r#"
            SELECT e.chunk_text, e.embedding_hash, e.chunk_page_num,
                   d.file_path, d.file_name, d.title, d.author, d.page_count
            FROM embeddings e
            JOIN documents d ON d.id = e.document_id
            WHERE e.embedding_hash = ANY($1)
            "#,
        )
        .bind(&hash_strings)
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let hash = hash_from_db(row.try_get::<String, _>("embedding_hash")?.as_str())?;
            out.insert(
                hash,
                ContextChunk {
                    text: row.try_get("chunk_text")?,
                    similarity: 0.0,
                    hash,
                    file_path: row.try_get("file_path")?,
                    file_name: row.try_get("file_name")?,
                    title: row.try_get("title")?,
                    author: row.try_get("author")?,
                    page_count: row.try_get::<Option<i32>, _>("page_count")?.unwrap_or(0),
                    page_number: row.try_get("chunk_page_num")?,
                },
            );
        }
        Ok(out)
    }

    async fn search_similar(&self, query: &[f32], k: usize) -> Result<Vec<SimilarMatch>> {
        self.check_dimension(query)?;
        let literal = vector_literal(query);

        let rows = sqlx::query(
            r#"
            SELECT chunk_text, embedding_hash,
                   1 - (embedding <=> $1::vector) AS similarity
            FROM embeddings
            ORDER BY embedding <=> $1::vector
            LIMIT $2
            "#,
        )
        .bind(&literal)
        .bind(k as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(SimilarMatch {
                text: row.try_get("chunk_text")?,
                similarity: row.try_get::<f64, _>("similarity")? as f32,
                hash: hash_from_db(row.try_get::<String, _>("embedding_hash")?.as_str())?,
            });
        }
        Ok(out)
    }

    async fn delete_chunks_by_file_hash(&self, file_hash: &str) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM embeddings WHERE document_id = \
             (SELECT id FROM documents WHERE file_hash = $1)",
        )
        .bind(file_hash)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_document(&self, file_hash: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE file_hash = $1")
            .bind(file_hash)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
