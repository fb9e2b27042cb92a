//! Shared test doubles: an in-memory store, deterministic inference
//! engines and a plain-text stand-in for the PDF reader.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use corpus_rag::engine::{
    ChatEngine, EmbeddingEngine, InferenceContext, Pooling, TokenBatch,
};
use corpus_rag::error::{RagError, Result};
use corpus_rag::pdf::{DocumentData, PdfMetadata, PdfReader};
use corpus_rag::store::{ChunkRecord, ContextChunk, DocumentMeta, SimilarMatch, Store};

/// Installs a test subscriber honoring RUST_LOG; later calls no-op.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .compact()
        .try_init();
}

pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[derive(Default)]
struct MemoryInner {
    documents: HashMap<String, (Uuid, DocumentMeta)>,
    chunks: HashMap<u64, (String, ChunkRecord)>,
    next_id: i64,
}

/// Embedded store variant used by the tests: the same operations as
/// the relational store, backed by maps.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn document_count(&self) -> usize {
        self.inner.lock().unwrap().documents.len()
    }

    pub fn chunk_count(&self) -> usize {
        self.inner.lock().unwrap().chunks.len()
    }

    pub fn chunk_hashes_for(&self, file_hash: &str) -> Vec<u64> {
        let inner = self.inner.lock().unwrap();
        inner
            .chunks
            .iter()
            .filter(|(_, (fh, _))| fh == file_hash)
            .map(|(hash, _)| *hash)
            .collect()
    }

    pub fn chunk_texts_for(&self, file_hash: &str) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .chunks
            .values()
            .filter(|(fh, _)| fh == file_hash)
            .map(|(_, record)| record.text.clone())
            .collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn upsert_document(&self, meta: &DocumentMeta) -> Result<Uuid> {
        let mut inner = self.inner.lock().unwrap();
        if let Some((id, stored)) = inner.documents.get_mut(&meta.file_hash) {
            let id = *id;
            *stored = meta.clone();
            return Ok(id);
        }
        let id = Uuid::new_v4();
        inner
            .documents
            .insert(meta.file_hash.clone(), (id, meta.clone()));
        Ok(id)
    }

    async fn save_chunks(&self, file_hash: &str, records: &[ChunkRecord]) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.documents.contains_key(file_hash) {
            return Err(RagError::NotFound(format!(
                "document with hash {file_hash}"
            )));
        }
        let mut last_id = -1;
        for record in records {
            if inner.chunks.contains_key(&record.hash) {
                continue;
            }
            inner.next_id += 1;
            last_id = inner.next_id;
            inner
                .chunks
                .insert(record.hash, (file_hash.to_string(), record.clone()));
        }
        Ok(last_id)
    }

    async fn chunks_by_hashes(&self, hashes: &[u64]) -> Result<HashMap<u64, ContextChunk>> {
        let inner = self.inner.lock().unwrap();
        let mut out = HashMap::new();
        for hash in hashes {
            let Some((file_hash, record)) = inner.chunks.get(hash) else {
                continue;
            };
            let Some((_, meta)) = inner.documents.get(file_hash) else {
                continue;
            };
            out.insert(
                *hash,
                ContextChunk {
                    text: record.text.clone(),
                    similarity: 0.0,
                    hash: *hash,
                    file_path: meta.file_path.clone(),
                    file_name: meta.file_name.clone(),
                    title: meta.title.clone(),
                    author: meta.author.clone(),
                    page_count: meta.page_count,
                    page_number: record.page,
                },
            );
        }
        Ok(out)
    }

    async fn search_similar(&self, query: &[f32], k: usize) -> Result<Vec<SimilarMatch>> {
        let inner = self.inner.lock().unwrap();
        let mut scored: Vec<SimilarMatch> = inner
            .chunks
            .iter()
            .map(|(hash, (_, record))| SimilarMatch {
                text: record.text.clone(),
                similarity: cosine(query, &record.vector),
                hash: *hash,
            })
            .collect();
        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn delete_chunks_by_file_hash(&self, file_hash: &str) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.chunks.len();
        inner.chunks.retain(|_, (fh, _)| fh != file_hash);
        Ok((before - inner.chunks.len()) as u64)
    }

    async fn delete_document(&self, file_hash: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let existed = inner.documents.remove(file_hash).is_some();
        if existed {
            inner.chunks.retain(|_, (fh, _)| fh != file_hash);
        }
        Ok(existed)
    }
}

pub struct NoopContext;

impl InferenceContext for NoopContext {
    fn clear_kv_cache(&mut self) {}
}

/// Deterministic embedding engine: a token's output row depends only
/// on the token value, so identical texts always embed identically.
pub struct HashEmbedEngine {
    pub dimension: usize,
}

impl HashEmbedEngine {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl EmbeddingEngine for HashEmbedEngine {
    fn new_context(&self) -> Result<Box<dyn InferenceContext>> {
        Ok(Box::new(NoopContext))
    }

    fn tokenize(&self, text: &str) -> Result<Vec<i32>> {
        Ok(text
            .split_whitespace()
            .map(|w| {
                w.bytes()
                    .fold(7i32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as i32))
            })
            .collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn token_budget(&self) -> usize {
        512
    }

    fn pooling(&self) -> Pooling {
        Pooling::Mean
    }

    fn decode(
        &self,
        _ctx: &mut dyn InferenceContext,
        batch: &TokenBatch,
    ) -> Result<Vec<Vec<f32>>> {
        let mut rows = Vec::with_capacity(batch.token_count());
        for seq in &batch.sequences {
            for &t in &seq.tokens {
                rows.push(
                    (0..self.dimension)
                        .map(|j| {
                            let x = (t as f32) * 0.001 + (j as f32 + 1.0);
                            (x.sin() + 1.5) * ((t.rem_euclid(13) + 1) as f32)
                        })
                        .collect(),
                );
            }
        }
        Ok(rows)
    }
}

/// Chat engine that answers with a fixed sentence mentioning its
/// generation budget, enough to assert the plumbing end to end.
pub struct CannedChatEngine;

impl ChatEngine for CannedChatEngine {
    fn new_context(&self) -> Result<Box<dyn InferenceContext>> {
        Ok(Box::new(NoopContext))
    }

    fn count_tokens(&self, prompt: &str) -> Result<usize> {
        Ok(prompt.split_whitespace().count())
    }

    fn context_window(&self) -> usize {
        4096
    }

    fn generate(
        &self,
        _ctx: &mut dyn InferenceContext,
        prompt: &str,
        max_tokens: usize,
    ) -> Result<String> {
        assert!(prompt.contains("<|assistant|>"));
        assert!(max_tokens > 0);
        Ok("Based on the provided context, the answer is 42.".to_string())
    }
}

/// Stands in for the PDF reader: the "PDF" files on disk are plain
/// UTF-8, pages separated by form feeds.
pub struct PlainTextReader;

impl PdfReader for PlainTextReader {
    fn extract(&self, path: &Path) -> Result<DocumentData> {
        let content = std::fs::read_to_string(path)?;
        let page_texts: Vec<String> = content.split('\u{0c}').map(str::to_string).collect();
        Ok(DocumentData {
            metadata: PdfMetadata {
                title: Some(format!(
                    "Title of {}",
                    path.file_name().unwrap().to_string_lossy()
                )),
                author: Some("Test Author".to_string()),
                page_count: page_texts.len() as i32,
                ..PdfMetadata::default()
            },
            page_texts,
        })
    }
}
