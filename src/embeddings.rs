use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;

use crate::engine::{EmbeddingEngine, InferenceContext, Pooling, TokenBatch, TokenSequence};
use crate::error::{RagError, Result};
use crate::pool::ContextPool;

/// One embedded input, tagged with the index of the text it came from.
///
/// The service can return fewer outputs than inputs (empty strings are
/// skipped, failed batches dropped); callers reconcile by `index`.
#[derive(Debug, Clone)]
pub struct Embedded {
    pub index: usize,
    pub vector: Vec<f32>,
    pub hash: u64,
}

/// Folds a vector's IEEE-754 bit patterns into a 64-bit content
/// identifier. Deterministic for bit-identical vectors; collisions are
/// possible but negligible at the corpus sizes served.
pub fn embedding_hash(vector: &[f32]) -> u64 {
    let mut h: u64 = 0;
    for v in vector {
        let bits = v.to_bits() as u64;
        h ^= bits
            .wrapping_add(0x9e37_79b9)
            .wrapping_add(h << 6)
            .wrapping_add(h >> 2);
    }
    h
}

pub(crate) fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// Batched, parallel embedding over a pool of inference contexts.
///
/// The service itself is stateless; concurrency is bounded by the
/// decode permit count and, transitively, by the context pool size.
/// Callers may invoke [`embed`](Self::embed) concurrently.
pub struct EmbeddingService {
    engine: Arc<dyn EmbeddingEngine>,
    contexts: Arc<ContextPool<Box<dyn InferenceContext>>>,
    max_seqs_per_batch: usize,
    decode_permits: Arc<Semaphore>,
}

impl EmbeddingService {
    pub fn new(
        engine: Arc<dyn EmbeddingEngine>,
        contexts: Arc<ContextPool<Box<dyn InferenceContext>>>,
        max_seqs_per_batch: usize,
        max_concurrent: usize,
    ) -> Result<Self> {
        if max_seqs_per_batch == 0 {
            return Err(RagError::Config(
                "max_seqs_per_batch must be positive".into(),
            ));
        }
        if max_concurrent == 0 {
            return Err(RagError::Config("max_concurrent must be positive".into()));
        }
        Ok(Self {
            engine,
            contexts,
            max_seqs_per_batch,
            decode_permits: Arc::new(Semaphore::new(max_concurrent)),
        })
    }

    pub fn dimension(&self) -> usize {
        self.engine.dimension()
    }

    /// Embeds a batch of texts, returning unit-normalized vectors and
    /// their content hashes ordered by input index.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Embedded>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let batches = self.tokenize_and_pack(texts);
        if batches.is_empty() {
            return Ok(Vec::new());
        }

        let tasks = batches.into_iter().map(|batch| {
            let engine = Arc::clone(&self.engine);
            let contexts = Arc::clone(&self.contexts);
            let permits = Arc::clone(&self.decode_permits);
            async move {
                let permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| RagError::PoolClosed)?;
                tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    decode_batch(&*engine, &contexts, batch)
                })
                .await
                .map_err(|e| RagError::Engine(format!("embedding task panicked: {e}")))?
            }
        });

        let mut embedded = Vec::new();
        for outcome in join_all(tasks).await {
            match outcome {
                Ok(batch_result) => embedded.extend(batch_result),
                Err(e) => {
                    tracing::warn!("embedding batch failed, dropping its chunks: {e}");
                }
            }
        }
        embedded.sort_by_key(|e| e.index);
        Ok(embedded)
    }

    /// Tokenizes every input and packs the sequences into batches
    /// bounded by the engine's token budget and the configured
    /// sequence cap. Empty and untokenizable inputs are skipped with a
    /// warning; over-long sequences are truncated to the budget.
    fn tokenize_and_pack(&self, texts: &[String]) -> Vec<TokenBatch> {
        let budget = self.engine.token_budget();
        let mut sequences = Vec::with_capacity(texts.len());

        for (index, text) in texts.iter().enumerate() {
            if text.trim().is_empty() {
                tracing::warn!(index, "skipping empty input text");
                continue;
            }
            let mut tokens = match self.engine.tokenize(text) {
                Ok(tokens) => tokens,
                Err(e) => {
                    tracing::warn!(index, "failed to tokenize input, skipping: {e}");
                    continue;
                }
            };
            if tokens.is_empty() {
                tracing::warn!(index, "input produced no tokens, skipping");
                continue;
            }
            if tokens.len() > budget {
                tracing::warn!(
                    index,
                    tokens = tokens.len(),
                    budget,
                    "input exceeds the engine token budget, truncating"
                );
                tokens.truncate(budget);
            }
            sequences.push(TokenSequence { id: index, tokens });
        }

        let mut batches = Vec::new();
        let mut current = TokenBatch::default();
        for seq in sequences {
            let over_budget = current.token_count() + seq.tokens.len() > budget;
            let over_seqs = current.seq_count() >= self.max_seqs_per_batch;
            if !current.is_empty() && (over_budget || over_seqs) {
                batches.push(std::mem::take(&mut current));
            }
            current.sequences.push(seq);
        }
        if !current.is_empty() {
            batches.push(current);
        }
        batches
    }
}

/// Runs one batch on a pooled context and pools, normalizes and hashes
/// each sequence's embedding.
fn decode_batch(
    engine: &dyn EmbeddingEngine,
    contexts: &ContextPool<Box<dyn InferenceContext>>,
    batch: TokenBatch,
) -> Result<Vec<Embedded>> {
    let mut lease = contexts.acquire()?;
    lease.clear_kv_cache();
    let rows = engine.decode(&mut **lease, &batch)?;
    drop(lease);

    if rows.len() != batch.token_count() {
        return Err(RagError::Engine(format!(
            "engine returned {} rows for {} token positions",
            rows.len(),
            batch.token_count()
        )));
    }

    let dimension = engine.dimension();
    let pooling = engine.pooling();
    let mut out = Vec::with_capacity(batch.seq_count());
    let mut offset = 0;
    for seq in &batch.sequences {
        let span = &rows[offset..offset + seq.tokens.len()];
        offset += seq.tokens.len();

        let mut vector = pool_sequence(span, pooling);
        if vector.len() != dimension {
            return Err(RagError::DimensionMismatch {
                expected: dimension,
                actual: vector.len(),
            });
        }
        l2_normalize(&mut vector);
        let hash = embedding_hash(&vector);
        out.push(Embedded {
            index: seq.id,
            vector,
            hash,
        });
    }
    Ok(out)
}

fn pool_sequence(rows: &[Vec<f32>], pooling: Pooling) -> Vec<f32> {
    match pooling {
        Pooling::Cls => rows[0].clone(),
        Pooling::Last => rows[rows.len() - 1].clone(),
        Pooling::Mean => {
            let mut mean = vec![0.0f32; rows[0].len()];
            for row in rows {
                for (m, v) in mean.iter_mut().zip(row) {
                    *m += v;
                }
            }
            let n = rows.len() as f32;
            for m in mean.iter_mut() {
                *m /= n;
            }
            mean
        }
    }
}
