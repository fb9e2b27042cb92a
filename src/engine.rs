//! Contracts for the inference engines backing embedding and chat.
//!
//! The tensor runtime itself lives outside this crate; callers hand in
//! implementations of these traits at system construction. The crate
//! owns the batch/pooling data model and the process-wide backend
//! initialization guard.

use std::sync::Once;

use crate::error::Result;

/// How a sequence embedding is derived from per-token embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pooling {
    /// Average over the sequence's token positions.
    Mean,
    /// First token position.
    Cls,
    /// Last token position (engines that expose no pooled output).
    Last,
}

/// One tokenized input tagged with its caller-assigned sequence id.
#[derive(Debug, Clone)]
pub struct TokenSequence {
    pub id: usize,
    pub tokens: Vec<i32>,
}

/// A group of sequences submitted to the engine in one decode call.
#[derive(Debug, Clone, Default)]
pub struct TokenBatch {
    pub sequences: Vec<TokenSequence>,
}

impl TokenBatch {
    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn seq_count(&self) -> usize {
        self.sequences.len()
    }

    pub fn token_count(&self) -> usize {
        self.sequences.iter().map(|s| s.tokens.len()).sum()
    }
}

/// A reusable decoding state owned by a [`crate::pool::ContextPool`].
///
/// Contexts carry engine-internal state between decodes; callers reset
/// it before every independent decoding.
pub trait InferenceContext: Send {
    fn clear_kv_cache(&mut self);
}

/// Turns batches of token sequences into per-position embeddings.
pub trait EmbeddingEngine: Send + Sync {
    /// Builds a fresh decoding context. May take seconds.
    fn new_context(&self) -> Result<Box<dyn InferenceContext>>;

    /// Tokenizes one input with the engine's vocabulary, including the
    /// engine's sentence-start marker when it requires one.
    fn tokenize(&self, text: &str) -> Result<Vec<i32>>;

    /// Width of the produced embedding vectors.
    fn dimension(&self) -> usize;

    /// Token capacity of a single decode call.
    fn token_budget(&self) -> usize;

    /// The pooling the engine's model was trained for.
    fn pooling(&self) -> Pooling;

    /// Decodes a batch and returns one embedding row per token
    /// position, flattened in batch order (sequence by sequence).
    fn decode(
        &self,
        ctx: &mut dyn InferenceContext,
        batch: &TokenBatch,
    ) -> Result<Vec<Vec<f32>>>;
}

/// Turns a formatted prompt into a response string.
pub trait ChatEngine: Send + Sync {
    fn new_context(&self) -> Result<Box<dyn InferenceContext>>;

    /// Number of tokens the prompt occupies in the engine vocabulary.
    fn count_tokens(&self, prompt: &str) -> Result<usize>;

    /// Total token window a context can hold.
    fn context_window(&self) -> usize;

    /// Greedy decoding; stops on end-of-generation or after
    /// `max_tokens` new tokens.
    fn generate(
        &self,
        ctx: &mut dyn InferenceContext,
        prompt: &str,
        max_tokens: usize,
    ) -> Result<String>;
}

static BACKEND_INIT: Once = Once::new();

/// Runs engine backend setup exactly once per process. Subsequent
/// calls, from any thread, are no-ops.
pub fn init_backend_once(setup: impl FnOnce()) {
    BACKEND_INIT.call_once(setup);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn token_batch_counts() {
        let batch = TokenBatch {
            sequences: vec![
                TokenSequence { id: 0, tokens: vec![1, 2, 3] },
                TokenSequence { id: 2, tokens: vec![4] },
            ],
        };
        assert_eq!(batch.seq_count(), 2);
        assert_eq!(batch.token_count(), 4);
        assert!(!batch.is_empty());
        assert!(TokenBatch::default().is_empty());
    }

    #[test]
    fn backend_setup_runs_once() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                std::thread::spawn(|| {
                    init_backend_once(|| {
                        CALLS.fetch_add(1, Ordering::SeqCst);
                    })
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }
}
