use std::path::Path;
use std::sync::Arc;

use crate::error::Result;
use crate::kernel::SimilarityKernel;
use crate::store::{ContextChunk, Store};

/// Hybrid top-k retrieval: the similarity kernel scans the mapped
/// dumps first; when it yields nothing (or fails) the relational
/// store's own vector search takes over. Either way the winning hashes
/// are hydrated into full chunks through the store, preserving the
/// ranking.
pub struct Retriever {
    kernel: Arc<dyn SimilarityKernel>,
    store: Arc<dyn Store>,
}

impl Retriever {
    pub fn new(kernel: Arc<dyn SimilarityKernel>, store: Arc<dyn Store>) -> Self {
        Self { kernel, store }
    }

    pub async fn search(
        &self,
        query: &[f32],
        k: usize,
        corpus_dir: &Path,
    ) -> Result<Vec<ContextChunk>> {
        let mut ranked = self.kernel_search(query, k, corpus_dir).await;

        if ranked.is_empty() {
            tracing::debug!("kernel returned nothing, falling back to store search");
            ranked = self
                .store
                .search_similar(query, k)
                .await?
                .into_iter()
                .map(|m| (m.hash, m.similarity))
                .collect();
        }
        if ranked.is_empty() {
            return Ok(Vec::new());
        }

        let hashes: Vec<u64> = ranked.iter().map(|(hash, _)| *hash).collect();
        let mut metas = self.store.chunks_by_hashes(&hashes).await?;

        let mut chunks = Vec::with_capacity(ranked.len());
        for (hash, similarity) in ranked {
            match metas.remove(&hash) {
                Some(mut chunk) => {
                    chunk.similarity = similarity;
                    chunks.push(chunk);
                }
                None => {
                    tracing::warn!(hash, "dropping ranked hash with no stored chunk");
                }
            }
        }
        Ok(chunks)
    }

    /// Runs the kernel on the blocking pool; scan errors degrade to an
    /// empty result so the store fallback can take over.
    async fn kernel_search(&self, query: &[f32], k: usize, corpus_dir: &Path) -> Vec<(u64, f32)> {
        let kernel = Arc::clone(&self.kernel);
        let query = query.to_vec();
        let corpus_dir = corpus_dir.to_path_buf();

        let outcome = tokio::task::spawn_blocking(move || {
            kernel.search(&query, &corpus_dir, k)
        })
        .await;

        match outcome {
            Ok(Ok(ranked)) => ranked,
            Ok(Err(e)) => {
                tracing::warn!("similarity kernel failed, falling back to store: {e}");
                Vec::new()
            }
            Err(e) => {
                tracing::warn!("similarity kernel task panicked, falling back to store: {e}");
                Vec::new()
            }
        }
    }
}
