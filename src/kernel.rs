use std::path::Path;

use walkdir::WalkDir;

use crate::error::{RagError, Result};
use crate::vecdump::{MappedDump, DUMP_EXTENSION};

/// Top-k similarity scan over a directory of vector dumps.
///
/// Implementations return `(hash, score)` pairs in descending score
/// order. An empty result is a signal to fall back to the relational
/// store, not an error. Accelerator-backed implementations plug in
/// here; [`FlatScanKernel`] is the portable default.
pub trait SimilarityKernel: Send + Sync {
    fn search(&self, query: &[f32], corpus_dir: &Path, k: usize) -> Result<Vec<(u64, f32)>>;
}

pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot_product / (norm_a * norm_b)
    }
}

/// Brute-force cosine scan over every mapped dump under the corpus
/// directory.
///
/// Dumps whose stored dimension differs from the query are skipped
/// with a warning, as are dumps that fail to parse; stale dumps from
/// superseded document versions are therefore tolerated.
pub struct FlatScanKernel {
    dimension: usize,
}

impl FlatScanKernel {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl SimilarityKernel for FlatScanKernel {
    fn search(&self, query: &[f32], corpus_dir: &Path, k: usize) -> Result<Vec<(u64, f32)>> {
        if query.len() != self.dimension {
            return Err(RagError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(u64, f32)> = Vec::new();
        let mut scanned_dumps = 0usize;

        for entry in WalkDir::new(corpus_dir).into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some(DUMP_EXTENSION) {
                continue;
            }

            let dump = match MappedDump::open(path) {
                Ok(dump) => dump,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "skipping unreadable dump: {e}");
                    continue;
                }
            };
            if dump.num_entries() == 0 {
                continue;
            }
            if dump.dimensions() != query.len() {
                tracing::warn!(
                    path = %path.display(),
                    dump_dim = dump.dimensions(),
                    query_dim = query.len(),
                    "skipping dump with incompatible dimensions"
                );
                continue;
            }

            scanned_dumps += 1;
            let hashes = dump.hashes();
            for i in 0..dump.num_entries() {
                let score = cosine_similarity(query, dump.vector(i));
                scored.push((hashes[i], score));
            }
        }

        tracing::debug!(
            dumps = scanned_dumps,
            candidates = scored.len(),
            "flat scan complete"
        );

        // Descending by score; ties broken by hash so ordering stays
        // stable across runs.
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);
        Ok(scored)
    }
}
