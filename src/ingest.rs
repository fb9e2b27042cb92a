use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use walkdir::WalkDir;

use crate::chunker::Chunker;
use crate::embeddings::EmbeddingService;
use crate::error::{RagError, Result};
use crate::fingerprint;
use crate::path_resolve;
use crate::pdf::PdfReader;
use crate::store::{ChunkRecord, DocumentMeta, Store};
use crate::vecdump::{self, DUMP_EXTENSION};

/// Outcome summary of a corpus operation.
#[derive(Debug, Clone, Default)]
pub struct WorkResult {
    pub error: bool,
    pub error_message: Option<String>,
    pub success_message: Option<String>,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl WorkResult {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            error: true,
            error_message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn ok(&self) -> bool {
        !self.error
    }
}

/// Collects the PDF set named by a path: the file itself, or every
/// `.pdf` under a directory, recursively.
fn collect_pdf_files(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        if path.extension().and_then(|s| s.to_str()) == Some("pdf") {
            return Ok(vec![path.to_path_buf()]);
        }
        return Err(RagError::Config(format!(
            "unsupported file type, only PDF files are supported: {}",
            path.display()
        )));
    }

    if path.is_dir() {
        let files = WalkDir::new(path)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_type().is_file()
                    && e.path().extension().and_then(|s| s.to_str()) == Some("pdf")
            })
            .map(|e| e.path().to_path_buf())
            .collect();
        return Ok(files);
    }

    Err(RagError::NotFound(format!(
        "path is neither a file nor a directory: {}",
        path.display()
    )))
}

/// Fingerprints of dumps already present in the dump directory.
fn existing_dump_fingerprints(dump_dir: &Path) -> HashSet<String> {
    let Ok(entries) = std::fs::read_dir(dump_dir) else {
        return HashSet::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let path = e.path();
            if path.extension().and_then(|s| s.to_str()) == Some(DUMP_EXTENSION) {
                path.file_stem()
                    .and_then(|s| s.to_str())
                    .map(str::to_string)
            } else {
                None
            }
        })
        .collect()
}

/// Orchestrates corpus ingestion: discovery, fingerprinting,
/// skip-if-unchanged, extraction, chunking, embedding, persistence and
/// dump writing, with a bounded pool of per-file workers.
#[derive(Clone)]
pub struct Ingestor {
    reader: Arc<dyn PdfReader>,
    store: Arc<dyn Store>,
    embedder: Arc<EmbeddingService>,
    chunker: Chunker,
    dump_dir: PathBuf,
    ingest_threads: usize,
}

impl Ingestor {
    pub fn new(
        reader: Arc<dyn PdfReader>,
        store: Arc<dyn Store>,
        embedder: Arc<EmbeddingService>,
        chunker: Chunker,
        dump_dir: PathBuf,
        ingest_threads: usize,
    ) -> Result<Self> {
        if ingest_threads == 0 {
            return Err(RagError::Config("ingest_threads must be positive".into()));
        }
        Ok(Self {
            reader,
            store,
            embedder,
            chunker,
            dump_dir,
            ingest_threads,
        })
    }

    /// Adds a PDF file or a directory of PDFs to the corpus. Per-file
    /// errors are recorded and the remaining files continue; the
    /// summary reports counts and the last error message.
    pub async fn add_corpus(&self, source: &str) -> WorkResult {
        let resolved = path_resolve::resolve(source);
        let files = match collect_pdf_files(Path::new(&resolved)) {
            Ok(files) => files,
            Err(e) => return WorkResult::failure(e.to_string()),
        };
        if files.is_empty() {
            return WorkResult::failure(format!("no PDF files found under {resolved}"));
        }
        tracing::info!(count = files.len(), "found PDF files to process");

        let hashes = {
            let files = files.clone();
            match tokio::task::spawn_blocking(move || fingerprint::fingerprint_files(&files)).await
            {
                Ok(Ok(hashes)) => hashes,
                Ok(Err(e)) => return WorkResult::failure(format!("fingerprinting failed: {e}")),
                Err(e) => return WorkResult::failure(format!("fingerprinting panicked: {e}")),
            }
        };

        let existing = existing_dump_fingerprints(&self.dump_dir);
        let mut skipped = 0usize;
        let mut to_process: Vec<(PathBuf, String)> = Vec::new();
        for (path, hash) in hashes {
            if existing.contains(&hash) {
                tracing::info!(path = %path.display(), "skipping, dump already exists");
                skipped += 1;
            } else {
                to_process.push((path, hash));
            }
        }

        if to_process.is_empty() {
            return WorkResult {
                success_message: Some("All files are already processed".to_string()),
                skipped,
                ..WorkResult::default()
            };
        }
        tracing::info!(
            count = to_process.len(),
            skipped,
            workers = self.ingest_threads,
            "ingesting files"
        );

        let permits = Arc::new(Semaphore::new(self.ingest_threads));
        let handles: Vec<_> = to_process
            .into_iter()
            .map(|(path, hash)| {
                let ingestor = self.clone();
                let permits = Arc::clone(&permits);
                tokio::spawn(async move {
                    let _permit = permits.acquire_owned().await;
                    let outcome = ingestor.ingest_file(&path, &hash).await;
                    (path, outcome)
                })
            })
            .collect();

        let mut processed = 0usize;
        let mut failed = 0usize;
        let mut last_error: Option<String> = None;
        for joined in join_all(handles).await {
            match joined {
                Ok((path, Ok(chunk_count))) => {
                    processed += 1;
                    tracing::info!(
                        path = %path.display(),
                        chunks = chunk_count,
                        "file added to corpus"
                    );
                }
                Ok((path, Err(e))) => {
                    failed += 1;
                    let message = format!("{}: {e}", path.display());
                    tracing::warn!("failed to ingest file, continuing: {message}");
                    last_error = Some(message);
                }
                Err(e) => {
                    failed += 1;
                    last_error = Some(format!("ingest worker panicked: {e}"));
                }
            }
        }

        WorkResult {
            error: failed > 0,
            error_message: last_error,
            success_message: (failed == 0).then(|| format!("Processed {processed} files")),
            processed,
            skipped,
            failed,
        }
    }

    /// Runs the full pipeline for one file. The store is written
    /// first as the authoritative copy; the dump is a cache whose
    /// write failure only warns.
    async fn ingest_file(&self, path: &Path, file_hash: &str) -> Result<usize> {
        let data = {
            let reader = Arc::clone(&self.reader);
            let path = path.to_path_buf();
            tokio::task::spawn_blocking(move || reader.extract(&path))
                .await
                .map_err(|e| RagError::Engine(format!("PDF extraction panicked: {e}")))??
        };
        if data.load_failed() {
            return Err(RagError::Parse("could not load PDF".into()));
        }
        if data.page_texts.iter().all(|p| p.trim().is_empty()) {
            return Err(RagError::Parse("no text extracted from PDF".into()));
        }

        let meta = DocumentMeta {
            file_hash: file_hash.to_string(),
            file_path: path.to_string_lossy().into_owned(),
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            title: data.metadata.title.clone(),
            author: data.metadata.author.clone(),
            subject: data.metadata.subject.clone(),
            keywords: data.metadata.keywords.clone(),
            creator: data.metadata.creator.clone(),
            producer: data.metadata.producer.clone(),
            page_count: data.metadata.page_count,
        };
        self.store.upsert_document(&meta).await?;
        self.store.delete_chunks_by_file_hash(file_hash).await?;

        let chunks = self.chunker.split(&data.page_texts);
        tracing::info!(
            path = %path.display(),
            pages = data.page_texts.len(),
            chunks = chunks.len(),
            "extracted and chunked document"
        );

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embedded = self.embedder.embed(&texts).await?;
        if embedded.len() < chunks.len() {
            tracing::warn!(
                dropped = chunks.len() - embedded.len(),
                "some chunks were not embedded"
            );
        }
        if embedded.is_empty() {
            return Err(RagError::Engine("embedding produced no vectors".into()));
        }

        let records: Vec<ChunkRecord> = embedded
            .iter()
            .map(|e| ChunkRecord {
                text: chunks[e.index].text.clone(),
                vector: e.vector.clone(),
                hash: e.hash,
                page: chunks[e.index].page,
            })
            .collect();
        self.store.save_chunks(file_hash, &records).await?;

        let vectors: Vec<Vec<f32>> = embedded.iter().map(|e| e.vector.clone()).collect();
        let hashes: Vec<u64> = embedded.iter().map(|e| e.hash).collect();
        let dump_dir = self.dump_dir.clone();
        let fingerprint = file_hash.to_string();
        let dump_outcome = tokio::task::spawn_blocking(move || {
            vecdump::write_dump(&dump_dir, &fingerprint, &vectors, &hashes)
        })
        .await;
        match dump_outcome {
            Ok(Ok(dump_path)) => {
                tracing::debug!(path = %dump_path.display(), "dump written");
            }
            Ok(Err(e)) => {
                tracing::warn!("failed to write vector dump, store copy remains valid: {e}");
            }
            Err(e) => {
                tracing::warn!("dump writer panicked, store copy remains valid: {e}");
            }
        }

        Ok(records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_pdf_path_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = dir.path().join("paper.pdf");
        std::fs::write(&pdf, b"%PDF-1.4 fake").unwrap();

        let files = collect_pdf_files(&pdf).unwrap();
        assert_eq!(files, vec![pdf]);
    }

    #[test]
    fn non_pdf_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let txt = dir.path().join("notes.txt");
        std::fs::write(&txt, b"plain text").unwrap();

        assert!(matches!(
            collect_pdf_files(&txt),
            Err(RagError::Config(_))
        ));
    }

    #[test]
    fn directories_are_walked_recursively() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("top.pdf"), b"x").unwrap();
        std::fs::write(nested.join("deep.pdf"), b"y").unwrap();
        std::fs::write(nested.join("ignored.txt"), b"z").unwrap();

        let mut files = collect_pdf_files(dir.path()).unwrap();
        files.sort();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.extension().unwrap() == "pdf"));
    }

    #[test]
    fn missing_path_is_not_found() {
        assert!(matches!(
            collect_pdf_files(Path::new("/no/such/place")),
            Err(RagError::NotFound(_))
        ));
    }

    #[test]
    fn existing_dumps_are_recognized_by_stem() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("abc123.vecdump"), b"").unwrap();
        std::fs::write(dir.path().join("def456.vecdump"), b"").unwrap();
        std::fs::write(dir.path().join("other.bin"), b"").unwrap();

        let existing = existing_dump_fingerprints(dir.path());
        assert_eq!(existing.len(), 2);
        assert!(existing.contains("abc123"));
        assert!(existing.contains("def456"));
    }

    #[test]
    fn missing_dump_dir_yields_empty_set() {
        assert!(existing_dump_fingerprints(Path::new("/no/such/dumps")).is_empty());
    }

    #[test]
    fn work_result_failure_shape() {
        let result = WorkResult::failure("boom");
        assert!(result.error);
        assert!(!result.ok());
        assert_eq!(result.error_message.as_deref(), Some("boom"));
        assert!(result.success_message.is_none());
    }
}
