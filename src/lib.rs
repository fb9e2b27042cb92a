//! Local retrieval-augmented question answering over a PDF corpus.
//!
//! Documents are fingerprinted, split into overlapping chunks,
//! embedded through a pooled inference engine, and persisted twice:
//! authoritatively in a relational store with a vector column, and as
//! memory-mappable per-document dump files keyed by fingerprint. A
//! query embeds the question, scans the mapped dumps for the top-k
//! closest chunks (falling back to the store's own vector search),
//! and hands the retrieved context to a chat engine that produces the
//! answer with provenance.
//!
//! The inference engines and the PDF text extractor are collaborators
//! behind traits; [`RagSystem`] wires everything together for the
//! common case.

pub mod chunker;
pub mod config;
pub mod embeddings;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod ingest;
pub mod kernel;
pub mod path_resolve;
pub mod pdf;
pub mod pool;
pub mod rag;
pub mod retriever;
pub mod store;
pub mod vecdump;

use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use chunker::{Chunker, TextChunk};
pub use config::Config;
pub use embeddings::{embedding_hash, Embedded, EmbeddingService};
pub use engine::{ChatEngine, EmbeddingEngine, InferenceContext, Pooling, TokenBatch};
pub use error::{RagError, Result};
pub use ingest::{Ingestor, WorkResult};
pub use kernel::{FlatScanKernel, SimilarityKernel};
pub use pdf::{DocumentData, PdfMetadata, PdfReader, PopplerToolsReader};
pub use rag::{format_rag_result, ChatService, RagCoordinator, RagResult};
pub use retriever::Retriever;
pub use store::{ChunkRecord, ContextChunk, DocumentMeta, RelationalStore, Store};

use pool::ContextPool;

/// The assembled system: store, embedding and chat services, retriever
/// and ingestor, created by [`init`](Self::init) and torn down by
/// [`shutdown`](Self::shutdown).
pub struct RagSystem {
    store: Arc<dyn Store>,
    embed_contexts: Arc<ContextPool<Box<dyn InferenceContext>>>,
    chat_contexts: Arc<ContextPool<Box<dyn InferenceContext>>>,
    ingestor: Ingestor,
    coordinator: RagCoordinator,
    corpus_dir: PathBuf,
}

impl std::fmt::Debug for RagSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RagSystem")
            .field("corpus_dir", &self.corpus_dir)
            .finish_non_exhaustive()
    }
}

impl RagSystem {
    /// Initializes the system against the relational store named in
    /// the configuration, with the default PDF reader (poppler tools)
    /// and the default flat-scan similarity kernel.
    pub async fn init(
        config: Config,
        embedding_engine: Arc<dyn EmbeddingEngine>,
        chat_engine: Arc<dyn ChatEngine>,
    ) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(
            RelationalStore::connect(
                &config.store_conn_string,
                config.concurrency.store_conn_pool,
                config.embedding_dimension,
            )
            .await?,
        );
        store.initialize().await?;

        let kernel = Arc::new(FlatScanKernel::new(config.embedding_dimension));
        Self::init_with(
            config,
            embedding_engine,
            chat_engine,
            Arc::new(PopplerToolsReader),
            kernel,
            store,
        )
    }

    /// Fully injected construction: callers pick the PDF reader, the
    /// similarity kernel and the store implementation.
    pub fn init_with(
        config: Config,
        embedding_engine: Arc<dyn EmbeddingEngine>,
        chat_engine: Arc<dyn ChatEngine>,
        reader: Arc<dyn PdfReader>,
        kernel: Arc<dyn SimilarityKernel>,
        store: Arc<dyn Store>,
    ) -> Result<Self> {
        config.validate()?;
        if embedding_engine.dimension() != config.embedding_dimension {
            return Err(RagError::DimensionMismatch {
                expected: config.embedding_dimension,
                actual: embedding_engine.dimension(),
            });
        }

        let concurrency = config.concurrency;

        let embed_contexts = {
            let engine = Arc::clone(&embedding_engine);
            Arc::new(ContextPool::new(
                concurrency.embed_min_ctx,
                concurrency.embed_max_ctx,
                concurrency.context_max_uses,
                move || engine.new_context(),
            )?)
        };
        let embedder = Arc::new(EmbeddingService::new(
            embedding_engine,
            Arc::clone(&embed_contexts),
            concurrency.max_seqs_per_batch,
            concurrency.embed_max_ctx,
        )?);

        let chat_contexts = {
            let engine = Arc::clone(&chat_engine);
            Arc::new(ContextPool::new(
                concurrency.chat_min_ctx,
                concurrency.chat_max_ctx,
                0,
                move || engine.new_context(),
            )?)
        };
        let chat = Arc::new(ChatService::new(
            chat_engine,
            Arc::clone(&chat_contexts),
            config.chat.max_generation_tokens,
        ));

        let corpus_dir = PathBuf::from(path_resolve::resolve(&config.corpus_dir));
        let chunker = Chunker::new(config.chunking.max_chunk_size, config.chunking.overlap)?;
        let ingestor = Ingestor::new(
            reader,
            Arc::clone(&store),
            Arc::clone(&embedder),
            chunker,
            corpus_dir.clone(),
            concurrency.ingest_threads,
        )?;

        let retriever = Arc::new(Retriever::new(kernel, Arc::clone(&store)));
        let coordinator = RagCoordinator::new(
            embedder,
            retriever,
            chat,
            config.retrieval.k_top,
            config.chat.system_prompt.clone(),
        );

        tracing::info!(
            corpus_dir = %corpus_dir.display(),
            dimension = config.embedding_dimension,
            "system initialized"
        );
        Ok(Self {
            store,
            embed_contexts,
            chat_contexts,
            ingestor,
            coordinator,
            corpus_dir,
        })
    }

    /// Directory the ingestor writes dumps to and queries scan.
    pub fn corpus_dir(&self) -> &Path {
        &self.corpus_dir
    }

    /// Ingests a PDF file or a directory of PDFs. Per-file failures
    /// are collected into the summary rather than aborting the run.
    pub async fn add_corpus(&self, path: &str) -> WorkResult {
        self.ingestor.add_corpus(path).await
    }

    /// Removes a document version from the corpus: the document row
    /// (its chunks follow via cascade) and the dump file, when present.
    pub async fn delete_corpus(&self, fingerprint: &str) -> Result<()> {
        let deleted_row = self.store.delete_document(fingerprint).await?;

        let dump = vecdump::dump_path(&self.corpus_dir, fingerprint);
        let removed_dump = match std::fs::remove_file(&dump) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                tracing::warn!(path = %dump.display(), "failed to remove dump file: {e}");
                false
            }
        };

        if !deleted_row && !removed_dump {
            return Err(RagError::NotFound(format!(
                "no document with fingerprint {fingerprint}"
            )));
        }
        tracing::info!(fingerprint, deleted_row, removed_dump, "corpus entry deleted");
        Ok(())
    }

    /// Answers a question against the corpus under `corpus_dir`.
    pub async fn query_rag(&self, question: &str, corpus_dir: &Path) -> Result<RagResult> {
        self.coordinator.query(question, corpus_dir).await
    }

    /// Tears the system down: wakes and fails all pool waiters, frees
    /// idle contexts and closes the store. In-flight decodes finish
    /// first; their contexts are dropped on release.
    pub async fn shutdown(self) {
        self.embed_contexts.shutdown();
        self.chat_contexts.shutdown();
        self.store.close().await;
        tracing::info!("system shut down");
    }
}
