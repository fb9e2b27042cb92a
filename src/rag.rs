use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::embeddings::EmbeddingService;
use crate::engine::{ChatEngine, InferenceContext};
use crate::error::{RagError, Result};
use crate::pool::ContextPool;
use crate::retriever::Retriever;
use crate::store::ContextChunk;

/// A generated answer plus the context it was grounded in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RagResult {
    pub response: String,
    pub context_chunks: Vec<ContextChunk>,
    pub referenced_document_count: usize,
}

impl RagResult {
    pub fn is_empty(&self) -> bool {
        self.response.is_empty() && self.context_chunks.is_empty()
    }
}

/// Greedy chat generation over a pool of decoding contexts.
pub struct ChatService {
    engine: Arc<dyn ChatEngine>,
    contexts: Arc<ContextPool<Box<dyn InferenceContext>>>,
    max_generation_tokens: usize,
}

impl ChatService {
    pub fn new(
        engine: Arc<dyn ChatEngine>,
        contexts: Arc<ContextPool<Box<dyn InferenceContext>>>,
        max_generation_tokens: usize,
    ) -> Self {
        Self {
            engine,
            contexts,
            max_generation_tokens,
        }
    }

    /// Generates a reply for the formatted prompt. The generation
    /// budget is the configured cap, shrunk to whatever room the
    /// context window leaves after the prompt.
    pub async fn reply(&self, prompt: String) -> Result<String> {
        let engine = Arc::clone(&self.engine);
        let contexts = Arc::clone(&self.contexts);
        let max_generation_tokens = self.max_generation_tokens;

        tokio::task::spawn_blocking(move || {
            let prompt_tokens = engine.count_tokens(&prompt)?;
            let window = engine.context_window();
            if prompt_tokens >= window {
                return Err(RagError::Engine(format!(
                    "prompt occupies {prompt_tokens} tokens, context window is {window}"
                )));
            }
            let budget = max_generation_tokens.min(window - prompt_tokens);

            let mut lease = contexts.acquire()?;
            lease.clear_kv_cache();
            engine.generate(&mut **lease, &prompt, budget)
        })
        .await
        .map_err(|e| RagError::Engine(format!("chat task panicked: {e}")))?
    }
}

/// Formats the fixed chat prompt with its role markers.
fn format_prompt(system_prompt: &str, context: &str, question: &str) -> String {
    format!("<|system|>\n{system_prompt}\n<|context|>\n{context}\n<|user|>\n{question}\n<|assistant|>\n")
}

/// Ties the pipeline together for a single question: embed, retrieve,
/// assemble the prompt, generate, and package the answer with its
/// provenance. Owns no long-lived state of its own.
pub struct RagCoordinator {
    embedder: Arc<EmbeddingService>,
    retriever: Arc<Retriever>,
    chat: Arc<ChatService>,
    k_top: usize,
    system_prompt: String,
}

impl RagCoordinator {
    pub fn new(
        embedder: Arc<EmbeddingService>,
        retriever: Arc<Retriever>,
        chat: Arc<ChatService>,
        k_top: usize,
        system_prompt: String,
    ) -> Self {
        Self {
            embedder,
            retriever,
            chat,
            k_top,
            system_prompt,
        }
    }

    pub async fn query(&self, question: &str, corpus_dir: &Path) -> Result<RagResult> {
        let embedded = self.embedder.embed(&[question.to_string()]).await?;
        let Some(query_vec) = embedded.into_iter().next() else {
            tracing::warn!("query produced no embedding, returning empty result");
            return Ok(RagResult::default());
        };

        let ranked = match self
            .retriever
            .search(&query_vec.vector, self.k_top, corpus_dir)
            .await
        {
            Ok(ranked) => ranked,
            Err(e) => {
                tracing::warn!("retrieval failed, returning empty result: {e}");
                return Ok(RagResult::default());
            }
        };

        let context_str = ranked
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        if context_str.is_empty() {
            tracing::warn!("no relevant context found for query");
            return Ok(RagResult::default());
        }

        let prompt = format_prompt(&self.system_prompt, &context_str, question);
        let response = self.chat.reply(prompt).await?;

        let referenced_document_count = ranked
            .iter()
            .map(|c| c.file_path.as_str())
            .collect::<HashSet<_>>()
            .len();

        Ok(RagResult {
            response,
            context_chunks: ranked,
            referenced_document_count,
        })
    }
}

/// Renders a result for human consumption: the answer followed by one
/// provenance line per context chunk.
pub fn format_rag_result(result: &RagResult) -> String {
    if result.is_empty() {
        return "No answer could be generated: no relevant context was found.".to_string();
    }

    let mut out = String::new();
    out.push_str(&result.response);
    if result.context_chunks.is_empty() {
        return out;
    }

    let _ = write!(
        out,
        "\n\nSources ({} chunk{} from {} document{}):",
        result.context_chunks.len(),
        if result.context_chunks.len() == 1 { "" } else { "s" },
        result.referenced_document_count,
        if result.referenced_document_count == 1 { "" } else { "s" },
    );
    for (i, chunk) in result.context_chunks.iter().enumerate() {
        let _ = write!(out, "\n  {}. {}", i + 1, chunk.file_name);
        if let Some(title) = chunk.title.as_deref().filter(|t| !t.is_empty()) {
            let _ = write!(out, " - {title}");
        }
        if let Some(author) = chunk.author.as_deref().filter(|a| !a.is_empty()) {
            let _ = write!(out, " ({author})");
        }
        if chunk.page_number > 0 {
            if chunk.page_count > 0 {
                let _ = write!(out, ", page {}/{}", chunk.page_number, chunk.page_count);
            } else {
                let _ = write!(out, ", page {}", chunk.page_number);
            }
        }
        let _ = write!(out, " [similarity {:.3}]", chunk.similarity);
    }
    out
}
