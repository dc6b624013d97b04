//! Error taxonomy for the query pipeline.
//!
//! Each stage of the pipeline reports failures through [`StageError`] so
//! the orchestrator can decide, per kind, whether to fall back, retry, or
//! surface a structured error response. Nothing in the core panics or
//! bubbles raw errors past the response boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StageError {
    /// The request failed validation before any retrieval work started.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The embedding provider failed after its retry budget.
    #[error("embedding provider error: {0}")]
    Embedding(String),

    /// The vector store failed after its retry budget.
    #[error("vector store error: {0}")]
    Store(String),

    /// A generation (chat) call failed after its retry budget.
    #[error("generation error: {0}")]
    Generation(String),

    /// The cross-encoder reranker was unavailable or failed to score.
    #[error("reranker error: {0}")]
    Rerank(String),
}

impl StageError {
    /// Opaque code reported to callers in place of raw error text.
    pub fn code(&self) -> &'static str {
        match self {
            StageError::Validation(_) => "invalid_request",
            StageError::Embedding(_) => "embedding_error",
            StageError::Store(_) => "store_error",
            StageError::Generation(_) => "generation_error",
            StageError::Rerank(_) => "rerank_error",
        }
    }
}
