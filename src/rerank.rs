//! Optional cross-encoder reranking.
//!
//! Reranking is a precision refinement, never a dependency: if the model
//! runtime is not compiled in, not enabled, or fails to initialize, the
//! pipeline runs without it. The trait keeps the relevance pipeline
//! testable with a stub scorer.

use tracing::warn;

use crate::config::RetrievalConfig;
use crate::error::StageError;

/// Scores (query, passage) pairs more precisely than embedding similarity.
pub trait Reranker: Send + Sync {
    fn name(&self) -> &str;

    /// Score each text against the query. Returns `(input_index, score)`
    /// pairs sorted by score descending.
    fn rerank(&self, query: &str, texts: &[String]) -> Result<Vec<(usize, f32)>, StageError>;
}

/// Build the configured reranker, or `None` when reranking should be a
/// no-op. Initialization failure is degraded, not fatal.
pub fn create(config: &RetrievalConfig) -> Option<Box<dyn Reranker>> {
    if !config.reranker_enabled {
        return None;
    }

    #[cfg(feature = "reranker")]
    {
        match cross_encoder::CrossEncoder::new(&config.reranker_model) {
            Ok(model) => Some(Box::new(model)),
            Err(e) => {
                warn!(error = %e, "reranker initialization failed; continuing without");
                None
            }
        }
    }

    #[cfg(not(feature = "reranker"))]
    {
        warn!(
            model = %config.reranker_model,
            "reranker enabled in config but this build has no reranker feature"
        );
        None
    }
}

#[cfg(feature = "reranker")]
mod cross_encoder {
    use fastembed::{RerankInitOptions, RerankerModel, TextRerank};

    use super::Reranker;
    use crate::error::StageError;

    pub struct CrossEncoder {
        model: TextRerank,
        name: String,
    }

    impl CrossEncoder {
        pub fn new(name: &str) -> Result<Self, StageError> {
            let options = RerankInitOptions::new(RerankerModel::BGERerankerBase)
                .with_show_download_progress(false);
            let model = TextRerank::try_new(options)
                .map_err(|e| StageError::Rerank(e.to_string()))?;
            Ok(Self {
                model,
                name: name.to_string(),
            })
        }
    }

    impl Reranker for CrossEncoder {
        fn name(&self) -> &str {
            &self.name
        }

        fn rerank(&self, query: &str, texts: &[String]) -> Result<Vec<(usize, f32)>, StageError> {
            if texts.is_empty() {
                return Ok(Vec::new());
            }
            let documents: Vec<&str> = texts.iter().map(String::as_str).collect();
            let results = self
                .model
                .rerank(query, documents, true, None)
                .map_err(|e| StageError::Rerank(e.to_string()))?;
            let mut scored: Vec<(usize, f32)> =
                results.into_iter().map(|r| (r.index, r.score)).collect();
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            Ok(scored)
        }
    }
}
