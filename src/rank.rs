//! Relevance pipeline: similarity search plus the ranking adjustments
//! that turn raw vector hits into citation-worthy candidates.
//!
//! Stage order is deliberate and load-bearing: search (with over-fetch) →
//! topic-widening fallback → entity boost → source-URI dedup → score
//! floor → optional rerank → truncate. Reranking is the only stage with an
//! external dependency and it degrades to a plain truncation.

use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::config::RetrievalConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::StageError;
use crate::models::Candidate;
use crate::rerank::Reranker;
use crate::store::{self, SearchFilters};
use crate::text;

/// Per-query retrieval parameters, already validated by the orchestrator.
#[derive(Debug, Clone)]
pub struct RetrievalRequest<'a> {
    pub k: usize,
    pub langs: &'a [String],
    pub topic: Option<&'a str>,
    pub country: Option<&'a str>,
    pub index_name: &'a str,
    pub use_reranker: bool,
}

pub async fn retrieve(
    pool: &SqlitePool,
    embeddings: &EmbeddingProvider,
    reranker: Option<&dyn Reranker>,
    config: &RetrievalConfig,
    query: &str,
    request: &RetrievalRequest<'_>,
) -> Result<Vec<Candidate>, StageError> {
    let query_vec = embeddings.embed_query(query).await;
    let fetch_k = request.k.max(config.overfetch_k);

    let filters = SearchFilters {
        langs: request.langs,
        index_name: request.index_name,
        topic: request.topic,
        country: request.country,
    };
    let mut candidates = store::search(pool, &query_vec, fetch_k, &filters).await?;

    // Topic tags go stale; a missing tag should not hide a good document.
    if candidates.is_empty() && request.topic.is_some() {
        debug!(topic = ?request.topic, "no hits with topic filter; widening");
        let widened = SearchFilters {
            topic: None,
            ..filters
        };
        candidates = store::search(pool, &query_vec, fetch_k, &widened).await?;
    }

    apply_entity_boost(&mut candidates, query, config.entity_boost);
    let candidates = dedup_by_uri(candidates);
    let mut candidates = apply_score_floor(candidates, config.score_floor);

    if request.use_reranker {
        if let Some(reranker) = reranker {
            let texts: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();
            match reranker.rerank(query, &texts) {
                Ok(order) => {
                    let mut reranked = Vec::with_capacity(request.k.min(candidates.len()));
                    for &(idx, _) in order.iter().take(request.k) {
                        if let Some(c) = candidates.get(idx) {
                            reranked.push(c.clone());
                        }
                    }
                    return Ok(reranked);
                }
                Err(e) => {
                    warn!(error = %e, "rerank failed; keeping similarity order");
                }
            }
        }
    }

    candidates.truncate(request.k);
    Ok(candidates)
}

/// Add a bounded bonus to candidates that lexically contain the query's
/// entity guess in their source URI or text, then re-sort. Compensates for
/// embedding similarity under-ranking exact name matches.
pub fn apply_entity_boost(candidates: &mut [Candidate], query: &str, bonus: f32) {
    if bonus <= 0.0 {
        return;
    }
    let Some(entity) = text::entity_guess(query) else {
        return;
    };

    for candidate in candidates.iter_mut() {
        let in_uri = text::fold(&candidate.source_uri).contains(&entity);
        let in_text = text::fold(&candidate.text).contains(&entity);
        if in_uri || in_text {
            candidate.adjusted = candidate.score + bonus;
        }
    }

    candidates.sort_by(|a, b| {
        b.adjusted
            .partial_cmp(&a.adjusted)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Keep only the first (highest-ranked) candidate per source URI, so one
/// source never occupies multiple citation slots.
pub fn dedup_by_uri(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut seen = std::collections::HashSet::new();
    candidates
        .into_iter()
        .filter(|c| seen.insert(c.source_uri.clone()))
        .collect()
}

/// Drop candidates below the similarity floor. When nothing clears it,
/// the result is empty rather than padded with noise.
pub fn apply_score_floor(candidates: Vec<Candidate>, floor: f32) -> Vec<Candidate> {
    candidates
        .into_iter()
        .filter(|c| c.adjusted >= floor)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(uri: &str, text: &str, score: f32) -> Candidate {
        Candidate {
            doc_id: uri.to_string(),
            text: text.to_string(),
            section: None,
            source_uri: uri.to_string(),
            lang: "es".to_string(),
            published_at: None,
            score,
            adjusted: score,
        }
    }

    #[test]
    fn test_entity_boost_reorders_lexical_match() {
        let mut candidates = vec![
            candidate("https://example.org/tamales", "Los tamales son...", 0.80),
            candidate("https://example.org/Arepa", "La arepa es un pan de maíz.", 0.78),
        ];
        apply_entity_boost(&mut candidates, "¿Qué es una arepa?", 0.05);
        assert_eq!(candidates[0].source_uri, "https://example.org/Arepa");
        assert!((candidates[0].adjusted - 0.83).abs() < 1e-6);
        // Unboosted candidate keeps its score as the adjusted value.
        assert_eq!(candidates[1].adjusted, candidates[1].score);
    }

    #[test]
    fn test_entity_boost_is_diacritic_insensitive() {
        let mut candidates = vec![candidate(
            "https://example.org/quinceanera",
            "Una celebración de los quince años.",
            0.5,
        )];
        apply_entity_boost(&mut candidates, "¿Qué es una quinceañera?", 0.05);
        assert!(candidates[0].adjusted > 0.5);
    }

    #[test]
    fn test_dedup_keeps_first_per_uri() {
        let candidates = vec![
            candidate("https://a", "uno", 0.9),
            candidate("https://b", "dos", 0.8),
            candidate("https://a", "tres", 0.7),
        ];
        let deduped = dedup_by_uri(candidates);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].text, "uno");
        let uris: std::collections::HashSet<_> =
            deduped.iter().map(|c| c.source_uri.as_str()).collect();
        assert_eq!(uris.len(), deduped.len());
    }

    #[test]
    fn test_score_floor_drops_noise() {
        let candidates = vec![
            candidate("https://a", "uno", 0.9),
            candidate("https://b", "dos", 0.2),
        ];
        let kept = apply_score_floor(candidates, 0.35);
        assert_eq!(kept.len(), 1);
        assert!(kept.iter().all(|c| c.adjusted >= 0.35));
    }

    #[test]
    fn test_score_floor_can_empty_the_list() {
        let candidates = vec![candidate("https://a", "uno", 0.1)];
        assert!(apply_score_floor(candidates, 0.35).is_empty());
    }

    struct BrokenReranker;

    impl Reranker for BrokenReranker {
        fn name(&self) -> &str {
            "broken"
        }
        fn rerank(&self, _query: &str, _texts: &[String]) -> Result<Vec<(usize, f32)>, StageError> {
            Err(StageError::Rerank("model not loaded".to_string()))
        }
    }

    async fn seeded_pool(
        embeddings: &EmbeddingProvider,
        topic: Option<&str>,
    ) -> SqlitePool {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();

        let text = "La arepa es un pan plano de maíz.";
        let vector = embeddings.embed_query(text).await;
        let doc = crate::models::Document {
            id: store::new_id(),
            source_uri: "https://es.wikipedia.org/wiki/Arepa".to_string(),
            source_type: crate::models::SourceType::Url,
            lang: "es".to_string(),
            country: Some("VE".to_string()),
            topic: topic.map(str::to_string),
            version: 1,
            approved: true,
            deleted: false,
            published_at: None,
            index_name: "c300o45".to_string(),
        };
        let chunk = crate::models::Chunk {
            id: store::new_id(),
            doc_id: doc.id.clone(),
            chunk_index: 0,
            text: text.to_string(),
            tokens: 7,
            embedding: Some(vector),
            section: None,
            index_name: "c300o45".to_string(),
        };
        let mut tx = pool.begin().await.unwrap();
        store::insert_document(&mut tx, &doc).await.unwrap();
        store::insert_chunks(&mut tx, &[chunk], store::VectorEncoding::Blob)
            .await
            .unwrap();
        tx.commit().await.unwrap();
        pool
    }

    fn request<'a>(langs: &'a [String], topic: Option<&'a str>, rerank: bool) -> RetrievalRequest<'a> {
        RetrievalRequest {
            k: 3,
            langs,
            topic,
            country: None,
            index_name: "c300o45",
            use_reranker: rerank,
        }
    }

    #[tokio::test]
    async fn test_retrieve_finds_identical_text() {
        let embeddings = EmbeddingProvider::offline("m", 64);
        let pool = seeded_pool(&embeddings, Some("food")).await;
        let langs = vec!["es".to_string()];
        let config = RetrievalConfig::default();
        let out = retrieve(
            &pool,
            &embeddings,
            None,
            &config,
            "La arepa es un pan plano de maíz.",
            &request(&langs, None, false),
        )
        .await
        .unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].score > 0.99);
    }

    #[tokio::test]
    async fn test_retrieve_widens_when_topic_filter_empties() {
        let embeddings = EmbeddingProvider::offline("m", 64);
        // Document carries no topic tag, so topic=food alone finds nothing.
        let pool = seeded_pool(&embeddings, None).await;
        let langs = vec!["es".to_string()];
        let config = RetrievalConfig {
            score_floor: 0.0,
            ..RetrievalConfig::default()
        };
        let out = retrieve(
            &pool,
            &embeddings,
            None,
            &config,
            "La arepa es un pan plano de maíz.",
            &request(&langs, Some("food"), false),
        )
        .await
        .unwrap();
        assert!(!out.is_empty(), "widening should recover the untagged doc");
    }

    #[tokio::test]
    async fn test_retrieve_degrades_on_broken_reranker() {
        let embeddings = EmbeddingProvider::offline("m", 64);
        let pool = seeded_pool(&embeddings, Some("food")).await;
        let langs = vec!["es".to_string()];
        let config = RetrievalConfig::default();
        let out = retrieve(
            &pool,
            &embeddings,
            Some(&BrokenReranker),
            &config,
            "La arepa es un pan plano de maíz.",
            &request(&langs, None, true),
        )
        .await
        .unwrap();
        assert_eq!(out.len(), 1, "broken reranker must not lose results");
    }
}
