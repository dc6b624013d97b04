//! Query orchestration: validation → FAQ short-circuit → retrieval →
//! synthesis, all under one global timeout.
//!
//! The one hard guarantee here is response shape: every query, including
//! ones that fail validation, time out, or hit an internal error, gets a
//! well-formed `{route, answer, citations, request_id}` object. Answer
//! quality degrades before response shape ever does.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{debug, error};
use uuid::Uuid;

use crate::config::Config;
use crate::error::StageError;
use crate::faq::FaqIndex;
use crate::generate::{self, ChatModel};
use crate::models::Candidate;
use crate::rank::{self, RetrievalRequest};
use crate::rerank::Reranker;
use crate::text::{detect_lang, normalize_query};

/// Topics a request may hint at.
pub const TOPICS: [&str; 5] = ["food", "culture", "health", "civics", "education"];

const QUERY_MIN_CHARS: usize = 2;
const QUERY_MAX_CHARS: usize = 512;
const K_MAX: usize = 8;
const SNIPPET_CHARS: usize = 180;

#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default = "default_lang_pref")]
    pub lang_pref: Vec<String>,
    #[serde(default)]
    pub use_reranker: bool,
    #[serde(default)]
    pub topic_hint: Option<String>,
    #[serde(default)]
    pub country_hint: Option<String>,
    #[serde(default)]
    pub index_name: Option<String>,
    #[serde(default)]
    pub answer_lang: Option<String>,
}

fn default_k() -> usize {
    5
}

fn default_lang_pref() -> Vec<String> {
    vec!["en".to_string(), "es".to_string()]
}

impl QueryRequest {
    pub fn new(query: &str) -> Self {
        Self {
            query: query.to_string(),
            k: default_k(),
            lang_pref: default_lang_pref(),
            use_reranker: false,
            topic_hint: None,
            country_hint: None,
            index_name: None,
            answer_lang: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Route {
    Faq,
    Rag,
    Error,
    Timeout,
}

#[derive(Debug, Clone, Serialize)]
pub struct Citation {
    pub uri: String,
    pub snippet: String,
    pub date: String,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub route: Route,
    pub answer: String,
    pub citations: Vec<Citation>,
    pub request_id: String,
}

/// Everything a query needs, wired once at startup and immutable after
/// construction. Injected rather than global so tests can assemble their
/// own.
pub struct QueryContext {
    pub pool: SqlitePool,
    pub config: Config,
    pub faq: FaqIndex,
    pub embeddings: crate::embedding::EmbeddingProvider,
    pub chat: Option<Box<dyn ChatModel>>,
    pub reranker: Option<Box<dyn Reranker>>,
}

impl QueryContext {
    /// Answer one query. Always returns a response; never panics or
    /// surfaces raw errors.
    pub async fn ask(&self, request: QueryRequest) -> QueryResponse {
        let request_id = Uuid::new_v4().to_string();

        if let Err(e) = validate(&request) {
            return QueryResponse {
                route: Route::Error,
                answer: e.to_string(),
                citations: Vec::new(),
                request_id,
            };
        }

        let budget = Duration::from_secs(self.config.query.timeout_secs);
        match tokio::time::timeout(budget, self.run(&request)).await {
            Ok(Ok((route, answer, citations))) => QueryResponse {
                route,
                answer,
                citations,
                request_id,
            },
            Ok(Err(stage_err)) => {
                error!(error = %stage_err, request_id, "query failed");
                let answer = if self.config.query.debug {
                    format!("{}: {}", stage_err.code(), stage_err)
                } else {
                    stage_err.code().to_string()
                };
                QueryResponse {
                    route: Route::Error,
                    answer,
                    citations: Vec::new(),
                    request_id,
                }
            }
            Err(_elapsed) => QueryResponse {
                route: Route::Timeout,
                answer: timeout_message(&request.query).to_string(),
                citations: Vec::new(),
                request_id,
            },
        }
    }

    async fn run(
        &self,
        request: &QueryRequest,
    ) -> Result<(Route, String, Vec<Citation>), StageError> {
        if let Some(hit) = self.faq.route(&request.query, &request.lang_pref) {
            debug!("faq short-circuit");
            return Ok((Route::Faq, hit.answer, Vec::new()));
        }

        let normalized = normalize_query(&request.query);
        let index_name = request
            .index_name
            .as_deref()
            .unwrap_or(&self.config.query.default_index_name);

        let retrieval = RetrievalRequest {
            k: request.k,
            langs: &request.lang_pref,
            topic: request.topic_hint.as_deref(),
            country: request.country_hint.as_deref(),
            index_name,
            use_reranker: request.use_reranker,
        };
        let candidates = rank::retrieve(
            &self.pool,
            &self.embeddings,
            self.reranker.as_deref(),
            &self.config.retrieval,
            &normalized,
            &retrieval,
        )
        .await?;

        let synthesis = generate::answer(
            self.chat.as_deref(),
            &request.query,
            &candidates,
            request.answer_lang.as_deref(),
        )
        .await;

        let citations = candidates.iter().map(to_citation).collect();
        Ok((Route::Rag, synthesis.text, citations))
    }
}

fn to_citation(candidate: &Candidate) -> Citation {
    Citation {
        uri: candidate.source_uri.clone(),
        snippet: candidate.text.chars().take(SNIPPET_CHARS).collect(),
        date: candidate.date(),
        score: candidate.score,
    }
}

fn validate(request: &QueryRequest) -> Result<(), StageError> {
    let chars = request.query.trim().chars().count();
    if !(QUERY_MIN_CHARS..=QUERY_MAX_CHARS).contains(&chars) {
        return Err(StageError::Validation(format!(
            "query must be {QUERY_MIN_CHARS}-{QUERY_MAX_CHARS} characters, got {chars}"
        )));
    }
    if !(1..=K_MAX).contains(&request.k) {
        return Err(StageError::Validation(format!(
            "k must be in [1, {K_MAX}], got {}",
            request.k
        )));
    }
    if let Some(topic) = &request.topic_hint {
        if !TOPICS.contains(&topic.as_str()) {
            return Err(StageError::Validation(format!(
                "unknown topic_hint '{topic}'; expected one of {}",
                TOPICS.join(", ")
            )));
        }
    }
    Ok(())
}

fn timeout_message(query: &str) -> &'static str {
    if detect_lang(query) == "es" {
        "La consulta tardó demasiado. Intenta de nuevo."
    } else {
        "The query took too long. Please try again."
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_query_length_bounds() {
        assert!(validate(&QueryRequest::new("¿Qué es una arepa?")).is_ok());
        assert!(validate(&QueryRequest::new("x")).is_err());
        assert!(validate(&QueryRequest::new("  x  ")).is_err());
        assert!(validate(&QueryRequest::new(&"x".repeat(513))).is_err());
        assert!(validate(&QueryRequest::new(&"x".repeat(512))).is_ok());
    }

    #[test]
    fn test_validate_k_bounds() {
        let mut request = QueryRequest::new("¿Qué es una arepa?");
        request.k = 0;
        assert!(validate(&request).is_err());
        request.k = 9;
        assert!(validate(&request).is_err());
        request.k = 8;
        assert!(validate(&request).is_ok());
    }

    #[test]
    fn test_validate_topic_enum() {
        let mut request = QueryRequest::new("¿Qué es una arepa?");
        request.topic_hint = Some("food".to_string());
        assert!(validate(&request).is_ok());
        request.topic_hint = Some("sports".to_string());
        assert!(validate(&request).is_err());
    }

    #[test]
    fn test_request_deserialization_defaults() {
        let request: QueryRequest =
            serde_json::from_str(r#"{"query": "¿Qué es una arepa?"}"#).unwrap();
        assert_eq!(request.k, 5);
        assert_eq!(request.lang_pref, vec!["en", "es"]);
        assert!(!request.use_reranker);
        assert!(request.topic_hint.is_none());
    }

    #[test]
    fn test_response_serializes_stable_shape() {
        let response = QueryResponse {
            route: Route::Timeout,
            answer: "The query took too long. Please try again.".to_string(),
            citations: Vec::new(),
            request_id: "r1".to_string(),
        };
        let value: serde_json::Value = serde_json::to_value(&response).unwrap();
        let keys: std::collections::BTreeSet<&str> =
            value.as_object().unwrap().keys().map(String::as_str).collect();
        let expected: std::collections::BTreeSet<&str> =
            ["route", "answer", "citations", "request_id"].into_iter().collect();
        assert_eq!(keys, expected);
        assert_eq!(value["route"], "timeout");
    }

    #[test]
    fn test_timeout_message_language() {
        assert!(timeout_message("¿Qué es una arepa?").starts_with("La consulta"));
        assert!(timeout_message("What is an arepa?").starts_with("The query"));
    }
}
