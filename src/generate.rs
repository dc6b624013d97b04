//! Answer synthesis: extractive quote selection, abstractive summary, and
//! a rule-based fallback that never fails.
//!
//! The context block sent to the model numbers each candidate from 1;
//! those numbers are the single source of truth mapping `[n]` citation
//! markers back to source URIs. The abstractive stage may only cite
//! numbers backed by an extracted quote — anything else is stripped.
//! Every stage is allowed to fail; the caller always gets an answer, even
//! if it is only "I don't have enough information".

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::warn;

use crate::config::GenerationConfig;
use crate::error::StageError;
use crate::models::Candidate;
use crate::segment::split_sentences;
use crate::text::{detect_lang, entity_guess, fold};

const SYSTEM_PROMPT: &str = "You are a precise bilingual assistant. Answer ONLY using the \
provided context. Respond in the language of the question. Each sentence must include \
citation markers like [1], [2] that map to the numbered sources. If the context lacks the \
facts, say you don't have enough information.";

/// Minimum plausible abstractive answer, in chars; anything shorter falls
/// back to the rule-based path.
const MIN_ANSWER_CHARS: usize = 20;

static MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[(\d+)\]").unwrap());
static DEFINITIONAL_ES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(es|son|significa|consiste|se define como|se refiere a)\b").unwrap()
});
static DEFINITIONAL_EN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(is|are|means|refers to|consists of)\b").unwrap()
});

/// A chat-completion model. The real implementation talks to an
/// OpenAI-style endpoint; tests substitute their own.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Send one (system, user) exchange. With `json_mode` the model is
    /// asked to emit a JSON object.
    async fn chat(&self, system: &str, user: &str, json_mode: bool)
        -> Result<String, StageError>;
}

/// OpenAI-style chat-completions client with one retry and a short,
/// growing backoff.
pub struct OpenAiChat {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    max_retries: u32,
    max_tokens: u32,
}

impl OpenAiChat {
    fn new(config: &GenerationConfig, api_key: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            base_url: config.base_url.clone(),
            max_retries: config.max_retries,
            max_tokens: config.max_answer_tokens,
        })
    }
}

/// Build the configured chat model, or `None` when generation should run
/// rule-based only (provider disabled, or no credentials).
pub fn create_chat(config: &GenerationConfig) -> Option<Box<dyn ChatModel>> {
    if config.provider != "openai" {
        return None;
    }
    let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
    if api_key.is_empty() {
        warn!("OPENAI_API_KEY not set; answers will use the rule-based fallback");
        return None;
    }
    match OpenAiChat::new(config, api_key) {
        Ok(chat) => Some(Box::new(chat)),
        Err(e) => {
            warn!(error = %e, "chat client initialization failed; using rule-based fallback");
            None
        }
    }
}

#[async_trait]
impl ChatModel for OpenAiChat {
    async fn chat(
        &self,
        system: &str,
        user: &str,
        json_mode: bool,
    ) -> Result<String, StageError> {
        let mut body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "temperature": 0.2,
            "max_tokens": self.max_tokens,
        });
        if json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }

        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(400 * u64::from(attempt))).await;
            }

            let resp = self
                .client
                .post(format!("{}/chat/completions", self.base_url))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let payload: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| StageError::Generation(e.to_string()))?;
                        let content = payload["choices"][0]["message"]["content"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string();
                        return Ok(content);
                    }
                    let detail = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(StageError::Generation(format!(
                            "provider error {}: {}",
                            status, detail
                        )));
                        continue;
                    }
                    return Err(StageError::Generation(format!(
                        "provider error {}: {}",
                        status, detail
                    )));
                }
                Err(e) => {
                    last_err = Some(StageError::Generation(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| StageError::Generation("chat failed after retry".to_string())))
    }
}

/// The synthesized answer plus the 1-based source numbers it cites.
#[derive(Debug, Clone)]
pub struct Synthesis {
    pub text: String,
    pub cited: Vec<usize>,
}

/// Render candidates as the numbered context block. The numbering here is
/// what citation markers resolve against.
pub fn build_context(candidates: &[Candidate]) -> String {
    candidates
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let snippet = c.text.replace('\n', " ");
            format!(
                "[{}] {}\nSource: {} (date: {})",
                i + 1,
                snippet.trim(),
                c.source_uri,
                c.date()
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[derive(Debug, Deserialize)]
struct Quote {
    i: usize,
    text: String,
}

#[derive(Debug, Default, Deserialize)]
struct QuoteList {
    #[serde(default)]
    quotes: Vec<Quote>,
}

/// Produce an answer for the query from ranked candidates. Never fails:
/// each stage degrades into the next, ending at a fixed
/// insufficient-information message in the answer language.
pub async fn answer(
    model: Option<&dyn ChatModel>,
    query: &str,
    candidates: &[Candidate],
    answer_lang: Option<&str>,
) -> Synthesis {
    let lang = answer_lang.unwrap_or_else(|| detect_lang(query));

    if candidates.is_empty() {
        return insufficient(lang);
    }
    let Some(model) = model else {
        return rule_based(query, candidates, lang);
    };

    let context = build_context(candidates);

    // Stage 1: extract short verbatim quotes tagged with source numbers.
    let extract_prompt = format!(
        "Question: {query}\n\nContext:\n{context}\n\n\
         Select up to 3 short quotes (max 30 words each) that directly answer the question. \
         Return JSON: {{\"quotes\":[{{\"i\":<source_number>,\"text\":\"...\"}}]}}. \
         If the question is not answerable from the context, return {{\"quotes\":[]}}."
    );
    let quotes = match model.chat(SYSTEM_PROMPT, &extract_prompt, true).await {
        Ok(raw) => parse_quotes(&raw, candidates.len()),
        Err(e) => {
            warn!(error = %e, "extractive stage failed; using rule-based fallback");
            return rule_based(query, candidates, lang);
        }
    };
    if quotes.is_empty() {
        return rule_based(query, candidates, lang);
    }

    // Stage 2: abstractive summary citing only the extracted quotes.
    let quote_block = quotes
        .iter()
        .map(|q| format!("[{}] \"{}\"", q.i, q.text))
        .collect::<Vec<_>>()
        .join("\n");
    let language_name = if lang == "es" { "Spanish" } else { "English" };
    let summary_prompt = format!(
        "Question: {query}\n\nQuotes:\n{quote_block}\n\n\
         Write a concise answer (1-2 sentences) in {language_name}. After each sentence add \
         [n] markers using only the source numbers from the quotes. Do not invent citations."
    );
    let raw = match model.chat(SYSTEM_PROMPT, &summary_prompt, false).await {
        Ok(raw) => raw,
        Err(e) => {
            warn!(error = %e, "abstractive stage failed; using rule-based fallback");
            return rule_based(query, candidates, lang);
        }
    };

    let allowed: BTreeSet<usize> = quotes.iter().map(|q| q.i).collect();
    let (text, cited) = strip_unbacked_markers(&raw, &allowed);
    if text.trim().chars().count() < MIN_ANSWER_CHARS {
        return rule_based(query, candidates, lang);
    }
    Synthesis { text, cited }
}

/// Parse the extractive stage's JSON, salvaging a brace-delimited object
/// from chatty output if needed. Quotes with out-of-range source numbers
/// or empty text are discarded; at most three survive.
fn parse_quotes(raw: &str, n_sources: usize) -> Vec<Quote> {
    let parsed: QuoteList = serde_json::from_str(raw)
        .or_else(|_| {
            let start = raw.find('{');
            let end = raw.rfind('}');
            match (start, end) {
                (Some(s), Some(e)) if s < e => serde_json::from_str(&raw[s..=e]),
                _ => Ok(QuoteList::default()),
            }
        })
        .unwrap_or_default();

    let mut quotes: Vec<Quote> = parsed
        .quotes
        .into_iter()
        .filter(|q| q.i >= 1 && q.i <= n_sources && !q.text.trim().is_empty())
        .collect();
    quotes.truncate(3);
    quotes
}

/// Remove `[n]` markers whose number has no backing quote; return the
/// cleaned text and the cited numbers in ascending order.
fn strip_unbacked_markers(text: &str, allowed: &BTreeSet<usize>) -> (String, Vec<usize>) {
    let mut cited = BTreeSet::new();
    let cleaned = MARKER.replace_all(text, |caps: &regex::Captures<'_>| {
        match caps[1].parse::<usize>() {
            Ok(n) if allowed.contains(&n) => {
                cited.insert(n);
                caps[0].to_string()
            }
            _ => String::new(),
        }
    });
    (
        cleaned.split_whitespace().collect::<Vec<_>>().join(" "),
        cited.into_iter().collect(),
    )
}

/// Deterministic fallback: find a definitional sentence in the top
/// candidates and cite the candidate it came from. If the query names a
/// subject, the sentence must mention it.
fn rule_based(query: &str, candidates: &[Candidate], lang: &str) -> Synthesis {
    let pattern: &Regex = if lang == "es" {
        &*DEFINITIONAL_ES
    } else {
        &*DEFINITIONAL_EN
    };
    let subject = entity_guess(query);

    for (i, candidate) in candidates.iter().take(3).enumerate() {
        for sentence in split_sentences(&candidate.text, 0) {
            if !pattern.is_match(&sentence) {
                continue;
            }
            if let Some(subject) = &subject {
                if !fold(&sentence).contains(subject.as_str()) {
                    continue;
                }
            }
            return Synthesis {
                text: format!("{} [{}]", sentence.trim(), i + 1),
                cited: vec![i + 1],
            };
        }
    }

    insufficient(lang)
}

fn insufficient(lang: &str) -> Synthesis {
    let text = if lang == "es" {
        "No tengo suficiente información para responder esa pregunta."
    } else {
        "I don't have enough information to answer that question."
    };
    Synthesis {
        text: text.to_string(),
        cited: Vec::new(),
    }
}
