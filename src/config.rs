use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub faq: FaqConfig,
    #[serde(default)]
    pub query: QueryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    /// How embedding vectors are bound into the store: `blob` (little-endian
    /// f32 bytes) or `json` (array text). Reads accept either; the choice
    /// only affects writes.
    #[serde(default = "default_vector_encoding")]
    pub vector_encoding: String,
}

fn default_vector_encoding() -> String {
    "blob".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: usize,
    /// Sentence fragments shorter than this (in chars) are discarded as
    /// boilerplate before packing.
    #[serde(default = "default_min_sentence_chars")]
    pub min_sentence_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap_tokens(),
            min_sentence_chars: default_min_sentence_chars(),
        }
    }
}

fn default_max_tokens() -> usize {
    300
}
fn default_overlap_tokens() -> usize {
    45
}
fn default_min_sentence_chars() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Candidates with an adjusted score below this are dropped.
    #[serde(default = "default_score_floor")]
    pub score_floor: f32,
    /// Similarity search fetches `max(k, overfetch_k)` rows to leave
    /// headroom for deduplication and reranking.
    #[serde(default = "default_overfetch_k")]
    pub overfetch_k: usize,
    /// Bonus added to candidates that lexically contain the query's
    /// entity guess.
    #[serde(default = "default_entity_boost")]
    pub entity_boost: f32,
    #[serde(default)]
    pub reranker_enabled: bool,
    #[serde(default = "default_reranker_model")]
    pub reranker_model: String,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            score_floor: default_score_floor(),
            overfetch_k: default_overfetch_k(),
            entity_boost: default_entity_boost(),
            reranker_enabled: false,
            reranker_model: default_reranker_model(),
        }
    }
}

fn default_score_floor() -> f32 {
    0.35
}
fn default_overfetch_k() -> usize {
    8
}
fn default_entity_boost() -> f32 {
    0.05
}
fn default_reranker_model() -> String {
    "bge-reranker-base".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `offline` (deterministic pseudo-embeddings) or `openai`.
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_openai_base")]
    pub base_url: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            dims: default_dims(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            base_url: default_openai_base(),
        }
    }
}

fn default_embedding_provider() -> String {
    "offline".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_dims() -> usize {
    384
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    1
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_openai_base() -> String {
    "https://api.openai.com/v1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// `disabled` (rule-based answers only) or `openai`.
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_answer_tokens")]
    pub max_answer_tokens: u32,
    #[serde(default = "default_openai_base")]
    pub base_url: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            model: default_llm_model(),
            timeout_secs: default_llm_timeout_secs(),
            max_retries: default_max_retries(),
            max_answer_tokens: default_max_answer_tokens(),
            base_url: default_openai_base(),
        }
    }
}

fn default_generation_provider() -> String {
    "disabled".to_string()
}
fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    8
}
fn default_max_answer_tokens() -> u32 {
    400
}

#[derive(Debug, Deserialize, Clone)]
pub struct FaqConfig {
    #[serde(default = "default_faq_path")]
    pub path: PathBuf,
    /// Token-sort similarity (0–100) a fuzzy match must reach.
    #[serde(default = "default_fuzzy_threshold")]
    pub fuzzy_threshold: f64,
}

impl Default for FaqConfig {
    fn default() -> Self {
        Self {
            path: default_faq_path(),
            fuzzy_threshold: default_fuzzy_threshold(),
        }
    }
}

fn default_faq_path() -> PathBuf {
    PathBuf::from("./data/faq.jsonl")
}
fn default_fuzzy_threshold() -> f64 {
    88.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    /// Budget for one whole query, validation excluded.
    #[serde(default = "default_query_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_index_name")]
    pub default_index_name: String,
    #[serde(default = "default_k")]
    pub default_k: usize,
    /// When set, error responses carry the underlying error text. For
    /// trusted operators only.
    #[serde(default)]
    pub debug: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_query_timeout_secs(),
            default_index_name: default_index_name(),
            default_k: default_k(),
            debug: false,
        }
    }
}

fn default_query_timeout_secs() -> u64 {
    12
}
fn default_index_name() -> String {
    "c300o45".to_string()
}
fn default_k() -> usize {
    5
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_tokens {
        anyhow::bail!("chunking.overlap_tokens must be < chunking.max_tokens");
    }

    if !(0.0..=1.0).contains(&config.retrieval.score_floor) {
        anyhow::bail!("retrieval.score_floor must be in [0.0, 1.0]");
    }
    if config.retrieval.entity_boost < 0.0 {
        anyhow::bail!("retrieval.entity_boost must be >= 0");
    }

    match config.embedding.provider.as_str() {
        "offline" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be offline or openai.",
            other
        ),
    }
    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    match config.generation.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown generation provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    match config.db.vector_encoding.as_str() {
        "blob" | "json" => {}
        other => anyhow::bail!(
            "Unknown vector encoding: '{}'. Must be blob or json.",
            other
        ),
    }

    if !(0.0..=100.0).contains(&config.faq.fuzzy_threshold) {
        anyhow::bail!("faq.fuzzy_threshold must be in [0, 100]");
    }

    if config.query.timeout_secs == 0 {
        anyhow::bail!("query.timeout_secs must be > 0");
    }
    if !(1..=8).contains(&config.query.default_k) {
        anyhow::bail!("query.default_k must be in [1, 8]");
    }

    Ok(())
}
