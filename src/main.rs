//! # Platica CLI
//!
//! Command-line interface for the Platica question answering core:
//! database initialization, text ingestion, querying, FAQ checks, and
//! document purges.
//!
//! ## Usage
//!
//! ```bash
//! platica --config ./config/platica.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `platica init` | Create the SQLite database and run schema migrations |
//! | `platica ingest <file>` | Segment, embed, and store a text file |
//! | `platica query "<question>"` | Ask a question; prints the JSON response |
//! | `platica faq "<question>"` | Check whether a question short-circuits to the FAQ |
//! | `platica purge <uri>` | Physically remove a document lineage |

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use platica::config::{self, Config};
use platica::embedding::EmbeddingProvider;
use platica::faq::FaqIndex;
use platica::models::{NewDocument, SourceType};
use platica::query::{QueryContext, QueryRequest};
use platica::{db, generate, ingest, migrate, rerank, store};

#[derive(Parser)]
#[command(
    name = "platica",
    about = "Platica — bilingual retrieval-augmented question answering for community knowledge",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/platica.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Ingest a text file as one document.
    ///
    /// The file is expected to hold already-extracted text; fetching and
    /// HTML/PDF extraction happen before platica.
    Ingest {
        /// Path to the text file.
        file: PathBuf,

        /// Source URI recorded for citations.
        #[arg(long)]
        uri: String,

        /// Source kind: url, pdf, or raw.
        #[arg(long, default_value = "raw")]
        source_type: String,

        /// Document language tag (es, en, es-MX, ...).
        #[arg(long, default_value = "es")]
        lang: String,

        /// Topic classifier (food, culture, health, civics, education).
        #[arg(long)]
        topic: Option<String>,

        /// Country classifier (e.g. VE, MX).
        #[arg(long)]
        country: Option<String>,

        /// Index namespace; defaults to the configured one.
        #[arg(long)]
        index: Option<String>,

        /// Publication date (YYYY-MM-DD).
        #[arg(long)]
        published: Option<String>,
    },

    /// Ask a question and print the JSON response.
    Query {
        /// The question.
        query: String,

        /// Number of citations to return (1-8).
        #[arg(long, default_value_t = 5)]
        k: usize,

        /// Preferred languages, repeatable.
        #[arg(long = "lang")]
        langs: Vec<String>,

        /// Topic hint (food, culture, health, civics, education).
        #[arg(long)]
        topic: Option<String>,

        /// Country hint.
        #[arg(long)]
        country: Option<String>,

        /// Index namespace; defaults to the configured one.
        #[arg(long)]
        index: Option<String>,

        /// Re-score candidates with the cross-encoder, if available.
        #[arg(long)]
        rerank: bool,

        /// Force the answer language (es or en).
        #[arg(long)]
        answer_lang: Option<String>,
    },

    /// Check a question against the FAQ index only.
    Faq {
        /// The question.
        query: String,

        /// Preferred languages, repeatable.
        #[arg(long = "lang")]
        langs: Vec<String>,
    },

    /// Remove every version of a document from retrieval.
    ///
    /// By default rows are physically deleted along with their chunks;
    /// with `--soft` they are only flagged and can be purged later.
    Purge {
        /// Source URI of the document lineage.
        uri: String,

        /// Index namespace; defaults to the configured one.
        #[arg(long)]
        index: Option<String>,

        /// Soft-delete: keep the rows, hide them from retrieval.
        #[arg(long)]
        soft: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg.db).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            file,
            uri,
            source_type,
            lang,
            topic,
            country,
            index,
            published,
        } => {
            let text = std::fs::read_to_string(&file)?;
            let source_type = SourceType::parse(&source_type)
                .ok_or_else(|| anyhow::anyhow!("source type must be url, pdf, or raw"))?;
            let published_at = published.as_deref().map(parse_date).transpose()?;

            let pool = db::connect(&cfg.db).await?;
            migrate::run_migrations(&pool).await?;
            let embeddings = EmbeddingProvider::from_config(&cfg.embedding)?;

            let report = ingest::ingest_text(
                &pool,
                &embeddings,
                &cfg,
                NewDocument {
                    source_uri: uri,
                    source_type,
                    lang,
                    country,
                    topic,
                    index_name: index,
                    published_at,
                    text,
                },
            )
            .await?;

            println!("ingest {}", file.display());
            println!("  document: {}", report.doc_id);
            println!("  version: {}", report.version);
            println!("  chunks written: {}", report.chunks);
            println!("ok");
            pool.close().await;
        }
        Commands::Query {
            query,
            k,
            langs,
            topic,
            country,
            index,
            rerank: use_reranker,
            answer_lang,
        } => {
            let ctx = build_context(&cfg).await?;
            let mut request = QueryRequest::new(&query);
            request.k = k;
            if !langs.is_empty() {
                request.lang_pref = langs;
            }
            request.topic_hint = topic;
            request.country_hint = country;
            request.index_name = index;
            request.use_reranker = use_reranker;
            request.answer_lang = answer_lang;

            let response = ctx.ask(request).await;
            println!("{}", serde_json::to_string_pretty(&response)?);
            ctx.pool.close().await;
        }
        Commands::Faq { query, langs } => {
            let faq = load_faq(&cfg);
            match faq.route(&query, &langs) {
                Some(hit) => {
                    println!("faq hit");
                    println!("  answer: {}", hit.answer);
                    if let Some(uri) = hit.uri {
                        println!("  uri: {}", uri);
                    }
                }
                None => println!("no faq match ({} entries loaded)", faq.len()),
            }
        }
        Commands::Purge { uri, index, soft } => {
            let pool = db::connect(&cfg.db).await?;
            let index_name = index.unwrap_or_else(|| cfg.query.default_index_name.clone());
            if soft {
                let hidden = store::soft_delete_document(&pool, &uri, &index_name).await?;
                println!("soft-deleted {} document version(s) for {}", hidden, uri);
            } else {
                let removed = store::purge_document(&pool, &uri, &index_name).await?;
                println!("purged {} document version(s) for {}", removed, uri);
            }
            pool.close().await;
        }
    }

    Ok(())
}

async fn build_context(cfg: &Config) -> Result<QueryContext> {
    let pool = db::connect(&cfg.db).await?;
    migrate::run_migrations(&pool).await?;
    let embeddings = EmbeddingProvider::from_config(&cfg.embedding)?;
    let chat = generate::create_chat(&cfg.generation);
    let reranker = rerank::create(&cfg.retrieval);
    Ok(QueryContext {
        pool,
        config: cfg.clone(),
        faq: load_faq(cfg),
        embeddings,
        chat,
        reranker,
    })
}

fn load_faq(cfg: &Config) -> FaqIndex {
    match FaqIndex::load(&cfg.faq.path, cfg.faq.fuzzy_threshold) {
        Ok(index) => index,
        Err(e) => {
            warn!(error = %e, "FAQ file not loaded; continuing with an empty index");
            FaqIndex::empty()
        }
    }
}

fn parse_date(s: &str) -> Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| anyhow::anyhow!("invalid date: {s}"))?;
    Ok(midnight.and_utc())
}
