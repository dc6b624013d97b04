//! Ingestion pipeline: extracted text in, versioned document + embedded
//! chunks out.
//!
//! Fetching, allow-listing, and HTML/PDF extraction are upstream concerns;
//! this module takes text that already exists and runs clean → segment →
//! embed → store. Re-ingesting a source URI within the same namespace
//! bumps the version; retrieval only ever sees the newest approved
//! version.

use anyhow::{bail, Result};
use sqlx::SqlitePool;

use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::models::{Chunk, Document, NewDocument};
use crate::segment;
use crate::store::{self, VectorEncoding};
use crate::text;

#[derive(Debug, Clone)]
pub struct IngestReport {
    pub doc_id: String,
    pub version: i64,
    pub chunks: usize,
}

pub async fn ingest_text(
    pool: &SqlitePool,
    embeddings: &EmbeddingProvider,
    config: &Config,
    new: NewDocument,
) -> Result<IngestReport> {
    if new.text.trim().is_empty() {
        bail!("document text is empty");
    }
    if new.source_uri.trim().is_empty() {
        bail!("source_uri is required");
    }

    let index_name = new
        .index_name
        .clone()
        .unwrap_or_else(|| config.query.default_index_name.clone());
    let lang = text::normalize_lang_tag(&new.lang);

    let cleaned = text::clean_text(&new.text);
    let pieces = segment::segment(
        &cleaned,
        config.chunking.max_tokens,
        config.chunking.overlap_tokens,
        config.chunking.min_sentence_chars,
    );
    if pieces.is_empty() {
        bail!("document produced no chunks after cleaning");
    }

    let chunk_texts: Vec<String> = pieces.iter().map(|(t, _)| t.clone()).collect();
    let vectors = embeddings.embed(&chunk_texts).await;

    let version = store::next_version(pool, &new.source_uri, &index_name).await?;
    let doc = Document {
        id: store::new_id(),
        source_uri: new.source_uri.clone(),
        source_type: new.source_type,
        lang: lang.to_string(),
        country: new.country.clone(),
        topic: new.topic.clone(),
        version,
        approved: true,
        deleted: false,
        published_at: new.published_at.map(|dt| dt.timestamp()),
        index_name: index_name.clone(),
    };

    let chunks: Vec<Chunk> = pieces
        .into_iter()
        .zip(vectors)
        .enumerate()
        .map(|(i, ((chunk_text, tokens), vector))| Chunk {
            id: store::new_id(),
            doc_id: doc.id.clone(),
            chunk_index: i as i64,
            text: chunk_text,
            tokens: tokens as i64,
            embedding: Some(vector),
            section: None,
            index_name: index_name.clone(),
        })
        .collect();

    let encoding = VectorEncoding::parse(&config.db.vector_encoding)
        .unwrap_or(VectorEncoding::Blob);

    let mut tx = pool.begin().await?;
    store::insert_document(&mut tx, &doc).await?;
    store::insert_chunks(&mut tx, &chunks, encoding).await?;
    tx.commit().await?;

    Ok(IngestReport {
        doc_id: doc.id,
        version,
        chunks: chunks.len(),
    })
}
