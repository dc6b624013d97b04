//! Core data types shared across the ingestion and retrieval pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a document's text originally came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Url,
    Pdf,
    Raw,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Url => "url",
            SourceType::Pdf => "pdf",
            SourceType::Raw => "raw",
        }
    }

    pub fn parse(s: &str) -> Option<SourceType> {
        match s {
            "url" => Some(SourceType::Url),
            "pdf" => Some(SourceType::Pdf),
            "raw" => Some(SourceType::Raw),
            _ => None,
        }
    }
}

/// A versioned source unit stored in SQLite.
///
/// For a given `(source_uri, index_name)` pair the row with the highest
/// `version` and `approved = true` is the canonical one; soft-deleted rows
/// are never retrievable. Rows are only removed by an explicit purge.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub source_uri: String,
    pub source_type: SourceType,
    pub lang: String,
    pub country: Option<String>,
    pub topic: Option<String>,
    pub version: i64,
    pub approved: bool,
    pub deleted: bool,
    pub published_at: Option<i64>,
    pub index_name: String,
}

/// A contiguous span of a document's text, independently embedded.
///
/// Chunk indices are contiguous and zero-based per document. A chunk is
/// only eligible for retrieval once its embedding is present. Chunks are
/// immutable after insertion.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub doc_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub tokens: i64,
    pub embedding: Option<Vec<f32>>,
    pub section: Option<String>,
    pub index_name: String,
}

/// A retrieval hit, alive only for the duration of one query.
///
/// `score` is the cosine-derived similarity straight from the store;
/// `adjusted` starts equal to it and absorbs ranking adjustments (entity
/// boost). Both nominally live in `[0, 1]` but small floating-point
/// excursions are tolerated.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub doc_id: String,
    pub text: String,
    pub section: Option<String>,
    pub source_uri: String,
    pub lang: String,
    pub published_at: Option<i64>,
    pub score: f32,
    pub adjusted: f32,
}

impl Candidate {
    /// Render the publication date as `YYYY-MM-DD`, or empty when unknown.
    pub fn date(&self) -> String {
        self.published_at
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_default()
    }
}

/// Input to the ingestion pipeline: already-extracted document text plus
/// its metadata. Fetching, content-type sniffing, and HTML/PDF extraction
/// happen upstream.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub source_uri: String,
    pub source_type: SourceType,
    pub lang: String,
    pub country: Option<String>,
    pub topic: Option<String>,
    pub index_name: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub text: String,
}
