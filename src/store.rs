//! Vector store adapter over the SQLite chunk/document tables.
//!
//! Similarity search joins chunks to their owning documents, applies the
//! metadata filters in SQL (approval, soft-delete, language, namespace,
//! topic/country), restricts to the latest approved version of each source
//! URI, and scores the surviving rows by cosine similarity in Rust. The
//! adapter never relaxes filters on its own; widening is the relevance
//! pipeline's call.
//!
//! Embedding vectors are bound in one of two encodings — little-endian f32
//! BLOB or JSON array text — selected by config at write time and
//! auto-detected at read time. The choice is invisible to callers and
//! numerically irrelevant.

use sqlx::{Row, SqliteConnection, SqlitePool};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::StageError;
use crate::models::{Candidate, Chunk, Document};

/// Fixed pause before the single retry of a failed store call.
const RETRY_BACKOFF: Duration = Duration::from_millis(150);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorEncoding {
    Blob,
    Json,
}

impl VectorEncoding {
    pub fn parse(s: &str) -> Option<VectorEncoding> {
        match s {
            "blob" => Some(VectorEncoding::Blob),
            "json" => Some(VectorEncoding::Json),
            _ => None,
        }
    }
}

/// Decode an embedding column value, whichever encoding wrote it.
pub fn decode_vector(raw: &[u8]) -> Vec<f32> {
    if raw.first() == Some(&b'[') {
        serde_json::from_slice::<Vec<f32>>(raw).unwrap_or_default()
    } else {
        blob_to_vec(raw)
    }
}

fn encode_bind<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    encoding: VectorEncoding,
    vector: Option<&[f32]>,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    // Bind types differ per encoding, so the branch happens at the bind
    // site rather than in SQL.
    match (vector, encoding) {
        (Some(v), VectorEncoding::Blob) => query.bind(vec_to_blob(v)),
        (Some(v), VectorEncoding::Json) => {
            query.bind(serde_json::to_string(v).unwrap_or_default())
        }
        (None, _) => query.bind(Option::<Vec<u8>>::None),
    }
}

/// Metadata filters for a similarity search.
#[derive(Debug, Clone)]
pub struct SearchFilters<'a> {
    pub langs: &'a [String],
    pub index_name: &'a str,
    pub topic: Option<&'a str>,
    pub country: Option<&'a str>,
}

/// Top-k similarity search, ranked by cosine similarity descending.
///
/// Scores are `1 − cosine distance`; for normalized vectors that lands in
/// `[0, 1]`, but callers must tolerate small excursions. Transient store
/// failures get one retry before surfacing as [`StageError::Store`].
pub async fn search(
    pool: &SqlitePool,
    query_vec: &[f32],
    k: usize,
    filters: &SearchFilters<'_>,
) -> Result<Vec<Candidate>, StageError> {
    let mut attempt = 0u32;
    let rows = loop {
        match fetch_filtered(pool, filters).await {
            Ok(rows) => break rows,
            Err(e) if attempt == 0 => {
                attempt += 1;
                warn!(error = %e, "store query failed; retrying once");
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
            Err(e) => return Err(StageError::Store(e.to_string())),
        }
    };

    let mut candidates: Vec<Candidate> = rows
        .into_iter()
        .map(|row| {
            let score = cosine_similarity(query_vec, &row.vector);
            Candidate {
                doc_id: row.doc_id,
                text: row.text,
                section: row.section,
                source_uri: row.source_uri,
                lang: row.lang,
                published_at: row.published_at,
                score,
                adjusted: score,
            }
        })
        .collect();

    // Similarity desc, then recency desc, then doc id for a stable order.
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.published_at.cmp(&a.published_at))
            .then(a.doc_id.cmp(&b.doc_id))
    });
    candidates.truncate(k);
    Ok(candidates)
}

struct StoredChunk {
    doc_id: String,
    text: String,
    section: Option<String>,
    source_uri: String,
    lang: String,
    published_at: Option<i64>,
    vector: Vec<f32>,
}

async fn fetch_filtered(
    pool: &SqlitePool,
    filters: &SearchFilters<'_>,
) -> Result<Vec<StoredChunk>, sqlx::Error> {
    let mut sql = String::from(
        r#"
        SELECT c.text, c.section, c.doc_id,
               CAST(c.embedding AS BLOB) AS embedding,
               d.source_uri, d.lang, d.published_at
        FROM chunks c
        JOIN documents d ON d.id = c.doc_id
        WHERE d.approved = 1 AND d.deleted = 0
          AND c.embedding IS NOT NULL
          AND c.index_name = ?
          AND d.version = (
              SELECT MAX(v.version) FROM documents v
              WHERE v.source_uri = d.source_uri
                AND v.index_name = d.index_name
                AND v.approved = 1 AND v.deleted = 0
          )
        "#,
    );

    if !filters.langs.is_empty() {
        let placeholders = vec!["?"; filters.langs.len()].join(", ");
        sql.push_str(&format!(" AND d.lang IN ({placeholders})"));
    }
    if filters.topic.is_some() {
        sql.push_str(" AND d.topic = ?");
    }
    if filters.country.is_some() {
        sql.push_str(" AND d.country = ?");
    }

    let mut query = sqlx::query(&sql).bind(filters.index_name);
    for lang in filters.langs {
        query = query.bind(lang);
    }
    if let Some(topic) = filters.topic {
        query = query.bind(topic);
    }
    if let Some(country) = filters.country {
        query = query.bind(country);
    }

    let rows = query.fetch_all(pool).await?;

    Ok(rows
        .iter()
        .map(|row| {
            let raw: Vec<u8> = row.get("embedding");
            StoredChunk {
                doc_id: row.get("doc_id"),
                text: row.get("text"),
                section: row.get("section"),
                source_uri: row.get("source_uri"),
                lang: row.get("lang"),
                published_at: row.get("published_at"),
                vector: decode_vector(&raw),
            }
        })
        .collect())
}

/// Next version number for a source URI within a namespace.
pub async fn next_version(
    pool: &SqlitePool,
    source_uri: &str,
    index_name: &str,
) -> Result<i64, sqlx::Error> {
    let current: i64 = sqlx::query_scalar(
        "SELECT COALESCE(MAX(version), 0) FROM documents WHERE source_uri = ? AND index_name = ?",
    )
    .bind(source_uri)
    .bind(index_name)
    .fetch_one(pool)
    .await?;
    Ok(current + 1)
}

pub async fn insert_document(
    conn: &mut SqliteConnection,
    doc: &Document,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO documents
            (id, source_uri, source_type, lang, country, topic,
             version, approved, deleted, published_at, index_name)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&doc.id)
    .bind(&doc.source_uri)
    .bind(doc.source_type.as_str())
    .bind(&doc.lang)
    .bind(&doc.country)
    .bind(&doc.topic)
    .bind(doc.version)
    .bind(doc.approved)
    .bind(doc.deleted)
    .bind(doc.published_at)
    .bind(&doc.index_name)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn insert_chunks(
    conn: &mut SqliteConnection,
    chunks: &[Chunk],
    encoding: VectorEncoding,
) -> Result<(), sqlx::Error> {
    for chunk in chunks {
        let query = sqlx::query(
            r#"
            INSERT INTO chunks
                (id, doc_id, chunk_index, text, tokens, section, index_name, embedding)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(chunk.id.clone())
        .bind(chunk.doc_id.clone())
        .bind(chunk.chunk_index)
        .bind(chunk.text.clone())
        .bind(chunk.tokens)
        .bind(chunk.section.clone())
        .bind(chunk.index_name.clone());
        let query = encode_bind(query, encoding, chunk.embedding.as_deref());
        query.execute(&mut *conn).await?;
    }
    Ok(())
}

/// Mark every version of a source URI within a namespace as soft-deleted.
pub async fn soft_delete_document(
    pool: &SqlitePool,
    source_uri: &str,
    index_name: &str,
) -> Result<u64, sqlx::Error> {
    let result =
        sqlx::query("UPDATE documents SET deleted = 1 WHERE source_uri = ? AND index_name = ?")
            .bind(source_uri)
            .bind(index_name)
            .execute(pool)
            .await?;
    Ok(result.rows_affected())
}

/// Physically remove a document lineage and its chunks. The only path
/// that deletes rows.
pub async fn purge_document(
    pool: &SqlitePool,
    source_uri: &str,
    index_name: &str,
) -> Result<u64, sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        r#"
        DELETE FROM chunks WHERE doc_id IN
            (SELECT id FROM documents WHERE source_uri = ? AND index_name = ?)
        "#,
    )
    .bind(source_uri)
    .bind(index_name)
    .execute(&mut *tx)
    .await?;
    let result = sqlx::query("DELETE FROM documents WHERE source_uri = ? AND index_name = ?")
        .bind(source_uri)
        .bind(index_name)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(result.rows_affected())
}

/// Generate a fresh row id.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
