//! Core data models used throughout the verifier.
//!
//! These types represent the documents, chunks, retrieval results and
//! answer records that flow through the ingestion and answering pipeline.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, VerifyError};

/// File types accepted into the corpus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Pdf,
    Text,
    Markdown,
}

impl DocumentKind {
    /// Classify a path by its extension (case-insensitive).
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "pdf" => Ok(DocumentKind::Pdf),
            "txt" => Ok(DocumentKind::Text),
            "md" | "markdown" => Ok(DocumentKind::Markdown),
            "" => Err(VerifyError::UnsupportedFormat(format!(
                "{} (no extension)",
                path.display()
            ))),
            other => Err(VerifyError::UnsupportedFormat(format!(".{}", other))),
        }
    }

}

/// A corpus file after text extraction.
#[derive(Debug, Clone)]
pub struct Document {
    /// File name, used as the citation label.
    pub source_id: String,
    /// Corpus folder the file was found in (`sample_docs` or `uploads`).
    pub folder: String,
    /// Path relative to the corpus folder.
    pub relative_path: String,
    pub kind: DocumentKind,
    pub text: String,
    /// Hex SHA-256 of the raw file bytes.
    pub content_hash: String,
}

/// A contiguous span of one document's text.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub source_id: String,
    pub chunk_index: i64,
    pub text: String,
    /// Character (not byte) offset of the chunk start in the document text.
    pub char_offset: i64,
    pub hash: String,
}

/// A stored chunk paired with its similarity to the query.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk: Chunk,
    pub score: f32,
}

/// A chunk supplied to the model as context, as shown to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub source_id: String,
    pub chunk_index: i64,
    pub score: f32,
    pub text: String,
}

impl From<&RetrievedChunk> for Citation {
    fn from(r: &RetrievedChunk) -> Self {
        Citation {
            source_id: r.chunk.source_id.clone(),
            chunk_index: r.chunk.chunk_index,
            score: r.score,
            text: r.chunk.text.clone(),
        }
    }
}

/// The outcome of one verification request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub claim: String,
    pub answer: String,
    pub citations: Vec<Citation>,
    /// Evidence summary supplied by the user alongside the claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
    /// Model-written summary of the retrieved context, when requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Screening annotations attached under the `warn` policy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// One row of the corpus document table.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentEntry {
    pub file: String,
    pub folder: String,
    pub size_kb: f64,
}

/// Metadata of a built collection.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionInfo {
    pub name: String,
    pub embedding_model: String,
    pub dims: usize,
    pub chunk_count: i64,
    pub generation: i64,
    /// Unix timestamp of the last write.
    pub built_at: i64,
}
