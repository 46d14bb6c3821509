//! Index building.
//!
//! Coordinates the indexing flow: corpus → chunking → embedding → storage.
//! All chunks are embedded before the database is touched, so a provider
//! failure leaves the previous collection intact.

use serde::Serialize;
use std::collections::BTreeSet;

use crate::chunk::chunk_document;
use crate::config::Config;
use crate::embedding::{embed_all, EmbeddingProvider};
use crate::error::{Result, VerifyError};
use crate::index::{IndexEntry, IndexStore};
use crate::loader::{self, SkippedFile};
use crate::models::{Chunk, Document};

/// How [`build_index`] treats existing entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    /// Drop the collection and store only the given chunks.
    Rebuild,
    /// Keep other documents; replace the chunks of the given documents.
    Append,
}

/// Summary of one indexing run.
#[derive(Debug, Clone, Serialize)]
pub struct IndexReport {
    pub mode: BuildMode,
    pub collection: String,
    pub embedding_model: String,
    pub documents: usize,
    pub chunks: usize,
    pub embedded: usize,
    /// Entries in the collection after the write.
    pub total_chunks: i64,
    pub generation: i64,
    /// Corpus files left out because they had no extractable text.
    pub skipped: Vec<SkippedFile>,
}

/// Chunk every document with the configured sizes.
pub fn chunk_documents(config: &Config, docs: &[Document]) -> Vec<Chunk> {
    docs.iter()
        .flat_map(|doc| {
            chunk_document(
                doc,
                config.chunking.chunk_size,
                config.chunking.chunk_overlap,
            )
        })
        .collect()
}

/// Embed `chunks` and write them to the configured collection.
pub async fn build_index(
    config: &Config,
    store: &IndexStore,
    embedder: &dyn EmbeddingProvider,
    chunks: Vec<Chunk>,
    mode: BuildMode,
) -> Result<IndexReport> {
    let collection = &config.index.collection;
    let model = embedder.model_name();
    let dims = embedder.dims();

    // Fail before spending embedding calls on an append that would be refused
    if mode == BuildMode::Append {
        if let Some(info) = store.collection_info(collection).await? {
            if info.chunk_count > 0 && (info.embedding_model != model || info.dims != dims) {
                return Err(VerifyError::EmbeddingModelMismatch {
                    indexed: info.embedding_model,
                    indexed_dims: info.dims,
                    configured: model.to_string(),
                    configured_dims: dims,
                });
            }
        }
    }

    let documents = chunks
        .iter()
        .map(|c| c.source_id.as_str())
        .collect::<BTreeSet<_>>()
        .len();

    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    tracing::info!(
        chunks = texts.len(),
        documents,
        model,
        "embedding chunks"
    );
    let vectors = embed_all(embedder, &texts, config.embedding.batch_size).await?;

    let entries: Vec<IndexEntry> = chunks
        .into_iter()
        .zip(vectors)
        .map(|(chunk, vector)| IndexEntry { chunk, vector })
        .collect();
    let embedded = entries.len();

    let info = match mode {
        BuildMode::Rebuild => {
            store
                .replace_collection(collection, model, dims, &entries)
                .await?
        }
        BuildMode::Append => store.upsert_entries(collection, model, dims, &entries).await?,
    };

    Ok(IndexReport {
        mode,
        collection: collection.clone(),
        embedding_model: model.to_string(),
        documents,
        chunks: embedded,
        embedded,
        total_chunks: info.chunk_count,
        generation: info.generation,
        skipped: Vec::new(),
    })
}

/// Load the whole corpus and rebuild the collection from it.
///
/// An empty corpus is allowed and leaves an empty collection behind.
pub async fn rebuild_corpus(
    config: &Config,
    store: &IndexStore,
    embedder: &dyn EmbeddingProvider,
) -> Result<IndexReport> {
    let corpus = loader::load_corpus(config)?;
    let chunks = chunk_documents(config, &corpus.documents);
    let mut report = build_index(config, store, embedder, chunks, BuildMode::Rebuild).await?;
    report.documents = corpus.documents.len();
    report.skipped = corpus.skipped;
    Ok(report)
}

/// Add (or refresh) the given documents without touching the others.
pub async fn append_documents(
    config: &Config,
    store: &IndexStore,
    embedder: &dyn EmbeddingProvider,
    docs: &[Document],
) -> Result<IndexReport> {
    let chunks = chunk_documents(config, docs);
    let mut report = build_index(config, store, embedder, chunks, BuildMode::Append).await?;
    report.documents = docs.len();
    Ok(report)
}
