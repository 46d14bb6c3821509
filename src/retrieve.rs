//! Similarity retrieval over a built collection.
//!
//! The query is embedded with the same provider that built the index and
//! every stored vector is scored by cosine similarity. Results are ordered
//! by descending score; equal scores fall back to `(source_id,
//! chunk_index)` so the same query always yields the same list.

use std::cmp::Ordering;

use crate::embedding::{cosine_similarity, embed_query, EmbeddingProvider};
use crate::error::{Result, VerifyError};
use crate::index::{IndexEntry, IndexStore};
use crate::models::RetrievedChunk;

/// Return the `k` entries most similar to `query`.
///
/// Fails with [`VerifyError::InvalidArgument`] for `k == 0`,
/// [`VerifyError::EmptyIndex`] if the collection is missing or empty, and
/// [`VerifyError::EmbeddingModelMismatch`] if the collection was built
/// with a different model than `embedder`.
pub async fn retrieve(
    store: &IndexStore,
    embedder: &dyn EmbeddingProvider,
    collection: &str,
    query: &str,
    k: usize,
    min_score: f32,
) -> Result<Vec<RetrievedChunk>> {
    if k == 0 {
        return Err(VerifyError::InvalidArgument(
            "top_k must be at least 1".to_string(),
        ));
    }

    let info = match store.collection_info(collection).await? {
        Some(info) if info.chunk_count > 0 => info,
        _ => return Err(VerifyError::EmptyIndex),
    };

    if info.embedding_model != embedder.model_name() || info.dims != embedder.dims() {
        return Err(VerifyError::EmbeddingModelMismatch {
            indexed: info.embedding_model,
            indexed_dims: info.dims,
            configured: embedder.model_name().to_string(),
            configured_dims: embedder.dims(),
        });
    }

    let entries = store.load_entries(collection).await?;
    if entries.is_empty() {
        return Err(VerifyError::EmptyIndex);
    }

    let query_vec = embed_query(embedder, query).await?;
    let results = rank(&query_vec, entries, k, min_score);

    tracing::debug!(
        collection,
        k,
        returned = results.len(),
        top_score = results.first().map(|r| r.score).unwrap_or(0.0),
        "retrieved chunks"
    );
    Ok(results)
}

/// Score, sort and truncate. Entries scoring below `min_score` are dropped.
pub fn rank(query: &[f32], entries: Vec<IndexEntry>, k: usize, min_score: f32) -> Vec<RetrievedChunk> {
    let mut scored: Vec<RetrievedChunk> = entries
        .into_iter()
        .map(|entry| RetrievedChunk {
            score: cosine_similarity(query, &entry.vector),
            chunk: entry.chunk,
        })
        .filter(|r| r.score >= min_score || min_score <= 0.0)
        .collect();

    scored.sort_by(compare_results);
    scored.truncate(k);
    scored
}

fn compare_results(a: &RetrievedChunk, b: &RetrievedChunk) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.chunk.source_id.cmp(&b.chunk.source_id))
        .then_with(|| a.chunk.chunk_index.cmp(&b.chunk.chunk_index))
}
