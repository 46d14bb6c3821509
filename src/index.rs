//! SQLite-backed vector collection.
//!
//! A collection is one row in `collections` (embedding model, dims, chunk
//! count, generation) plus its rows in `chunks`, each carrying the chunk
//! text and its embedding as a little-endian f32 BLOB. Search is brute-force
//! over [`IndexStore::load_entries`]; the corpus is a handful of policy
//! documents, so a full scan per query is cheap.
//!
//! Every write happens in a single transaction, so a reader sees either the
//! previous collection or the new one.

use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::collections::BTreeSet;

use crate::config::Config;
use crate::db;
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{Result, VerifyError};
use crate::migrate;
use crate::models::{Chunk, CollectionInfo};

/// A chunk together with its embedding vector.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

/// Handle to the index database.
#[derive(Clone)]
pub struct IndexStore {
    pool: SqlitePool,
}

impl IndexStore {
    /// Connect to the configured database and create the schema if needed.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Metadata of a collection, or `None` if it was never built.
    pub async fn collection_info(&self, name: &str) -> Result<Option<CollectionInfo>> {
        let row = sqlx::query(
            "SELECT name, embedding_model, dims, chunk_count, generation, built_at \
             FROM collections WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| CollectionInfo {
            name: row.get("name"),
            embedding_model: row.get("embedding_model"),
            dims: row.get::<i64, _>("dims") as usize,
            chunk_count: row.get("chunk_count"),
            generation: row.get("generation"),
            built_at: row.get("built_at"),
        }))
    }

    /// Replace every entry of the collection and bump its generation.
    pub async fn replace_collection(
        &self,
        name: &str,
        embedding_model: &str,
        dims: usize,
        entries: &[IndexEntry],
    ) -> Result<CollectionInfo> {
        let mut tx = self.pool.begin().await?;

        let generation = current_generation(&mut tx, name).await? + 1;
        write_metadata(&mut tx, name, embedding_model, dims, generation).await?;

        sqlx::query("DELETE FROM chunks WHERE collection = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;

        for entry in entries {
            insert_entry(&mut tx, name, entry).await?;
        }

        let info = finish_write(&mut tx, name).await?;
        tx.commit().await?;

        tracing::info!(
            collection = name,
            chunks = info.chunk_count,
            generation = info.generation,
            "replaced collection"
        );
        Ok(info)
    }

    /// Add entries to the collection, replacing any previously stored
    /// chunks of the same documents.
    ///
    /// Fails with [`VerifyError::EmbeddingModelMismatch`] if the collection
    /// already holds vectors from a different model.
    pub async fn upsert_entries(
        &self,
        name: &str,
        embedding_model: &str,
        dims: usize,
        entries: &[IndexEntry],
    ) -> Result<CollectionInfo> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            "SELECT embedding_model, dims, chunk_count FROM collections WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = existing {
            let indexed: String = row.get("embedding_model");
            let indexed_dims = row.get::<i64, _>("dims") as usize;
            let count: i64 = row.get("chunk_count");
            if count > 0 && (indexed != embedding_model || indexed_dims != dims) {
                return Err(VerifyError::EmbeddingModelMismatch {
                    indexed,
                    indexed_dims,
                    configured: embedding_model.to_string(),
                    configured_dims: dims,
                });
            }
        }

        let generation = current_generation(&mut tx, name).await? + 1;
        write_metadata(&mut tx, name, embedding_model, dims, generation).await?;

        let sources: BTreeSet<&str> = entries.iter().map(|e| e.chunk.source_id.as_str()).collect();
        for source_id in sources {
            sqlx::query("DELETE FROM chunks WHERE collection = ? AND source_id = ?")
                .bind(name)
                .bind(source_id)
                .execute(&mut *tx)
                .await?;
        }

        for entry in entries {
            insert_entry(&mut tx, name, entry).await?;
        }

        let info = finish_write(&mut tx, name).await?;
        tx.commit().await?;

        tracing::info!(
            collection = name,
            chunks = info.chunk_count,
            generation = info.generation,
            "appended to collection"
        );
        Ok(info)
    }

    /// All entries of the collection, ordered by source then chunk index.
    pub async fn load_entries(&self, name: &str) -> Result<Vec<IndexEntry>> {
        let rows = sqlx::query(
            "SELECT id, source_id, chunk_index, text, char_offset, hash, embedding \
             FROM chunks WHERE collection = ? ORDER BY source_id, chunk_index",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                IndexEntry {
                    chunk: Chunk {
                        id: row.get("id"),
                        source_id: row.get("source_id"),
                        chunk_index: row.get("chunk_index"),
                        text: row.get("text"),
                        char_offset: row.get("char_offset"),
                        hash: row.get("hash"),
                    },
                    vector: blob_to_vec(&blob),
                }
            })
            .collect())
    }

    /// Indexed documents with their chunk counts, by source.
    pub async fn indexed_sources(&self, name: &str) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT source_id, COUNT(*) AS chunks FROM chunks \
             WHERE collection = ? GROUP BY source_id ORDER BY source_id",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get("source_id"), row.get("chunks")))
            .collect())
    }
}

async fn current_generation(tx: &mut Transaction<'_, Sqlite>, name: &str) -> Result<i64> {
    let generation: Option<i64> =
        sqlx::query_scalar("SELECT generation FROM collections WHERE name = ?")
            .bind(name)
            .fetch_optional(&mut **tx)
            .await?;
    Ok(generation.unwrap_or(0))
}

async fn write_metadata(
    tx: &mut Transaction<'_, Sqlite>,
    name: &str,
    embedding_model: &str,
    dims: usize,
    generation: i64,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO collections (name, embedding_model, dims, chunk_count, generation, built_at)
        VALUES (?, ?, ?, 0, ?, ?)
        ON CONFLICT(name) DO UPDATE SET
            embedding_model = excluded.embedding_model,
            dims = excluded.dims,
            generation = excluded.generation,
            built_at = excluded.built_at
        "#,
    )
    .bind(name)
    .bind(embedding_model)
    .bind(dims as i64)
    .bind(generation)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_entry(tx: &mut Transaction<'_, Sqlite>, name: &str, entry: &IndexEntry) -> Result<()> {
    let chunk = &entry.chunk;
    sqlx::query(
        "INSERT INTO chunks (id, collection, source_id, chunk_index, text, char_offset, hash, embedding) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&chunk.id)
    .bind(name)
    .bind(&chunk.source_id)
    .bind(chunk.chunk_index)
    .bind(&chunk.text)
    .bind(chunk.char_offset)
    .bind(&chunk.hash)
    .bind(vec_to_blob(&entry.vector))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Store the final chunk count and read back the collection row.
async fn finish_write(tx: &mut Transaction<'_, Sqlite>, name: &str) -> Result<CollectionInfo> {
    sqlx::query(
        "UPDATE collections SET chunk_count = (SELECT COUNT(*) FROM chunks WHERE collection = ?) \
         WHERE name = ?",
    )
    .bind(name)
    .bind(name)
    .execute(&mut **tx)
    .await?;

    let row = sqlx::query(
        "SELECT name, embedding_model, dims, chunk_count, generation, built_at \
         FROM collections WHERE name = ?",
    )
    .bind(name)
    .fetch_one(&mut **tx)
    .await?;

    Ok(CollectionInfo {
        name: row.get("name"),
        embedding_model: row.get("embedding_model"),
        dims: row.get::<i64, _>("dims") as usize,
        chunk_count: row.get("chunk_count"),
        generation: row.get("generation"),
        built_at: row.get("built_at"),
    })
}
