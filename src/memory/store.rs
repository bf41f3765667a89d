// ── Memory: Vector Store (C1) ────────────────────────────────────────────────
// A thin semantic index over SQLite: `(id, agent_id, content, embedding,
// metadata, created_at)`, cosine-ranked top-k retrieval. spec.md §4.1
// deliberately excludes reranking, chunking, and summarization — this store
// does exactly `store` and `search`, nothing more.

use crate::atoms::constants::{MEMORY_SEARCH_DEFAULT_K, MEMORY_SEARCH_MAX_K};
use crate::atoms::error::{FleetError, FleetResult};
use crate::atoms::types::MemorySearchHit;
use crate::memory::embedding::EmbeddingClient;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;

/// Converts a `Vec<f32>` to little-endian bytes for BLOB storage.
pub fn f32_vec_to_bytes(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Converts a BLOB back to `Vec<f32>`.
pub fn bytes_to_f32_vec(bytes: &[u8]) -> Vec<f32> {
    bytes.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect()
}

/// Cosine similarity; returns 0.0 for mismatched or zero-length vectors so a
/// malformed row never ranks first by accident.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-12 {
        0.0
    } else {
        dot / denom
    }
}

pub struct MemoryStore {
    conn: Mutex<Connection>,
    embedding: EmbeddingClient,
    dims: usize,
}

impl MemoryStore {
    pub fn open(path: impl AsRef<Path>, embedding: EmbeddingClient, dims: usize) -> FleetResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        run_migrations(&conn)?;
        Ok(Self { conn: Mutex::new(conn), embedding, dims })
    }

    /// In-memory store for tests: no file, same schema.
    #[cfg(test)]
    pub fn open_in_memory(embedding: EmbeddingClient, dims: usize) -> FleetResult<Self> {
        let conn = Connection::open_in_memory()?;
        run_migrations(&conn)?;
        Ok(Self { conn: Mutex::new(conn), embedding, dims })
    }

    /// `store(agent_id, content, metadata) → record_id` (spec.md §4.1).
    /// Embeds via the external endpoint first; a failure there is
    /// `EmbeddingUnavailable` and nothing is persisted. A dimension mismatch
    /// is rejected as `ConfigError`, never silently truncated (spec.md §8
    /// boundary behaviors).
    pub async fn store(
        &self,
        agent_id: &str,
        content: &str,
        metadata: serde_json::Value,
    ) -> FleetResult<String> {
        if content.is_empty() {
            return Err(FleetError::config("memory content must be non-empty"));
        }
        let embedding = self.embedding.embed(content).await?;
        if embedding.len() != self.dims {
            return Err(FleetError::config(format!(
                "embedding dimension {} does not match configured dimension {}",
                embedding.len(),
                self.dims
            )));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let bytes = f32_vec_to_bytes(&embedding);
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO memories (id, agent_id, content, embedding, metadata, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                agent_id,
                content,
                bytes,
                metadata.to_string(),
                created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| FleetError::StoreUnavailable(e.to_string()))?;
        Ok(id)
    }

    /// `search(agent_id?, query_text, k) → [(content, similarity, metadata,
    /// created_at)]` (spec.md §4.1). `agent_id = None` searches cross-agent.
    /// Ties (equal similarity) break by insertion order, newer later, by
    /// stable-sorting on `created_at` ascending before the similarity sort.
    pub async fn search(
        &self,
        agent_id: Option<&str>,
        query_text: &str,
        k: usize,
    ) -> FleetResult<Vec<MemorySearchHit>> {
        let k = if k == 0 { MEMORY_SEARCH_DEFAULT_K } else { k.min(MEMORY_SEARCH_MAX_K) };
        let query_embedding = self.embedding.embed(query_text).await?;

        let rows: Vec<(String, Vec<u8>, String, String)> = {
            let conn = self.conn.lock();
            let mut collect = |sql: &str, agent_id: Option<&str>| -> rusqlite::Result<Vec<(String, Vec<u8>, String, String)>> {
                let mut stmt = conn.prepare(sql)?;
                let mapped = |row: &rusqlite::Row| -> rusqlite::Result<(String, Vec<u8>, String, String)> {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                };
                let iter = if let Some(aid) = agent_id {
                    stmt.query_map(params![aid], mapped)?
                } else {
                    stmt.query_map([], mapped)?
                };
                iter.collect()
            };
            match agent_id {
                Some(aid) => collect(
                    "SELECT content, embedding, metadata, created_at FROM memories WHERE agent_id = ?1 ORDER BY created_at ASC",
                    Some(aid),
                ),
                None => collect(
                    "SELECT content, embedding, metadata, created_at FROM memories ORDER BY created_at ASC",
                    None,
                ),
            }
            .map_err(|e| FleetError::Database(e))?
        };

        let mut scored: Vec<MemorySearchHit> = rows
            .into_iter()
            .map(|(content, blob, metadata, created_at)| {
                let stored_embedding = bytes_to_f32_vec(&blob);
                let similarity = cosine_similarity(&query_embedding, &stored_embedding) as f32;
                MemorySearchHit {
                    content,
                    similarity,
                    metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
                    created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
                }
            })
            .collect();

        // Stable sort descending by similarity; input was already ascending
        // by created_at, so ties keep newer-later ordering (spec.md §4.1).
        scored.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    /// Round-trips a trivial query (spec.md §4.1 `health()`).
    pub async fn health(&self) -> FleetResult<()> {
        self.embedding.health().await?;
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |_| Ok(())).map_err(|e| FleetError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }
}

fn run_migrations(conn: &Connection) -> FleetResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS memories (
            id TEXT PRIMARY KEY,
            agent_id TEXT NOT NULL,
            content TEXT NOT NULL,
            embedding BLOB NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_memories_agent_id ON memories(agent_id);
        CREATE INDEX IF NOT EXISTS idx_memories_created_at ON memories(created_at);",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_similarity_identical_vectors_is_one() {
        let v = vec![1.0f32, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_orthogonal_is_zero() {
        let a = vec![1.0f32, 0.0];
        let b = vec![0.0f32, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_mismatched_lengths_is_zero() {
        let a = vec![1.0f32, 2.0];
        let b = vec![1.0f32];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn bytes_roundtrip_preserves_values() {
        let v = vec![0.5f32, -1.25, 3.0];
        let bytes = f32_vec_to_bytes(&v);
        assert_eq!(bytes_to_f32_vec(&bytes), v);
    }
}
