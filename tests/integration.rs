// ── Integration: Cross-Agent Memory Scoping (spec.md §8 S5) ─────────────────
// Exercises `MemoryStore` against a real (temp-file) SQLite database and a
// local fake embedding endpoint — no live Ollama/OpenAI access, per
// SPEC_FULL.md's test tooling section. S1/S2/S6 are unit-tested alongside
// the code they exercise (`conversation::tests`, `gateway::identity::tests`);
// S3/S4 alongside `supervisor::tests`. This binary covers the one scenario
// that genuinely needs a real database file plus a real (if fake) HTTP round
// trip wired together.

use agentfleet::memory::{EmbeddingClient, MemoryStore};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;

/// A fixed, content-dependent 3-dimensional embedding: keyword presence maps
/// onto the first two dimensions, so `cosine_similarity` ranks stored
/// records the same way a real embedding model would for these inputs.
fn fake_embed(text: &str) -> Vec<f32> {
    let lower = text.to_lowercase();
    vec![if lower.contains("alpha") { 1.0 } else { 0.0 }, if lower.contains("beta") { 1.0 } else { 0.0 }, 0.01]
}

async fn embed_handler(Json(body): Json<Value>) -> Json<Value> {
    let input = body["input"].as_str().unwrap_or_default();
    Json(json!({"embeddings": [fake_embed(input)]}))
}

async fn spawn_fake_embedding_server() -> String {
    let router = Router::new().route("/api/embed", post(embed_handler));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn temp_db_path() -> std::path::PathBuf {
    std::env::temp_dir().join(format!("agentfleet-test-{}.sqlite3", uuid::Uuid::new_v4()))
}

#[tokio::test]
async fn s5_cross_agent_memory_scoping() {
    let base_url = spawn_fake_embedding_server().await;
    let db_path = temp_db_path();
    let store = Arc::new(MemoryStore::open(&db_path, EmbeddingClient::new(&base_url, "fake-model"), 3).unwrap());

    store.store("A1", "alpha", json!({})).await.unwrap();
    store.store("A2", "beta", json!({})).await.unwrap();

    let scoped = store.search(Some("A1"), "alpha or beta", 5).await.unwrap();
    assert_eq!(scoped.len(), 1);
    assert_eq!(scoped[0].content, "alpha");

    let unscoped = store.search(None, "alpha or beta", 5).await.unwrap();
    assert_eq!(unscoped.len(), 2);
    assert_eq!(unscoped[0].content, "alpha", "alpha was stored first and must rank no lower than beta on a tie");
    assert_eq!(unscoped[1].content, "beta");

    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn s5_empty_scope_returns_no_hits() {
    let base_url = spawn_fake_embedding_server().await;
    let db_path = temp_db_path();
    let store = Arc::new(MemoryStore::open(&db_path, EmbeddingClient::new(&base_url, "fake-model"), 3).unwrap());

    store.store("A1", "alpha", json!({})).await.unwrap();

    let other_agent = store.search(Some("A2"), "alpha", 5).await.unwrap();
    assert!(other_agent.is_empty());

    let _ = std::fs::remove_file(&db_path);
}
