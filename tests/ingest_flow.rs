//! Ingestion pipeline tests over temporary directories with a
//! deterministic in-process embedding backend.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::RwLock;

use docchat::chunk::doc_id_for;
use docchat::config::{load_config, Config};
use docchat::db;
use docchat::embedding::Embedder;
use docchat::index::{purge_chunks, DocFilter, VectorIndex};
use docchat::ingest::process_documents;
use docchat::migrate;
use docchat::store::Store;

// ─── Test backends ──────────────────────────────────────────────────

struct HashEmbedder;

fn embed_one(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; 16];
    for b in text.bytes() {
        v[(b % 16) as usize] += 1.0;
    }
    v
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash-histogram"
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| embed_one(t)).collect())
    }
}

struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    fn model_name(&self) -> &str {
        "failing"
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        anyhow::bail!("embedding backend offline")
    }
}

// ─── Fixtures ───────────────────────────────────────────────────────

struct TestEnv {
    _tmp: TempDir,
    config: Config,
    store: Arc<Store>,
    files_dir: PathBuf,
}

async fn setup() -> TestEnv {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("alpha.txt"),
        "Alpha document about Rust programming. ".repeat(10),
    )
    .unwrap();
    fs::write(
        files_dir.join("beta.md"),
        "# Beta\n\nBeta document about machine learning. ".repeat(10),
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/docchat.db"

[storage]
files_dir = "{root}/files"
index_dir = "{root}/index"

[chunking]
chunk_size = 120
overlap = 20
"#,
        root = root.display()
    );
    let config_path = root.join("docchat.toml");
    fs::write(&config_path, config_content).unwrap();
    let config = load_config(&config_path).unwrap();

    let pool = db::connect(&config.db.path).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();

    TestEnv {
        _tmp: tmp,
        config,
        store: Arc::new(Store::new(pool)),
        files_dir,
    }
}

fn empty_index() -> Arc<RwLock<VectorIndex>> {
    Arc::new(RwLock::new(VectorIndex::new()))
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn process_indexes_supported_files() {
    let env = setup().await;
    let index = empty_index();

    let outcome = process_documents(&env.config, &env.store, &index, &HashEmbedder, "")
        .await
        .unwrap();

    assert_eq!(outcome.documents_indexed, 2);
    assert!(outcome.chunks_indexed > 0);
    assert_eq!(outcome.skipped_existing, 0);
    assert!(outcome.failures.is_empty());

    let doc = env
        .store
        .get_document(&doc_id_for("alpha.txt"))
        .await
        .unwrap()
        .expect("alpha registered");
    assert_eq!(doc.filename, "alpha.txt");
    assert_eq!(doc.file_type, "txt");
    assert!(!doc.chunk_ids.is_empty());

    assert_eq!(
        index.read().await.len() as u64,
        outcome.chunks_indexed,
        "every embedded chunk is in the index"
    );
    assert!(env.config.storage.index_dir.join("index.json").exists());
}

#[tokio::test]
async fn reprocessing_is_idempotent() {
    let env = setup().await;
    let index = empty_index();

    process_documents(&env.config, &env.store, &index, &HashEmbedder, "")
        .await
        .unwrap();
    let before = index.read().await.len();

    let second = process_documents(&env.config, &env.store, &index, &HashEmbedder, "")
        .await
        .unwrap();
    assert_eq!(second.documents_indexed, 0);
    assert_eq!(second.skipped_existing, 2);
    assert_eq!(index.read().await.len(), before);
}

#[tokio::test]
async fn unsupported_files_are_ignored() {
    let env = setup().await;
    fs::write(env.files_dir.join("notes.xyz"), "not a supported format").unwrap();
    let index = empty_index();

    let outcome = process_documents(&env.config, &env.store, &index, &HashEmbedder, "")
        .await
        .unwrap();

    assert_eq!(outcome.documents_indexed, 2);
    assert!(outcome.failures.is_empty());
    assert!(env
        .store
        .get_document(&doc_id_for("notes.xyz"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn embedding_failure_registers_nothing() {
    let env = setup().await;
    let index = empty_index();

    let outcome = process_documents(&env.config, &env.store, &index, &FailingEmbedder, "")
        .await
        .unwrap();

    assert_eq!(outcome.documents_indexed, 0);
    assert_eq!(outcome.failures.len(), 2);
    assert!(index.read().await.is_empty());
    assert!(env
        .store
        .get_document(&doc_id_for("alpha.txt"))
        .await
        .unwrap()
        .is_none());

    // A later run with a working backend picks the files up.
    let retry = process_documents(&env.config, &env.store, &index, &HashEmbedder, "")
        .await
        .unwrap();
    assert_eq!(retry.documents_indexed, 2);
}

#[tokio::test]
async fn persisted_index_reloads_when_memory_is_empty() {
    let env = setup().await;

    let first = empty_index();
    process_documents(&env.config, &env.store, &first, &HashEmbedder, "")
        .await
        .unwrap();
    let persisted_len = first.read().await.len();
    assert!(persisted_len > 0);

    // Fresh process start: empty in-memory index, documents already
    // registered, so nothing is re-indexed and the saved index is loaded.
    let second = empty_index();
    let outcome = process_documents(&env.config, &env.store, &second, &HashEmbedder, "")
        .await
        .unwrap();
    assert_eq!(outcome.skipped_existing, 2);
    assert_eq!(second.read().await.len(), persisted_len);
}

#[tokio::test]
async fn document_delete_purges_index_and_persists() {
    let env = setup().await;
    let index = empty_index();
    process_documents(&env.config, &env.store, &index, &HashEmbedder, "")
        .await
        .unwrap();

    let doc_id = doc_id_for("alpha.txt");
    let doc = env
        .store
        .delete_document(&doc_id)
        .await
        .unwrap()
        .expect("alpha registered");
    let removed = purge_chunks(&index, &env.config.storage.index_dir, &doc.chunk_ids)
        .await
        .unwrap();
    assert_eq!(removed, doc.chunk_ids.len());

    // Searches scoped to the deleted document find nothing.
    let query = embed_one("Alpha document about Rust programming.");
    let hits = index
        .read()
        .await
        .search(&query, 7, &DocFilter::documents([doc_id.clone()]));
    assert!(hits.is_empty());

    // The purge was flushed: a reload sees the shrunken index.
    let reloaded = VectorIndex::load(&env.config.storage.index_dir)
        .unwrap()
        .expect("index file present");
    assert_eq!(reloaded.len(), index.read().await.len());
    assert!(env.store.get_document(&doc_id).await.unwrap().is_none());
}
