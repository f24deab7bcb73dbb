//! Document ingestion pipeline.
//!
//! Coordinates the full flow for the upload directory: extract → chunk →
//! embed → index → register. Embedding failures abort the whole batch for
//! that file (no partial chunk indexing) and skip its registration, so no
//! document record ever points at unindexed chunks. Failures are isolated
//! per file and never abort the rest of the scan.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::chunk::{chunk_segments, doc_id_for};
use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::DocChatError;
use crate::extract;
use crate::index::VectorIndex;
use crate::models::Document;
use crate::store::Store;

#[derive(Debug, Default)]
pub struct IngestOutcome {
    pub documents_indexed: u64,
    pub chunks_indexed: u64,
    pub skipped_existing: u64,
    /// `(filename, error)` per failed file; registration was skipped.
    pub failures: Vec<(String, String)>,
}

/// Process every supported file in the upload directory for a session.
///
/// Already-registered documents (same filename hash) are skipped, making
/// re-processing idempotent. After any additions the index is flushed to
/// the configured index directory. With nothing to add and no live index,
/// a previously persisted index is loaded instead (the startup path).
pub async fn process_documents(
    config: &Config,
    store: &Store,
    index: &Arc<RwLock<VectorIndex>>,
    embedder: &dyn Embedder,
    session_id: &str,
) -> Result<IngestOutcome> {
    let files_dir = &config.storage.files_dir;
    std::fs::create_dir_all(files_dir)?;

    let mut outcome = IngestOutcome::default();
    let mut entries: Vec<_> = std::fs::read_dir(files_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && extract::is_supported(p))
        .collect();
    entries.sort();

    for path in entries {
        let filename = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_string(),
            None => continue,
        };

        match ingest_file(config, store, index, embedder, &path, &filename, session_id).await {
            Ok(IngestFileResult::Indexed { chunks }) => {
                outcome.documents_indexed += 1;
                outcome.chunks_indexed += chunks;
            }
            Ok(IngestFileResult::AlreadyRegistered) => outcome.skipped_existing += 1,
            Ok(IngestFileResult::Empty) => {
                warn!(filename, "no text extracted, skipping");
            }
            Err(e) => {
                error!(filename, error = %e, "ingestion failed, registration skipped");
                outcome.failures.push((filename, e.to_string()));
            }
        }
    }

    if outcome.documents_indexed > 0 {
        let guard = index.write().await;
        guard.save(&config.storage.index_dir)?;
        info!(
            documents = outcome.documents_indexed,
            chunks = outcome.chunks_indexed,
            "indexed documents persisted"
        );
    } else if index.read().await.is_empty() {
        if let Some(loaded) = VectorIndex::load(&config.storage.index_dir)? {
            info!(chunks = loaded.len(), "loaded persisted vector index");
            *index.write().await = loaded;
        }
    }

    Ok(outcome)
}

enum IngestFileResult {
    Indexed { chunks: u64 },
    AlreadyRegistered,
    Empty,
}

async fn ingest_file(
    config: &Config,
    store: &Store,
    index: &Arc<RwLock<VectorIndex>>,
    embedder: &dyn Embedder,
    path: &Path,
    filename: &str,
    session_id: &str,
) -> Result<IngestFileResult, DocChatError> {
    let doc_id = doc_id_for(filename);
    let already = store
        .get_document(&doc_id)
        .await
        .map_err(|e| DocChatError::Ingestion(e.to_string()))?;
    if already.is_some() {
        return Ok(IngestFileResult::AlreadyRegistered);
    }

    let segments =
        extract::extract_text(path).map_err(|e| DocChatError::Ingestion(e.to_string()))?;
    let chunks = chunk_segments(
        filename,
        &doc_id,
        &segments,
        config.chunking.chunk_size,
        config.chunking.overlap,
    );
    if chunks.is_empty() {
        return Ok(IngestFileResult::Empty);
    }

    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let embeddings = embedder
        .embed(&texts)
        .await
        .map_err(|e| DocChatError::Ingestion(e.to_string()))?;

    let chunk_ids: Vec<String> = chunks.iter().map(|c| c.chunk_id.clone()).collect();
    let chunk_count = chunks.len() as u64;

    index
        .write()
        .await
        .add_entries(chunks, embeddings)
        .map_err(|e| DocChatError::Ingestion(e.to_string()))?;

    let file_type = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    let registered = store
        .register_document(&Document {
            doc_id,
            session_id: session_id.to_string(),
            filename: filename.to_string(),
            file_type,
            uploaded_at: Utc::now().timestamp(),
            chunk_ids: chunk_ids.clone(),
        })
        .await;
    if let Err(e) = registered {
        // Roll the chunks back out so no indexed chunk is left without an
        // owning document record.
        index.write().await.delete(&chunk_ids);
        return Err(DocChatError::Ingestion(e.to_string()));
    }

    Ok(IngestFileResult::Indexed {
        chunks: chunk_count,
    })
}
