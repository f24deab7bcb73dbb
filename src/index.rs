//! In-memory vector index with directory persistence.
//!
//! Maps `chunk_id -> (embedding, chunk)` and supports incremental add
//! (union merge), filtered cosine-similarity search, deletion by chunk-id
//! set, and JSON save/load to a directory. The index is owned by the
//! application state behind a `tokio::sync::RwLock`: reads may run
//! concurrently, while add/delete/persist take the write lock so mutation
//! and serialization are globally single-writer.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::models::Chunk;

const INDEX_FILE: &str = "index.json";

/// Typed retrieval predicate: restricts eligible chunks to a document-id
/// subset. An empty set means no restriction. Being a plain value (not a
/// closure) it can cross serialization boundaries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocFilter {
    doc_ids: BTreeSet<String>,
}

impl DocFilter {
    /// No restriction: every chunk is eligible.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to the given document ids. An empty iterator behaves
    /// like [`DocFilter::all`].
    pub fn documents<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            doc_ids: ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn matches(&self, chunk: &Chunk) -> bool {
        self.doc_ids.is_empty() || self.doc_ids.contains(&chunk.doc_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub embedding: Vec<f32>,
    pub chunk: Chunk,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct VectorIndex {
    entries: HashMap<String, IndexEntry>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// An empty index means no documents have been processed yet; the
    /// answer pipeline short-circuits on this.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.entries.contains_key(chunk_id)
    }

    /// Insert chunk vectors. Logically a union merge: existing entries are
    /// untouched (identical chunk ids carry identical content by
    /// construction). Chunk and embedding counts must match; a mismatch
    /// aborts the whole batch with nothing committed.
    pub fn add_entries(&mut self, chunks: Vec<Chunk>, embeddings: Vec<Vec<f32>>) -> Result<usize> {
        if chunks.len() != embeddings.len() {
            bail!(
                "embedding count {} does not match chunk count {}",
                embeddings.len(),
                chunks.len()
            );
        }
        let mut added = 0;
        for (chunk, embedding) in chunks.into_iter().zip(embeddings.into_iter()) {
            let id = chunk.chunk_id.clone();
            if self
                .entries
                .insert(id, IndexEntry { embedding, chunk })
                .is_none()
            {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Top-k nearest neighbors by cosine similarity, restricted to chunks
    /// matching `filter`. The filter is applied before truncation, so k
    /// results are returned whenever at least k chunks satisfy it. Ranking
    /// is descending by score with a deterministic chunk-id tiebreak.
    pub fn search(&self, query: &[f32], k: usize, filter: &DocFilter) -> Vec<(Chunk, f32)> {
        let mut scored: Vec<(&IndexEntry, f32)> = self
            .entries
            .values()
            .filter(|e| filter.matches(&e.chunk))
            .map(|e| (e, cosine_similarity(query, &e.embedding)))
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.chunk.chunk_id.cmp(&b.0.chunk.chunk_id))
        });
        scored.truncate(k);

        scored
            .into_iter()
            .map(|(e, score)| (e.chunk.clone(), score))
            .collect()
    }

    /// Remove vectors for the given ids. Unknown ids are a no-op.
    /// The caller is expected to follow up with [`VectorIndex::save`].
    pub fn delete(&mut self, chunk_ids: &[String]) -> usize {
        let mut removed = 0;
        for id in chunk_ids {
            if self.entries.remove(id).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Serialize the index into `<dir>/index.json`, creating the directory
    /// if needed.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create index dir: {}", dir.display()))?;
        let path = dir.join(INDEX_FILE);
        let json = serde_json::to_vec(self)?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write index file: {}", path.display()))?;
        Ok(())
    }

    /// Load a persisted index. A missing directory or file yields
    /// `Ok(None)` (absent index), not an error.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(INDEX_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path)
            .with_context(|| format!("Failed to read index file: {}", path.display()))?;
        let index: VectorIndex = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse index file: {}", path.display()))?;
        Ok(Some(index))
    }
}

/// Delete chunks under the write lock and flush the index to disk.
pub async fn purge_chunks(
    index: &RwLock<VectorIndex>,
    index_dir: &Path,
    chunk_ids: &[String],
) -> Result<usize> {
    let mut guard = index.write().await;
    let removed = guard.delete(chunk_ids);
    guard.save(index_dir)?;
    Ok(removed)
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
