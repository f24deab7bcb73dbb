//! Core data models used throughout docchat.
//!
//! These types represent the sessions, documents, chunks, and messages that
//! flow through the ingestion and chat pipeline, and the structures that
//! cross the HTTP or disk boundary.

use serde::{Deserialize, Serialize};

/// A bounded segment of a document's extracted text — the atomic unit of
/// indexing and retrieval.
///
/// `chunk_id` is derived deterministically from `(filename, ordinal, text)`,
/// so re-processing an unchanged file yields the same ids.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub chunk_id: String,
    pub doc_id: String,
    pub filename: String,
    pub ordinal: i64,
    pub text: String,
    /// Page number, when the extraction layer can attribute one.
    pub page: Option<i64>,
}

/// An uploaded and indexed document, owned by a session.
///
/// Owns its `chunk_ids`: deleting a document must delete exactly these
/// chunks from the vector index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub doc_id: String,
    pub session_id: String,
    pub filename: String,
    pub file_type: String,
    pub uploaded_at: i64,
    pub chunk_ids: Vec<String>,
}

/// A chat session. Owns zero or more documents and an ordered message log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub name: String,
    pub created_at: i64,
}

/// A reference back to the document/page/snippet that grounded part of
/// an answer. Deduplicated by `(filename, page)` within one answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceCitation {
    pub filename: String,
    pub page: Option<i64>,
    pub snippet: String,
}

/// A persisted chat message. Immutable once created; `seqno` values within
/// a session are contiguous starting at 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub seqno: i64,
    pub session_id: String,
    pub username: String,
    pub message: String,
    pub sources: Vec<SourceCitation>,
}

/// Process-wide generation settings, stored as a singleton row and read
/// by every generation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    pub model: String,
    pub temperature: f64,
}
