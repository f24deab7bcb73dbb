//! Overlapping character-window text chunker.
//!
//! Splits document text into fixed-size character windows where each chunk
//! after the first repeats the trailing `overlap` characters of the previous
//! one. Windows are naive: no sentence-boundary preservation is guaranteed.
//!
//! Each chunk receives a deterministic SHA-256 id over
//! `(filename, ordinal, text)`, so re-processing a byte-identical file yields
//! identical chunk ids, and any content shift changes them.

use sha2::{Digest, Sha256};

use crate::extract::ExtractedSegment;
use crate::models::Chunk;

/// Derive the document id from the filename: the first 16 hex chars of its
/// SHA-256. Two differently-named copies of the same content get different
/// ids; two same-named files collide (accepted limitation).
pub fn doc_id_for(filename: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(filename.as_bytes());
    let hash = format!("{:x}", hasher.finalize());
    hash[..16].to_string()
}

/// Chunk extracted segments, carrying each segment's page attribution
/// onto its chunks. Windows never span a segment boundary, and ordinals
/// are contiguous starting at 0 across the whole document.
///
/// `chunk_size` must be positive; it is validated at config load. Debug
/// builds assert, release builds clamp to 1.
pub fn chunk_segments(
    filename: &str,
    doc_id: &str,
    segments: &[ExtractedSegment],
    chunk_size: usize,
    overlap: usize,
) -> Vec<Chunk> {
    debug_assert!(chunk_size > 0, "chunk_size must be > 0");
    let mut chunks = Vec::new();
    let mut ordinal: i64 = 0;

    for segment in segments {
        for piece in windows(&segment.text, chunk_size, overlap) {
            chunks.push(Chunk {
                chunk_id: chunk_id_for(filename, ordinal, &piece),
                doc_id: doc_id.to_string(),
                filename: filename.to_string(),
                ordinal,
                text: piece,
                page: segment.page,
            });
            ordinal += 1;
        }
    }

    chunks
}

/// Split pageless text into overlapping chunks of `chunk_size` characters.
///
/// Ordinals are contiguous starting at 0; the last chunk may be shorter
/// than `chunk_size`. Empty input yields no chunks. Boundaries are
/// character-based, never splitting inside a UTF-8 sequence.
pub fn chunk_text(
    filename: &str,
    doc_id: &str,
    text: &str,
    chunk_size: usize,
    overlap: usize,
) -> Vec<Chunk> {
    chunk_segments(
        filename,
        doc_id,
        &[ExtractedSegment {
            page: None,
            text: text.to_string(),
        }],
        chunk_size,
        overlap,
    )
}

fn windows(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let chunk_size = chunk_size.max(1);
    let step = chunk_size.saturating_sub(overlap).max(1);

    let chars: Vec<char> = text.chars().collect();
    let mut pieces = Vec::new();
    let mut start = 0usize;

    while start < chars.len() {
        let end = (start + chunk_size).min(chars.len());
        pieces.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += step;
    }

    pieces
}

/// Deterministic chunk identity: SHA-256 over `"{filename}:{ordinal}:{text}"`.
pub fn chunk_id_for(filename: &str, ordinal: i64, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}:{}", filename, ordinal, text).as_bytes());
    format!("{:x}", hasher.finalize())
}
