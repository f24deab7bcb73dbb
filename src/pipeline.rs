//! Retrieval-augmented answer pipeline.
//!
//! Orchestrates retrieval + generation for one-shot and streaming answers,
//! extracts deduplicated source citations from the retrieved context, and
//! persists every assistant turn — including error turns — through the
//! store so chat history never silently drops a turn.
//!
//! Streaming contract: the consumer receives `Token` events whose
//! concatenation equals the blocking answer text, followed by exactly one
//! `Done` event carrying the source list (empty on failure). The producer
//! persists the assistant message only after `Done` is delivered; a
//! consumer that disconnects earlier closes the channel and nothing is
//! persisted.

use std::collections::HashSet;
use std::sync::Arc;

use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use crate::embedding::{embed_query, Embedder};
use crate::error::DocChatError;
use crate::index::{DocFilter, VectorIndex};
use crate::llm::{GenerationRequest, Generator};
use crate::models::{Chunk, SourceCitation};
use crate::store::Store;

/// Fixed reply when no documents have been processed yet. Persisted as a
/// normal assistant message.
pub const NO_DOCUMENTS_MESSAGE: &str =
    "No documents have been processed yet. Please upload and process documents first.";

const ANSWER_SYSTEM_PROMPT: &str = "You are an assistant for question-answering tasks. \
    Use the following pieces of retrieved context to answer the question. \
    If you don't know the answer, say that you don't know.";

const SNIPPET_CHARS: usize = 200;

/// Event sequence produced by [`AnswerPipeline::stream`].
#[derive(Debug, Clone, PartialEq)]
pub enum AnswerEvent {
    Token(String),
    Done(Vec<SourceCitation>),
}

pub struct AnswerPipeline {
    store: Arc<Store>,
    index: Arc<RwLock<VectorIndex>>,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
    top_k: usize,
    max_tokens: u32,
    title_model: String,
}

impl AnswerPipeline {
    pub fn new(
        store: Arc<Store>,
        index: Arc<RwLock<VectorIndex>>,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        top_k: usize,
        max_tokens: u32,
        title_model: String,
    ) -> Self {
        Self {
            store,
            index,
            embedder,
            generator,
            top_k,
            max_tokens,
            title_model,
        }
    }

    /// Retrieve the top-k grounding chunks for a prompt, scoped by `filter`.
    ///
    /// An empty index is `RetrievalUnavailable`; a query-embedding failure
    /// is a generation error (it happens while answering, not ingesting).
    pub async fn retrieve(
        &self,
        prompt: &str,
        filter: &DocFilter,
    ) -> Result<Vec<(Chunk, f32)>, DocChatError> {
        if self.index.read().await.is_empty() {
            return Err(DocChatError::RetrievalUnavailable);
        }
        // The read lock is not held across the embedding round trip, so
        // ingestion and deletes stay unblocked while it is in flight.
        let query = embed_query(self.embedder.as_ref(), prompt)
            .await
            .map_err(|e| DocChatError::Generation(e.to_string()))?;
        Ok(self.index.read().await.search(&query, self.top_k, filter))
    }

    /// Run one blocking generation with the stored model settings.
    /// `temperature_floor` raises (never lowers) the configured temperature.
    pub async fn complete(
        &self,
        system: &str,
        user: &str,
        temperature_floor: Option<f64>,
    ) -> Result<String, DocChatError> {
        let req = self.request(system, user, temperature_floor).await?;
        self.generator.generate(&req).await
    }

    async fn request(
        &self,
        system: &str,
        user: &str,
        temperature_floor: Option<f64>,
    ) -> Result<GenerationRequest, DocChatError> {
        let settings = self
            .store
            .get_llm_settings()
            .await
            .map_err(|e| DocChatError::Generation(e.to_string()))?;
        let temperature = match temperature_floor {
            Some(floor) => settings.temperature.max(floor),
            None => settings.temperature,
        };
        Ok(GenerationRequest {
            system: system.to_string(),
            user: user.to_string(),
            model: settings.model,
            temperature,
            max_tokens: self.max_tokens,
        })
    }

    /// Blocking mode: retrieve, generate, and return the answer text with
    /// its deduplicated sources.
    pub async fn answer(
        &self,
        prompt: &str,
        filter: &DocFilter,
    ) -> Result<(String, Vec<SourceCitation>), DocChatError> {
        let retrieved = self.retrieve(prompt, filter).await?;
        let system = stuff_context(ANSWER_SYSTEM_PROMPT, &retrieved);
        let text = self.complete(&system, prompt, None).await?;
        Ok((text, extract_sources(&retrieved)))
    }

    /// Background blocking flow: answer and persist the assistant turn.
    /// Failures become persisted error messages, never dropped turns.
    pub async fn respond(&self, session_id: &str, prompt: &str, filter: &DocFilter) {
        let (message, sources) = match self.answer(prompt, filter).await {
            Ok((text, sources)) => (text, sources),
            Err(DocChatError::RetrievalUnavailable) => (NO_DOCUMENTS_MESSAGE.to_string(), vec![]),
            Err(e) => {
                warn!(error = %e, "answer generation failed");
                (error_reply(&e), vec![])
            }
        };
        self.persist_assistant(session_id, &message, &sources).await;
    }

    /// Streaming mode. Spawns the producer and returns the consumer end.
    pub fn stream(
        self: &Arc<Self>,
        session_id: String,
        prompt: String,
        filter: DocFilter,
    ) -> mpsc::Receiver<AnswerEvent> {
        let (tx, rx) = mpsc::channel(32);
        let pipeline = self.clone();
        tokio::spawn(async move {
            pipeline.produce(tx, &session_id, &prompt, &filter).await;
        });
        rx
    }

    async fn produce(
        &self,
        mut tx: mpsc::Sender<AnswerEvent>,
        session_id: &str,
        prompt: &str,
        filter: &DocFilter,
    ) {
        let retrieved = match self.retrieve(prompt, filter).await {
            Ok(r) => r,
            Err(DocChatError::RetrievalUnavailable) => {
                self.finish_with_message(&mut tx, session_id, NO_DOCUMENTS_MESSAGE.to_string())
                    .await;
                return;
            }
            Err(e) => {
                warn!(error = %e, "retrieval failed during streaming");
                self.finish_with_message(&mut tx, session_id, error_reply(&e))
                    .await;
                return;
            }
        };

        let system = stuff_context(ANSWER_SYSTEM_PROMPT, &retrieved);
        let req = match self.request(&system, prompt, None).await {
            Ok(r) => r,
            Err(e) => {
                self.finish_with_message(&mut tx, session_id, error_reply(&e))
                    .await;
                return;
            }
        };

        let mut tokens = match self.generator.stream(&req).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "stream generation failed to start");
                self.finish_with_message(&mut tx, session_id, error_reply(&e))
                    .await;
                return;
            }
        };

        let mut full_answer = String::new();
        while let Some(item) = tokens.next().await {
            match item {
                Ok(token) => {
                    full_answer.push_str(&token);
                    if tx.send(AnswerEvent::Token(token)).await.is_err() {
                        // Consumer disconnected: discard the partial answer.
                        debug!("stream consumer disconnected, discarding partial answer");
                        return;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "stream generation failed mid-answer");
                    self.finish_with_message(&mut tx, session_id, error_reply(&e))
                        .await;
                    return;
                }
            }
        }

        let sources = extract_sources(&retrieved);
        if tx.send(AnswerEvent::Done(sources.clone())).await.is_err() {
            return;
        }
        self.persist_assistant(session_id, &full_answer, &sources)
            .await;
    }

    /// Emit a single informational/error token, the terminal event, and
    /// persist the message. Used for every non-success streaming outcome,
    /// keeping the terminal-event-exactly-once guarantee.
    async fn finish_with_message(
        &self,
        tx: &mut mpsc::Sender<AnswerEvent>,
        session_id: &str,
        message: String,
    ) {
        if tx.send(AnswerEvent::Token(message.clone())).await.is_err() {
            return;
        }
        if tx.send(AnswerEvent::Done(vec![])).await.is_err() {
            return;
        }
        self.persist_assistant(session_id, &message, &[]).await;
    }

    async fn persist_assistant(&self, session_id: &str, message: &str, sources: &[SourceCitation]) {
        if let Err(e) = self
            .store
            .append_message(session_id, "assistant", message, sources)
            .await
        {
            error!(error = %e, session_id, "failed to persist assistant message");
        }
    }

    /// Generate a short session title from the first user message and
    /// rename the session. Non-critical: any failure keeps the default
    /// title.
    pub async fn auto_title(&self, session_id: &str, first_message: &str) {
        let req = GenerationRequest {
            system: String::new(),
            user: format!(
                "Generate a concise 3-5 word title for a chat that starts with this message. \
                 Reply with ONLY the title, no quotes or punctuation.\n\nMessage: {}",
                first_message
            ),
            model: self.title_model.clone(),
            temperature: 0.0,
            max_tokens: 64,
        };
        match self.generator.generate(&req).await {
            Ok(title) => {
                let title = title.trim().trim_matches(|c| c == '"' || c == '\'').trim();
                if !title.is_empty() {
                    if let Err(e) = self.store.rename_session(session_id, title).await {
                        debug!(error = %e, "auto-title rename failed");
                    }
                }
            }
            Err(e) => debug!(error = %e, "auto-title generation failed"),
        }
    }
}

/// Stuff the retrieved chunks into the system instruction as grounding
/// context.
fn stuff_context(system: &str, retrieved: &[(Chunk, f32)]) -> String {
    let context = retrieved
        .iter()
        .map(|(c, _)| c.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    format!("{}\n\n{}", system, context)
}

/// User-visible assistant reply for a failed turn: category plus message,
/// fenced so the UI renders it readably.
fn error_reply(err: &DocChatError) -> String {
    format!(
        "Sorry... There was some error unfortunately.\n```text\n{}\n{}\n```",
        err.category(),
        err
    )
}

/// Derive deduplicated citations from retrieved chunks, in retrieval-rank
/// order. First occurrence per `(filename, page)` wins; snippets are the
/// chunk's first 200 characters.
pub fn extract_sources(retrieved: &[(Chunk, f32)]) -> Vec<SourceCitation> {
    let mut seen: HashSet<(String, Option<i64>)> = HashSet::new();
    let mut sources = Vec::new();
    for (chunk, _) in retrieved {
        if seen.insert((chunk.filename.clone(), chunk.page)) {
            sources.push(SourceCitation {
                filename: chunk.filename.clone(),
                page: chunk.page,
                snippet: truncate_chars(&chunk.text, SNIPPET_CHARS),
            });
        }
    }
    sources
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(filename: &str, page: Option<i64>, text: &str) -> (Chunk, f32) {
        (
            Chunk {
                chunk_id: format!("{}:{:?}:{}", filename, page, &text[..text.len().min(8)]),
                doc_id: "d1".to_string(),
                filename: filename.to_string(),
                ordinal: 0,
                text: text.to_string(),
                page,
            },
            0.5,
        )
    }

    #[test]
    fn test_extract_sources_dedups_by_filename_and_page() {
        let retrieved = vec![
            chunk("a.pdf", Some(1), "first ranked"),
            chunk("a.pdf", Some(1), "worse ranked duplicate"),
            chunk("a.pdf", Some(2), "different page"),
            chunk("b.txt", None, "other file"),
            chunk("b.txt", None, "other file again"),
        ];
        let sources = extract_sources(&retrieved);
        assert_eq!(sources.len(), 3);
        // First-seen order preserved; best-ranked occurrence kept.
        assert_eq!(sources[0].filename, "a.pdf");
        assert_eq!(sources[0].page, Some(1));
        assert_eq!(sources[0].snippet, "first ranked");
        assert_eq!(sources[1].page, Some(2));
        assert_eq!(sources[2].filename, "b.txt");
    }

    #[test]
    fn test_snippet_truncated_to_200_chars() {
        let long = "x".repeat(500);
        let retrieved = vec![chunk("a.txt", None, &long)];
        let sources = extract_sources(&retrieved);
        assert_eq!(sources[0].snippet.chars().count(), 200);
    }

    #[test]
    fn test_stuff_context_joins_chunks() {
        let retrieved = vec![chunk("a.txt", None, "alpha"), chunk("b.txt", None, "beta")];
        let system = stuff_context("instructions", &retrieved);
        assert!(system.starts_with("instructions\n\n"));
        assert!(system.contains("alpha\n\nbeta"));
    }

    #[test]
    fn test_error_reply_contains_category_and_message() {
        let reply = error_reply(&DocChatError::Generation("boom".to_string()));
        assert!(reply.contains("GenerationError"));
        assert!(reply.contains("boom"));
    }
}
