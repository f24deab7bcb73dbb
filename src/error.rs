//! Error taxonomy for the chat and ingestion pipelines.
//!
//! Failures isolated to one document or one chat turn are represented here
//! so callers can pattern-match instead of inspecting error strings.
//! `anyhow` remains in use at the CLI and ingestion edges.

use thiserror::Error;

/// Domain errors surfaced by the pipelines.
#[derive(Debug, Error)]
pub enum DocChatError {
    /// A file could not be read, extracted, or embedded during ingestion.
    /// The document's registration is skipped; other files are unaffected.
    #[error("ingestion failed: {0}")]
    Ingestion(String),

    /// No vector index has been built yet. Surfaced to chat users as a
    /// friendly informational message, not as an HTTP failure.
    #[error("no documents have been processed yet")]
    RetrievalUnavailable,

    /// The upstream LLM call (or query embedding) failed.
    #[error("generation failed: {0}")]
    Generation(String),

    /// Invalid model or temperature in a settings update. Settings are
    /// left unchanged.
    #[error("invalid settings: {0}")]
    Config(String),

    /// A required external service (e.g. speech synthesis) is not
    /// reachable or not configured.
    #[error("external service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl DocChatError {
    /// Short category label embedded in user-visible error messages.
    pub fn category(&self) -> &'static str {
        match self {
            DocChatError::Ingestion(_) => "IngestionError",
            DocChatError::RetrievalUnavailable => "RetrievalUnavailable",
            DocChatError::Generation(_) => "GenerationError",
            DocChatError::Config(_) => "ConfigError",
            DocChatError::ServiceUnavailable(_) => "ExternalServiceUnavailable",
        }
    }
}
