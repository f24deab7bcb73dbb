//! docchat: chat with your documents over a local vector index.
//!
//! Files dropped into an upload directory are extracted, chunked, embedded,
//! and indexed; questions are answered by a language model grounded in the
//! most similar chunks, with per-source citations. Conversations live in
//! SQLite sessions with strictly ordered messages, and an HTTP API exposes
//! the whole thing to browser clients, including a token-level SSE stream.
//!
//! # Architecture
//!
//! ```text
//!   uploaded_files/ --> extract --> chunk --> embed --> VectorIndex
//!                                                          |
//!   HTTP client --> server --> AnswerPipeline --> retrieve-+
//!                      |             |
//!                      |             +--> Generator (LLM) --> tokens/answer
//!                      |             +--> Store (SQLite) --> sessions, messages
//!                      +--> ActionPipelines --> summarize / compare /
//!                                               mindmap / audio overview
//! ```
//!
//! # Modules
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`config`] | TOML configuration with defaults and validation |
//! | [`error`] | Domain error categories |
//! | [`models`] | Shared data types |
//! | [`extract`] | Plain-text extraction from PDF, DOCX, TXT, MD |
//! | [`chunk`] | Character-window chunking and content-hash ids |
//! | [`embedding`] | Embedding backends behind the [`embedding::Embedder`] trait |
//! | [`index`] | In-memory cosine-similarity index with JSON persistence |
//! | [`ingest`] | Scan-extract-chunk-embed-register pipeline |
//! | [`db`] / [`migrate`] | SQLite pool and schema |
//! | [`store`] | Sessions, documents, messages, LLM settings |
//! | [`llm`] | Text generation behind the [`llm::Generator`] trait |
//! | [`tts`] | Speech synthesis behind the [`tts::Synthesizer`] trait |
//! | [`pipeline`] | Retrieval-augmented answering, blocking and streaming |
//! | [`actions`] | Document-level actions built on the answer pipeline |
//! | [`export`] | Markdown transcript rendering |
//! | [`server`] | Axum HTTP API |

pub mod actions;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod export;
pub mod extract;
pub mod index;
pub mod ingest;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod server;
pub mod store;
pub mod tts;
