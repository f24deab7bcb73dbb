//! # docchat CLI
//!
//! The `docchat` binary manages a document-grounded chat service: it
//! initializes the SQLite database, runs the ingestion pipeline over the
//! upload directory, and starts the HTTP API.
//!
//! ## Usage
//!
//! ```bash
//! docchat --config ./config/docchat.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docchat init` | Create the SQLite database and run schema migrations |
//! | `docchat process` | Extract, chunk, embed, and index uploaded files |
//! | `docchat serve` | Start the HTTP API server |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! docchat init --config ./config/docchat.toml
//!
//! # Index everything in the upload directory
//! docchat process --config ./config/docchat.toml
//!
//! # Index new uploads on behalf of a chat session
//! docchat process --session-id 4f7f3f0a-... --config ./config/docchat.toml
//!
//! # Start the API server
//! docchat serve --config ./config/docchat.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::RwLock;
use tracing::info;
use tracing_subscriber::EnvFilter;

use docchat::config::{self, Config};
use docchat::embedding::create_embedder;
use docchat::index::VectorIndex;
use docchat::ingest;
use docchat::llm::AnthropicGenerator;
use docchat::models::LlmSettings;
use docchat::server::{run_server, AppState};
use docchat::store::Store;
use docchat::tts::ElevenLabsSynthesizer;
use docchat::{db, migrate};

/// docchat — chat with uploaded documents over a local vector index.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docchat.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "docchat",
    about = "Chat with uploaded documents over a local vector index",
    version,
    long_about = "docchat ingests uploaded files (PDF, DOCX, TXT, MD), chunks and embeds them \
    into a local vector index, and answers questions grounded in the most relevant chunks with \
    per-source citations. Conversations are persisted in SQLite sessions and exposed via an \
    HTTP API with token-level streaming."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/docchat.toml`. All database, storage, embedding,
    /// LLM, and server settings are read from this file.
    #[arg(long, global = true, default_value = "./config/docchat.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables
    /// (sessions, documents, messages, llm_config). This command is
    /// idempotent — running it multiple times is safe.
    Init,

    /// Run the ingestion pipeline over the upload directory.
    ///
    /// Extracts text from each supported file, chunks it, embeds the
    /// chunks, and registers the document. Files already registered are
    /// skipped, so re-running is safe.
    Process {
        /// Attribute newly indexed documents to this chat session.
        #[arg(long)]
        session_id: Option<String>,
    },

    /// Start the HTTP API server.
    ///
    /// Runs the ingestion pipeline once at startup, then binds to the
    /// address configured in `[server].bind` and serves the chat API.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg.db.path).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Process { session_id } => {
            let (store, index) = open_store_and_index(&cfg).await?;
            let embedder = create_embedder(&cfg.embedding)?;
            let outcome = ingest::process_documents(
                &cfg,
                &store,
                &index,
                embedder.as_ref(),
                session_id.as_deref().unwrap_or(""),
            )
            .await?;
            println!(
                "Indexed {} document(s), {} chunk(s); {} already indexed, {} failure(s).",
                outcome.documents_indexed,
                outcome.chunks_indexed,
                outcome.skipped_existing,
                outcome.failures.len()
            );
            for (filename, error) in &outcome.failures {
                eprintln!("  {}: {}", filename, error);
            }
        }
        Commands::Serve => {
            let (store, index) = open_store_and_index(&cfg).await?;
            let embedder = create_embedder(&cfg.embedding)?;

            // Pick up anything dropped into the upload directory while the
            // server was down.
            let outcome = ingest::process_documents(&cfg, &store, &index, embedder.as_ref(), "")
                .await?;
            info!(
                documents = outcome.documents_indexed,
                chunks = outcome.chunks_indexed,
                skipped = outcome.skipped_existing,
                failures = outcome.failures.len(),
                "startup ingestion complete"
            );

            let generator = Arc::new(AnthropicGenerator::new(cfg.llm.timeout_secs)?);
            let synthesizer = Arc::new(ElevenLabsSynthesizer::new(&cfg.tts.voice_id)?);

            let state = AppState::new(
                Arc::new(cfg),
                store,
                index,
                embedder,
                generator,
                synthesizer,
            );
            run_server(state).await?;
        }
    }

    Ok(())
}

/// Open the database, apply migrations, seed the LLM settings row, and
/// load the persisted vector index if one exists.
async fn open_store_and_index(
    cfg: &Config,
) -> anyhow::Result<(Arc<Store>, Arc<RwLock<VectorIndex>>)> {
    let pool = db::connect(&cfg.db.path).await?;
    migrate::run_migrations(&pool).await?;

    let store = Arc::new(Store::new(pool));
    store
        .init_llm_settings(&LlmSettings {
            model: cfg.llm.default_model.clone(),
            temperature: cfg.llm.default_temperature,
        })
        .await?;

    let index = VectorIndex::load(&cfg.storage.index_dir)?.unwrap_or_else(VectorIndex::new);
    Ok((store, Arc::new(RwLock::new(index))))
}
