//! End-to-end tests for the answer pipeline over a real SQLite store and
//! in-memory vector index, using deterministic in-process embedding and
//! generation backends.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use tempfile::TempDir;
use tokio::sync::{Mutex, RwLock, Semaphore};

use docchat::chunk::{chunk_segments, chunk_text, doc_id_for};
use docchat::db;
use docchat::embedding::Embedder;
use docchat::error::DocChatError;
use docchat::extract::ExtractedSegment;
use docchat::index::{DocFilter, VectorIndex};
use docchat::llm::{GenerationRequest, Generator, TokenStream};
use docchat::migrate;
use docchat::models::LlmSettings;
use docchat::pipeline::{AnswerEvent, AnswerPipeline, NO_DOCUMENTS_MESSAGE};
use docchat::store::Store;

// ─── Test backends ──────────────────────────────────────────────────

/// Deterministic embedder: byte histogram of the text. Similar texts get
/// similar vectors, and identical texts always embed identically.
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

/// Generator whose answer is a pure function of the request, with the
/// streaming mode emitting the same text in 4-character tokens.
struct EchoGenerator;

fn echo_answer(req: &GenerationRequest) -> String {
    format!("Answer: {}", req.user)
}

#[async_trait]
impl Generator for EchoGenerator {
    async fn generate(&self, req: &GenerationRequest) -> Result<String, DocChatError> {
        Ok(echo_answer(req))
    }

    async fn stream(&self, req: &GenerationRequest) -> Result<TokenStream, DocChatError> {
        let text = echo_answer(req);
        let tokens: Vec<Result<String, DocChatError>> = text
            .chars()
            .collect::<Vec<_>>()
            .chunks(4)
            .map(|c| Ok(c.iter().collect::<String>()))
            .collect();
        Ok(futures::stream::iter(tokens).boxed())
    }
}

/// Generator that always fails.
struct FailingGenerator;

#[async_trait]
impl Generator for FailingGenerator {
    async fn generate(&self, _req: &GenerationRequest) -> Result<String, DocChatError> {
        Err(DocChatError::Generation("synthetic backend failure".into()))
    }

    async fn stream(&self, _req: &GenerationRequest) -> Result<TokenStream, DocChatError> {
        Err(DocChatError::Generation("synthetic backend failure".into()))
    }
}

/// Generator that records the last request it saw.
#[derive(Default)]
struct RecordingGenerator {
    last: Mutex<Option<GenerationRequest>>,
}

#[async_trait]
impl Generator for RecordingGenerator {
    async fn generate(&self, req: &GenerationRequest) -> Result<String, DocChatError> {
        *self.last.lock().await = Some(req.clone());
        Ok("recorded".to_string())
    }

    async fn stream(&self, req: &GenerationRequest) -> Result<TokenStream, DocChatError> {
        *self.last.lock().await = Some(req.clone());
        Ok(futures::stream::iter(vec![Ok("recorded".to_string())]).boxed())
    }
}

// ─── Fixtures ───────────────────────────────────────────────────────

struct TestEnv {
    _tmp: TempDir,
    store: Arc<Store>,
    index: Arc<RwLock<VectorIndex>>,
}

async fn setup() -> TestEnv {
    let tmp = TempDir::new().unwrap();
    let pool = db::connect(&tmp.path().join("test.db")).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();

    let store = Arc::new(Store::new(pool));
    store
        .init_llm_settings(&LlmSettings {
            model: "test-model".to_string(),
            temperature: 0.2,
        })
        .await
        .unwrap();

    TestEnv {
        _tmp: tmp,
        store,
        index: Arc::new(RwLock::new(VectorIndex::new())),
    }
}

async fn index_text(env: &TestEnv, filename: &str, text: &str) -> String {
    let doc_id = doc_id_for(filename);
    let chunks = chunk_text(filename, &doc_id, text, 100, 20);
    let embeddings = chunks.iter().map(|c| embed_one(&c.text)).collect();
    env.index
        .write()
        .await
        .add_entries(chunks, embeddings)
        .unwrap();
    doc_id
}

fn make_pipeline(env: &TestEnv, generator: Arc<dyn Generator>) -> Arc<AnswerPipeline> {
    Arc::new(AnswerPipeline::new(
        env.store.clone(),
        env.index.clone(),
        Arc::new(HashEmbedder),
        generator,
        7,
        512,
        "title-model".to_string(),
    ))
}

// ─── Streaming ──────────────────────────────────────────────────────

#[tokio::test]
async fn streamed_tokens_concatenate_to_blocking_answer() {
    let env = setup().await;
    index_text(&env, "alpha.txt", &"The alpha document is about Rust. ".repeat(10)).await;
    index_text(&env, "beta.txt", &"The beta document is about Python. ".repeat(10)).await;

    let pipeline = make_pipeline(&env, Arc::new(EchoGenerator));
    let session = env.store.create_session("t").await.unwrap();

    let (blocking_text, blocking_sources) = pipeline
        .answer("what is alpha about", &DocFilter::all())
        .await
        .unwrap();
    assert!(!blocking_sources.is_empty());

    let events: Vec<AnswerEvent> = pipeline
        .stream(
            session.session_id.clone(),
            "what is alpha about".to_string(),
            DocFilter::all(),
        )
        .collect()
        .await;

    let mut concatenated = String::new();
    let mut done_count = 0;
    for event in &events {
        match event {
            AnswerEvent::Token(t) => {
                assert_eq!(done_count, 0, "token after terminal event");
                concatenated.push_str(t);
            }
            AnswerEvent::Done(sources) => {
                done_count += 1;
                assert_eq!(sources, &blocking_sources);
            }
        }
    }
    assert_eq!(done_count, 1);
    assert_eq!(concatenated, blocking_text);

    // The producer persists only after the terminal event is delivered;
    // the stream ends after persistence completes.
    let messages = env
        .store
        .messages_since(&session.session_id, -1)
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].seqno, 0);
    assert_eq!(messages[0].username, "assistant");
    assert_eq!(messages[0].message, blocking_text);
    assert_eq!(messages[0].sources, blocking_sources);
}

#[tokio::test]
async fn empty_index_streams_fixed_notice() {
    let env = setup().await;
    let pipeline = make_pipeline(&env, Arc::new(EchoGenerator));
    let session = env.store.create_session("t").await.unwrap();

    let events: Vec<AnswerEvent> = pipeline
        .stream(
            session.session_id.clone(),
            "anything".to_string(),
            DocFilter::all(),
        )
        .collect()
        .await;

    assert_eq!(
        events,
        vec![
            AnswerEvent::Token(NO_DOCUMENTS_MESSAGE.to_string()),
            AnswerEvent::Done(vec![]),
        ]
    );

    let messages = env
        .store
        .messages_since(&session.session_id, -1)
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message, NO_DOCUMENTS_MESSAGE);
    assert!(messages[0].sources.is_empty());
}

// ─── Blocking flow ──────────────────────────────────────────────────

#[tokio::test]
async fn respond_persists_answer_with_sources() {
    let env = setup().await;
    index_text(&env, "alpha.txt", &"Rust ownership and borrowing. ".repeat(10)).await;

    let pipeline = make_pipeline(&env, Arc::new(EchoGenerator));
    let session = env.store.create_session("t").await.unwrap();

    pipeline
        .respond(&session.session_id, "explain ownership", &DocFilter::all())
        .await;

    let messages = env
        .store
        .messages_since(&session.session_id, -1)
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].username, "assistant");
    assert!(messages[0].message.starts_with("Answer: "));
    assert!(!messages[0].sources.is_empty());
    assert_eq!(messages[0].sources[0].filename, "alpha.txt");
}

#[tokio::test]
async fn generator_failure_persists_error_turn() {
    let env = setup().await;
    index_text(&env, "alpha.txt", &"Some indexed content here. ".repeat(10)).await;

    let pipeline = make_pipeline(&env, Arc::new(FailingGenerator));
    let session = env.store.create_session("t").await.unwrap();

    pipeline
        .respond(&session.session_id, "question", &DocFilter::all())
        .await;

    let messages = env
        .store
        .messages_since(&session.session_id, -1)
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].message.contains("GenerationError"));
    assert!(messages[0].message.contains("synthetic backend failure"));
    assert!(messages[0].sources.is_empty());
}

#[tokio::test]
async fn filter_scopes_retrieval_to_selected_documents() {
    let env = setup().await;
    let alpha = index_text(&env, "alpha.txt", &"Alpha topics and notes. ".repeat(10)).await;
    index_text(&env, "beta.txt", &"Beta topics and notes. ".repeat(10)).await;

    let pipeline = make_pipeline(&env, Arc::new(EchoGenerator));
    let (_, sources) = pipeline
        .answer("topics", &DocFilter::documents([alpha]))
        .await
        .unwrap();

    assert!(!sources.is_empty());
    assert!(sources.iter().all(|s| s.filename == "alpha.txt"));
}

#[tokio::test]
async fn multi_page_document_yields_per_page_citations() {
    let env = setup().await;

    // Two pages of the same file, as page-wise extraction produces them.
    let segments = vec![
        ExtractedSegment {
            page: Some(1),
            text: "Introduction and background material. ".repeat(5),
        },
        ExtractedSegment {
            page: Some(2),
            text: "Results and concluding remarks. ".repeat(5),
        },
    ];
    let doc_id = doc_id_for("paper.pdf");
    let chunks = chunk_segments("paper.pdf", &doc_id, &segments, 100, 20);
    let embeddings = chunks.iter().map(|c| embed_one(&c.text)).collect();
    env.index
        .write()
        .await
        .add_entries(chunks, embeddings)
        .unwrap();

    let pipeline = make_pipeline(&env, Arc::new(EchoGenerator));
    let (_, sources) = pipeline
        .answer("what does the paper conclude", &DocFilter::all())
        .await
        .unwrap();

    // One citation per page, not one per file.
    let mut pages: Vec<Option<i64>> = sources
        .iter()
        .filter(|s| s.filename == "paper.pdf")
        .map(|s| s.page)
        .collect();
    pages.sort();
    assert_eq!(pages, vec![Some(1), Some(2)]);
}

/// Embedder that parks until released, standing in for a slow embedding
/// round trip.
struct GatedEmbedder {
    gate: Arc<Semaphore>,
}

#[async_trait]
impl Embedder for GatedEmbedder {
    fn model_name(&self) -> &str {
        "gated"
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let _permit = self.gate.acquire().await?;
        Ok(texts.iter().map(|t| embed_one(t)).collect())
    }
}

#[tokio::test]
async fn index_writers_not_blocked_while_query_embedding_is_in_flight() {
    let env = setup().await;
    index_text(&env, "alpha.txt", &"Some indexed content here. ".repeat(10)).await;

    let gate = Arc::new(Semaphore::new(0));
    let pipeline = Arc::new(AnswerPipeline::new(
        env.store.clone(),
        env.index.clone(),
        Arc::new(GatedEmbedder { gate: gate.clone() }),
        Arc::new(EchoGenerator),
        7,
        512,
        "title-model".to_string(),
    ));

    let answering = tokio::spawn({
        let pipeline = pipeline.clone();
        async move { pipeline.answer("question", &DocFilter::all()).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The embedding call is parked; a writer must still get the lock.
    let write = tokio::time::timeout(Duration::from_millis(200), env.index.write()).await;
    assert!(write.is_ok(), "index write blocked during query embedding");
    drop(write);

    gate.add_permits(1);
    let (text, sources) = answering.await.unwrap().unwrap();
    assert!(text.starts_with("Answer: "));
    assert!(!sources.is_empty());
}

#[tokio::test]
async fn temperature_floor_raises_but_never_lowers() {
    let env = setup().await;
    let recorder = Arc::new(RecordingGenerator::default());
    let pipeline = make_pipeline(&env, recorder.clone());

    // Stored temperature is 0.2; a floor of 0.5 raises it.
    pipeline.complete("sys", "user", Some(0.5)).await.unwrap();
    assert_eq!(recorder.last.lock().await.as_ref().unwrap().temperature, 0.5);

    // Raise the stored temperature above the floor; the floor is inert.
    env.store.set_llm_settings("test-model", 0.8).await.unwrap();
    pipeline.complete("sys", "user", Some(0.5)).await.unwrap();
    assert_eq!(recorder.last.lock().await.as_ref().unwrap().temperature, 0.8);

    pipeline.complete("sys", "user", None).await.unwrap();
    assert_eq!(recorder.last.lock().await.as_ref().unwrap().temperature, 0.8);
}

#[tokio::test]
async fn auto_title_renames_session_from_first_message() {
    let env = setup().await;
    let pipeline = make_pipeline(&env, Arc::new(EchoGenerator));
    let session = env.store.create_session("New Chat").await.unwrap();

    pipeline
        .auto_title(&session.session_id, "What are lifetimes in Rust?")
        .await;

    let sessions = env.store.list_sessions().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert!(sessions[0].name.starts_with("Answer: "));
}

// ─── Store sequencing and cascade ───────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_appends_assign_contiguous_seqnos() {
    let env = setup().await;
    let session = env.store.create_session("t").await.unwrap();

    let mut handles = Vec::new();
    for i in 0..16 {
        let store = env.store.clone();
        let sid = session.session_id.clone();
        handles.push(tokio::spawn(async move {
            store
                .append_message(&sid, "user", &format!("message {}", i), &[])
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let messages = env
        .store
        .messages_since(&session.session_id, -1)
        .await
        .unwrap();
    assert_eq!(messages.len(), 16);
    for (i, msg) in messages.iter().enumerate() {
        assert_eq!(msg.seqno, i as i64);
    }
}

#[tokio::test]
async fn messages_since_returns_strict_suffix() {
    let env = setup().await;
    let session = env.store.create_session("t").await.unwrap();
    for i in 0..5 {
        env.store
            .append_message(&session.session_id, "user", &format!("m{}", i), &[])
            .await
            .unwrap();
    }

    let suffix = env
        .store
        .messages_since(&session.session_id, 2)
        .await
        .unwrap();
    assert_eq!(suffix.len(), 2);
    assert_eq!(suffix[0].seqno, 3);
    assert_eq!(suffix[1].seqno, 4);
}

#[tokio::test]
async fn session_cascade_delete_returns_owned_chunks() {
    let env = setup().await;
    let session = env.store.create_session("t").await.unwrap();
    env.store
        .append_message(&session.session_id, "user", "hello", &[])
        .await
        .unwrap();
    env.store
        .register_document(&docchat::models::Document {
            doc_id: doc_id_for("alpha.txt"),
            session_id: session.session_id.clone(),
            filename: "alpha.txt".to_string(),
            file_type: "txt".to_string(),
            uploaded_at: 0,
            chunk_ids: vec!["c1".to_string(), "c2".to_string()],
        })
        .await
        .unwrap();

    let owned = env
        .store
        .delete_session(&session.session_id)
        .await
        .unwrap()
        .expect("session existed");
    assert_eq!(owned.len(), 1);
    assert_eq!(owned[0].0, vec!["c1".to_string(), "c2".to_string()]);
    assert_eq!(owned[0].1, "alpha.txt");

    assert!(env.store.list_sessions().await.unwrap().is_empty());
    assert!(env
        .store
        .messages_since(&session.session_id, -1)
        .await
        .unwrap()
        .is_empty());

    // Second delete: already gone.
    assert!(env
        .store
        .delete_session(&session.session_id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn llm_settings_validation_leaves_stored_values_intact() {
    let env = setup().await;

    assert!(env.store.set_llm_settings("", 0.5).await.is_err());
    assert!(env.store.set_llm_settings("m", 1.5).await.is_err());
    assert!(env.store.set_llm_settings("m", -0.1).await.is_err());

    let settings = env.store.get_llm_settings().await.unwrap();
    assert_eq!(settings.model, "test-model");
    assert_eq!(settings.temperature, 0.2);

    let updated = env.store.set_llm_settings("other-model", 0.9).await.unwrap();
    assert_eq!(updated.model, "other-model");
    assert_eq!(env.store.get_llm_settings().await.unwrap().temperature, 0.9);
}
