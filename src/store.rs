//! Persistent metadata store: sessions, documents, messages, LLM settings.
//!
//! Owns the invariant logic linking documents to chunk sets and the
//! per-session message sequencing. Message seqnos are assigned read-max,
//! increment, write inside a transaction while holding a per-session async
//! lock, so concurrent posts to one session never collide while posts to
//! different sessions proceed independently.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::DocChatError;
use crate::models::{Document, LlmSettings, Session, SourceCitation, StoredMessage};

pub struct Store {
    pool: SqlitePool,
    session_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.session_locks.lock().await;
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ============ Sessions ============

    pub async fn create_session(&self, name: &str) -> Result<Session> {
        let session = Session {
            session_id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            created_at: Utc::now().timestamp(),
        };
        sqlx::query("INSERT INTO sessions (session_id, name, created_at) VALUES (?, ?, ?)")
            .bind(&session.session_id)
            .bind(&session.name)
            .bind(session.created_at)
            .execute(&self.pool)
            .await?;
        Ok(session)
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        let rows = sqlx::query(
            "SELECT session_id, name, created_at FROM sessions ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_session).collect())
    }

    pub async fn rename_session(&self, session_id: &str, name: &str) -> Result<Option<Session>> {
        let updated = sqlx::query("UPDATE sessions SET name = ? WHERE session_id = ?")
            .bind(name)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        if updated.rows_affected() == 0 {
            return Ok(None);
        }
        let row = sqlx::query("SELECT session_id, name, created_at FROM sessions WHERE session_id = ?")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(Some(row_to_session(&row)))
    }

    /// Cascade-delete a session: returns `(chunk_ids, filename)` for each
    /// owned document so the caller can purge the vector index and the
    /// uploaded files on disk. Returns `None` if the session does not exist.
    pub async fn delete_session(
        &self,
        session_id: &str,
    ) -> Result<Option<Vec<(Vec<String>, String)>>> {
        let exists: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM sessions WHERE session_id = ?")
                .bind(session_id)
                .fetch_one(&self.pool)
                .await?;
        if !exists {
            return Ok(None);
        }

        let docs = self.list_documents(session_id).await?;
        let owned: Vec<(Vec<String>, String)> = docs
            .into_iter()
            .map(|d| (d.chunk_ids, d.filename))
            .collect();

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM documents WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM messages WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM sessions WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.session_locks.lock().await.remove(session_id);

        Ok(Some(owned))
    }

    // ============ Documents ============

    pub async fn register_document(&self, doc: &Document) -> Result<()> {
        sqlx::query(
            "INSERT INTO documents (doc_id, session_id, filename, file_type, uploaded_at, chunk_ids) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&doc.doc_id)
        .bind(&doc.session_id)
        .bind(&doc.filename)
        .bind(&doc.file_type)
        .bind(doc.uploaded_at)
        .bind(serde_json::to_string(&doc.chunk_ids)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_document(&self, doc_id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT doc_id, session_id, filename, file_type, uploaded_at, chunk_ids \
             FROM documents WHERE doc_id = ?",
        )
        .bind(doc_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| row_to_document(&r)).transpose()
    }

    pub async fn list_documents(&self, session_id: &str) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            "SELECT doc_id, session_id, filename, file_type, uploaded_at, chunk_ids \
             FROM documents WHERE session_id = ? ORDER BY uploaded_at DESC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_document).collect()
    }

    /// Delete a document record, returning it so the caller can purge the
    /// index and the uploaded file.
    pub async fn delete_document(&self, doc_id: &str) -> Result<Option<Document>> {
        let doc = self.get_document(doc_id).await?;
        if doc.is_some() {
            sqlx::query("DELETE FROM documents WHERE doc_id = ?")
                .bind(doc_id)
                .execute(&self.pool)
                .await?;
        }
        Ok(doc)
    }

    // ============ Messages ============

    /// Next seqno for the session: max existing + 1, or 0 for an empty log.
    pub async fn next_seqno(&self, session_id: &str) -> Result<i64> {
        let max: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(seqno), -1) FROM messages WHERE session_id = ?")
                .bind(session_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(max + 1)
    }

    /// Append a message with an atomically assigned seqno.
    pub async fn append_message(
        &self,
        session_id: &str,
        username: &str,
        message: &str,
        sources: &[SourceCitation],
    ) -> Result<StoredMessage> {
        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;

        let mut tx = self.pool.begin().await?;
        let max: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(seqno), -1) FROM messages WHERE session_id = ?")
                .bind(session_id)
                .fetch_one(&mut *tx)
                .await?;
        let seqno = max + 1;
        sqlx::query(
            "INSERT INTO messages (session_id, seqno, username, message, sources) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(seqno)
        .bind(username)
        .bind(message)
        .bind(serde_json::to_string(sources)?)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(StoredMessage {
            seqno,
            session_id: session_id.to_string(),
            username: username.to_string(),
            message: message.to_string(),
            sources: sources.to_vec(),
        })
    }

    /// Messages with `seqno > cursor`, ordered ascending. `cursor = -1`
    /// fetches the full log.
    pub async fn messages_since(
        &self,
        session_id: &str,
        cursor: i64,
    ) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT session_id, seqno, username, message, sources \
             FROM messages WHERE session_id = ? AND seqno > ? ORDER BY seqno ASC",
        )
        .bind(session_id)
        .bind(cursor)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_message).collect()
    }

    // ============ LLM settings ============

    /// Insert the default settings row if none exists.
    pub async fn init_llm_settings(&self, defaults: &LlmSettings) -> Result<()> {
        sqlx::query(
            "INSERT INTO llm_config (uid, model, temperature) VALUES (0, ?, ?) \
             ON CONFLICT(uid) DO NOTHING",
        )
        .bind(&defaults.model)
        .bind(defaults.temperature)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_llm_settings(&self) -> Result<LlmSettings> {
        let row = sqlx::query("SELECT model, temperature FROM llm_config WHERE uid = 0")
            .fetch_one(&self.pool)
            .await?;
        Ok(LlmSettings {
            model: row.get("model"),
            temperature: row.get("temperature"),
        })
    }

    /// Validate and persist new settings. On validation failure the stored
    /// settings are left unchanged.
    pub async fn set_llm_settings(
        &self,
        model: &str,
        temperature: f64,
    ) -> Result<LlmSettings, DocChatError> {
        if model.trim().is_empty() {
            return Err(DocChatError::Config("model must not be empty".to_string()));
        }
        if !(0.0..=1.0).contains(&temperature) {
            return Err(DocChatError::Config(format!(
                "temperature must be in [0.0, 1.0], got {}",
                temperature
            )));
        }
        sqlx::query("UPDATE llm_config SET model = ?, temperature = ? WHERE uid = 0")
            .bind(model)
            .bind(temperature)
            .execute(&self.pool)
            .await
            .map_err(|e| DocChatError::Config(e.to_string()))?;
        Ok(LlmSettings {
            model: model.to_string(),
            temperature,
        })
    }
}

fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> Session {
    Session {
        session_id: row.get("session_id"),
        name: row.get("name"),
        created_at: row.get("created_at"),
    }
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> Result<Document> {
    let chunk_ids: String = row.get("chunk_ids");
    Ok(Document {
        doc_id: row.get("doc_id"),
        session_id: row.get("session_id"),
        filename: row.get("filename"),
        file_type: row.get("file_type"),
        uploaded_at: row.get("uploaded_at"),
        chunk_ids: serde_json::from_str(&chunk_ids)?,
    })
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<StoredMessage> {
    let sources: String = row.get("sources");
    Ok(StoredMessage {
        session_id: row.get("session_id"),
        seqno: row.get("seqno"),
        username: row.get("username"),
        message: row.get("message"),
        sources: serde_json::from_str(&sources)?,
    })
}
