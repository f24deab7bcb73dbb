use anyhow::Result;
use sqlx::SqlitePool;

/// Create all tables and indexes. Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            session_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            doc_id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL DEFAULT '',
            filename TEXT NOT NULL,
            file_type TEXT NOT NULL,
            uploaded_at INTEGER NOT NULL,
            chunk_ids TEXT NOT NULL DEFAULT '[]'
        )
        "#,
    )
    .execute(pool)
    .await?;

    // The composite primary key doubles as the no-duplicate-seqno guard.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            session_id TEXT NOT NULL,
            seqno INTEGER NOT NULL,
            username TEXT NOT NULL,
            message TEXT NOT NULL,
            sources TEXT NOT NULL DEFAULT '[]',
            PRIMARY KEY (session_id, seqno)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS llm_config (
            uid INTEGER PRIMARY KEY,
            model TEXT NOT NULL,
            temperature REAL NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_session ON documents(session_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_created ON sessions(created_at)")
        .execute(pool)
        .await?;

    Ok(())
}
