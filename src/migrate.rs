use anyhow::Result;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    // Attempt-limiter counters, one row per (user, key-space, key)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS attempt_states (
            user_id INTEGER NOT NULL,
            key_kind TEXT NOT NULL,
            key TEXT NOT NULL,
            repeat_attempts INTEGER NOT NULL DEFAULT 0,
            last_attempt_at INTEGER,
            blocked_until INTEGER,
            PRIMARY KEY (user_id, key_kind, key)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Completed analyses, consumed by the history command and the
    // billing-side caller
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS analyses (
            id TEXT PRIMARY KEY,
            user_id INTEGER NOT NULL,
            file_hash TEXT,
            crash_key TEXT,
            kind TEXT NOT NULL,
            device_model TEXT,
            os_version TEXT,
            error_code TEXT,
            solution_found INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_analyses_user_id ON analyses(user_id)")
        .execute(&pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_analyses_created_at ON analyses(created_at DESC)",
    )
    .execute(&pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_analyses_file_hash ON analyses(user_id, file_hash)")
        .execute(&pool)
        .await?;

    pool.close().await;
    Ok(())
}
