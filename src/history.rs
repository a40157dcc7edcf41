//! Analysis history: the read model consumed by the history command and
//! by the account/ledger caller deciding whether to charge for a run.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use uuid::Uuid;

use crate::models::AnalysisRecord;

/// Per-user aggregate counters.
#[derive(Debug, Clone, Default)]
pub struct UserStats {
    pub total: i64,
    pub successful: i64,
    pub failed: i64,
    pub by_kind: HashMap<String, i64>,
}

pub struct HistoryRepo {
    pool: SqlitePool,
}

impl HistoryRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a completed analysis. Returns the record id.
    pub async fn record(
        &self,
        user_id: i64,
        file_hash: Option<&str>,
        crash_key: Option<&str>,
        kind: &str,
        device_model: Option<&str>,
        os_version: Option<&str>,
        error_code: Option<&str>,
        solution_found: bool,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO analyses (id, user_id, file_hash, crash_key, kind, device_model, os_version, error_code, solution_found, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(user_id)
        .bind(file_hash)
        .bind(crash_key)
        .bind(kind)
        .bind(device_model)
        .bind(os_version)
        .bind(error_code)
        .bind(solution_found)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Most recent analyses for a user, newest first.
    pub async fn recent(&self, user_id: i64, limit: i64) -> Result<Vec<AnalysisRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, file_hash, crash_key, kind, device_model, os_version, error_code, solution_found, created_at
            FROM analyses WHERE user_id = ?
            ORDER BY created_at DESC, id LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| AnalysisRecord {
                id: row.get("id"),
                user_id: row.get("user_id"),
                file_hash: row.get("file_hash"),
                crash_key: row.get("crash_key"),
                kind: row.get("kind"),
                device_model: row.get("device_model"),
                os_version: row.get("os_version"),
                error_code: row.get("error_code"),
                solution_found: row.get::<i64, _>("solution_found") != 0,
                created_at: row.get("created_at"),
            })
            .collect())
    }

    pub async fn stats(&self, user_id: i64) -> Result<UserStats> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM analyses WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        let successful: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM analyses WHERE user_id = ? AND solution_found = 1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        let kind_rows = sqlx::query(
            "SELECT kind, COUNT(*) AS count FROM analyses WHERE user_id = ? GROUP BY kind",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        let by_kind = kind_rows
            .into_iter()
            .map(|row| (row.get::<String, _>("kind"), row.get::<i64, _>("count")))
            .collect();

        Ok(UserStats {
            total,
            successful,
            failed: total - successful,
            by_kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn repo() -> (tempfile::TempDir, HistoryRepo) {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::config::Config {
            db: crate::config::DbConfig {
                path: dir.path().join("triage.sqlite"),
            },
            ..crate::config::Config::minimal()
        };
        crate::migrate::run_migrations(&config).await.unwrap();
        let pool = crate::db::connect(&config).await.unwrap();
        (dir, HistoryRepo::new(pool))
    }

    #[tokio::test]
    async fn record_and_read_back() {
        let (_dir, repo) = repo().await;
        repo.record(
            7,
            Some("hash1"),
            None,
            "text_dump",
            Some("iPhone X"),
            Some("16.1"),
            Some("\"wdog\""),
            true,
        )
        .await
        .unwrap();
        repo.record(7, Some("hash2"), None, "image", None, None, None, false)
            .await
            .unwrap();
        repo.record(9, None, None, "structured_log", None, None, None, false)
            .await
            .unwrap();

        let recent = repo.recent(7, 10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent.iter().any(|r| r.error_code.as_deref() == Some("\"wdog\"")));

        let stats = repo.stats(7).await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.successful, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.by_kind.get("image"), Some(&1));
    }
}
