use async_trait::async_trait;
use chrono::Utc;

use crate::error::Result;

use super::{CumulativeStats, CumulativeStatsFilter, RunRecord, RunStatus, SqliteRecordStore};

#[async_trait]
pub trait RunStore {
    /// Allocates `RUN-<epoch-ms>[-<suffix>]` and inserts a `running` row.
    async fn start_new_run(&self, case_id: &str, prefix: Option<&str>) -> Result<String>;
    async fn mark_run_completed(&self, run_id: &str) -> Result<()>;
    async fn mark_run_failed(&self, run_id: &str) -> Result<()>;
    async fn get_current_run_id(&self, case_id: &str) -> Result<Option<String>>;
    async fn get_last_completed_run_id(&self, case_id: &str) -> Result<Option<String>>;
    async fn get_all_run_ids_ordered(&self, limit: i64, offset: i64) -> Result<Vec<String>>;
    async fn get_cumulative_stats(&self, filter: &CumulativeStatsFilter) -> Result<CumulativeStats>;
    async fn save_run_summary(&self, run_id: &str, summary_json: &str) -> Result<()>;
    async fn get_run_summary(&self, run_id: &str) -> Result<Option<String>>;
    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>>;
}

#[async_trait]
impl RunStore for SqliteRecordStore {
    async fn start_new_run(&self, case_id: &str, prefix: Option<&str>) -> Result<String> {
        let now = Utc::now();
        let run_id = match prefix {
            Some(p) => format!("{p}-{}", now.timestamp_millis()),
            None => format!("RUN-{}", now.timestamp_millis()),
        };
        sqlx::query(
            "INSERT INTO tbl_runs (run_id, started_at, finished_at, status, case_id, summary)
             VALUES (?, ?, NULL, 'running', ?, NULL)",
        )
        .bind(&run_id)
        .bind(now.to_rfc3339())
        .bind(case_id)
        .execute(self.pool())
        .await?;
        Ok(run_id)
    }

    async fn mark_run_completed(&self, run_id: &str) -> Result<()> {
        sqlx::query("UPDATE tbl_runs SET status = 'done', finished_at = ? WHERE run_id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(run_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn mark_run_failed(&self, run_id: &str) -> Result<()> {
        sqlx::query("UPDATE tbl_runs SET status = 'error', finished_at = ? WHERE run_id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(run_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn get_current_run_id(&self, case_id: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT run_id FROM tbl_runs WHERE case_id = ? AND status = 'running'
             ORDER BY started_at DESC LIMIT 1",
        )
        .bind(case_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|(r,)| r))
    }

    async fn get_last_completed_run_id(&self, case_id: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT run_id FROM tbl_runs WHERE case_id = ? AND status = 'done'
             ORDER BY finished_at DESC LIMIT 1",
        )
        .bind(case_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|(r,)| r))
    }

    async fn get_all_run_ids_ordered(&self, limit: i64, offset: i64) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT run_id FROM tbl_runs ORDER BY started_at DESC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(|(r,)| r).collect())
    }

    async fn get_cumulative_stats(&self, filter: &CumulativeStatsFilter) -> Result<CumulativeStats> {
        let mut sql = String::from(
            "SELECT
                SUM(CASE WHEN status = 'done' THEN 1 ELSE 0 END),
                SUM(CASE WHEN status = 'error' THEN 1 ELSE 0 END),
                COUNT(*)
             FROM tbl_checkpoints WHERE 1=1",
        );
        if filter.brand.is_some() {
            sql.push_str(" AND brand = ?");
        }
        if filter.purchaser.is_some() {
            sql.push_str(" AND purchaser = ?");
        }
        let mut query = sqlx::query_as::<_, (Option<i64>, Option<i64>, i64)>(&sql);
        if let Some(b) = &filter.brand {
            query = query.bind(b);
        }
        if let Some(p) = &filter.purchaser {
            query = query.bind(p);
        }
        let (success, failed, total) = query.fetch_one(self.pool()).await?;
        Ok(CumulativeStats {
            success: success.unwrap_or(0),
            failed: failed.unwrap_or(0),
            total,
        })
    }

    async fn save_run_summary(&self, run_id: &str, summary_json: &str) -> Result<()> {
        sqlx::query("UPDATE tbl_runs SET summary = ? WHERE run_id = ?")
            .bind(summary_json)
            .bind(run_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn get_run_summary(&self, run_id: &str) -> Result<Option<String>> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT summary FROM tbl_runs WHERE run_id = ?")
                .bind(run_id)
                .fetch_optional(self.pool())
                .await?;
        Ok(row.and_then(|(s,)| s))
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let row: Option<(String, String, Option<String>, String, String, Option<String>)> =
            sqlx::query_as(
                "SELECT run_id, started_at, finished_at, status, case_id, summary
                 FROM tbl_runs WHERE run_id = ?",
            )
            .bind(run_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(|(run_id, started_at, finished_at, status, case_id, summary)| RunRecord {
            run_id,
            started_at: started_at.parse().unwrap_or_else(|_| Utc::now()),
            finished_at: finished_at.and_then(|s| s.parse().ok()),
            status: match status.as_str() {
                "done" => RunStatus::Done,
                "error" => RunStatus::Error,
                _ => RunStatus::Running,
            },
            case_id,
            summary,
        }))
    }
}
