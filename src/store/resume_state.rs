use async_trait::async_trait;

use crate::error::{IntelliExtractError, Result};

use super::{ResumeState, SqliteRecordStore};

const RESUME_STATE_KEY: &str = "resume_state";

/// Singleton k/v slot tracking an in-flight download so a crashed process
/// can clean up its `.part` file on the next `--resume`.
#[async_trait]
pub trait ResumeStateStore {
    async fn get_resume_state(&self) -> Result<ResumeState>;
    async fn set_resume_state(&self, state: &ResumeState) -> Result<()>;
    async fn clear_resume_state(&self) -> Result<()>;
}

#[async_trait]
impl ResumeStateStore for SqliteRecordStore {
    async fn get_resume_state(&self) -> Result<ResumeState> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM tbl_app_config WHERE key = ?")
                .bind(RESUME_STATE_KEY)
                .fetch_optional(self.pool())
                .await?;
        match row {
            Some((value,)) => serde_json::from_str(&value)
                .map_err(|e| IntelliExtractError::Store(sqlx::Error::Decode(Box::new(e)))),
            None => Ok(ResumeState::default()),
        }
    }

    async fn set_resume_state(&self, state: &ResumeState) -> Result<()> {
        let value = serde_json::to_string(state)
            .map_err(|e| IntelliExtractError::Store(sqlx::Error::Encode(Box::new(e))))?;
        sqlx::query(
            "INSERT INTO tbl_app_config (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(RESUME_STATE_KEY)
        .bind(value)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn clear_resume_state(&self) -> Result<()> {
        self.set_resume_state(&ResumeState::default()).await
    }
}
