use sqlx::SqlitePool;

use crate::error::Result;

/// Applies idempotent `CREATE TABLE IF NOT EXISTS` / index statements and
/// tunes pragmas for single-writer durability. Table names are contractual:
/// external processes (the out-of-scope admin surface) read them directly.
pub async fn initialize(pool: &SqlitePool) -> Result<()> {
    sqlx::query("PRAGMA journal_mode = WAL").execute(pool).await?;
    sqlx::query("PRAGMA busy_timeout = 5000").execute(pool).await?;
    sqlx::query("PRAGMA foreign_keys = ON").execute(pool).await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tbl_file_registry (
            id          TEXT PRIMARY KEY,
            full_path   TEXT NOT NULL,
            brand       TEXT NOT NULL,
            purchaser   TEXT NOT NULL,
            size        INTEGER NOT NULL,
            etag        TEXT,
            sha256      TEXT,
            status      TEXT NOT NULL DEFAULT 'pending',
            run_id      TEXT,
            updated_at  TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_file_registry_brand ON tbl_file_registry(brand, purchaser)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_file_registry_full_path ON tbl_file_registry(full_path)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tbl_checkpoints (
            run_id          TEXT NOT NULL,
            relative_path   TEXT NOT NULL,
            file_path       TEXT NOT NULL,
            brand           TEXT NOT NULL,
            purchaser       TEXT NOT NULL,
            status          TEXT NOT NULL,
            started_at      TEXT,
            finished_at     TEXT,
            latency_ms      INTEGER,
            status_code     INTEGER,
            error_message   TEXT,
            pattern_key     TEXT,
            full_response   TEXT,
            PRIMARY KEY (run_id, relative_path)
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_checkpoints_status ON tbl_checkpoints(status)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_checkpoints_path ON tbl_checkpoints(relative_path)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tbl_runs (
            run_id      TEXT PRIMARY KEY,
            started_at  TEXT NOT NULL,
            finished_at TEXT,
            status      TEXT NOT NULL,
            case_id     TEXT NOT NULL,
            summary     TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tbl_sync_history (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp   TEXT NOT NULL,
            synced      INTEGER NOT NULL,
            skipped     INTEGER NOT NULL,
            errors      INTEGER NOT NULL,
            message     TEXT,
            brands      TEXT NOT NULL,
            purchasers  TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tbl_extraction_logs (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id      TEXT NOT NULL,
            timestamp   TEXT NOT NULL,
            level       TEXT NOT NULL,
            data        TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tbl_email_logs (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id      TEXT NOT NULL,
            timestamp   TEXT NOT NULL,
            recipient   TEXT,
            subject     TEXT,
            body        TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tbl_schedule_logs (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            schedule_id TEXT,
            timestamp   TEXT NOT NULL,
            outcome     TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tbl_cron_schedules (
            id          TEXT PRIMARY KEY,
            cron_expr   TEXT NOT NULL,
            case_id     TEXT NOT NULL,
            enabled     INTEGER NOT NULL DEFAULT 1
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tbl_app_config (
            key     TEXT PRIMARY KEY,
            value   TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("INSERT OR IGNORE INTO tbl_app_config (key, value) VALUES ('schema_version', '1')")
        .execute(pool)
        .await?;

    Ok(())
}
