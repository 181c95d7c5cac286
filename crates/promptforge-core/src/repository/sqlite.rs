//! Embedded SQLite job store.
//!
//! Process-local, single-writer: every mutating operation runs under an
//! internal mutex while reads go straight to the pool. Timestamps are stored
//! as fixed-width UTC text so lexicographic order matches chronological
//! order.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use tokio::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::models::{JobStatus, JobType};
use crate::repository::traits::{
    JobRecord, JobStore, JobUpdate, ListFilter, LogEntryRecord, LogQuery, ProgressEventRecord,
    MAX_LOG_ENTRIES, MAX_PROGRESS_EVENTS, ORPHAN_RECOVERY_MESSAGE,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    job_id TEXT PRIMARY KEY,
    status TEXT NOT NULL DEFAULT 'pending',
    job_type TEXT NOT NULL DEFAULT 'run',
    username TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    message TEXT,
    latest_metrics TEXT NOT NULL DEFAULT '{}',
    result TEXT,
    payload_overview TEXT NOT NULL DEFAULT '{}',
    payload TEXT
);
CREATE INDEX IF NOT EXISTS idx_jobs_username ON jobs(username);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at);

CREATE TABLE IF NOT EXISTS job_progress_events (
    job_id TEXT NOT NULL REFERENCES jobs(job_id) ON DELETE CASCADE,
    timestamp TEXT NOT NULL,
    event TEXT,
    metrics TEXT NOT NULL DEFAULT '{}',
    PRIMARY KEY (job_id, timestamp)
);

CREATE TABLE IF NOT EXISTS job_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL REFERENCES jobs(job_id) ON DELETE CASCADE,
    timestamp TEXT NOT NULL,
    level TEXT NOT NULL,
    logger TEXT NOT NULL,
    message TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_logs_job_id ON job_logs(job_id);
"#;

/// SQLite-backed job store.
pub struct SqliteJobStore {
    pool: Pool<Sqlite>,
    write_lock: Mutex<()>,
    max_progress_events: i64,
    max_log_entries: i64,
}

impl SqliteJobStore {
    /// Open (creating if missing) the database at `path` and ensure the schema.
    pub async fn connect(path: &str) -> Result<Self> {
        Self::connect_with_limits(path, MAX_PROGRESS_EVENTS, MAX_LOG_ENTRIES).await
    }

    /// Open with custom per-job caps on progress events and log entries.
    pub async fn connect_with_limits(
        path: &str,
        max_progress_events: i64,
        max_log_entries: i64,
    ) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);

        tracing::info!("Opening local SQLite job store at {path}");

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&pool).await?;
        }

        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
            max_progress_events,
            max_log_entries,
        })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

/// Fixed-width UTC text so string order equals time order.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Other(format!("Corrupted timestamp '{raw}': {e}")))
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

fn parse_json_map(raw: Option<String>) -> Map<String, Value> {
    raw.and_then(|s| serde_json::from_str::<Map<String, Value>>(&s).ok())
        .unwrap_or_default()
}

fn parse_json_value(raw: Option<String>) -> Option<Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

fn row_to_record(row: &SqliteRow) -> Result<JobRecord> {
    let status_raw: String = row.try_get("status")?;
    let job_type_raw: String = row.try_get("job_type")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(JobRecord {
        job_id: row.try_get("job_id")?,
        status: JobStatus::from_str(&status_raw)
            .ok_or_else(|| Error::Other(format!("Corrupted job status '{status_raw}'")))?,
        job_type: JobType::from_str(&job_type_raw).unwrap_or_default(),
        username: row.try_get("username")?,
        created_at: parse_ts(&created_at)?,
        started_at: parse_opt_ts(row.try_get("started_at")?)?,
        completed_at: parse_opt_ts(row.try_get("completed_at")?)?,
        message: row.try_get("message")?,
        latest_metrics: parse_json_map(row.try_get("latest_metrics")?),
        result: parse_json_value(row.try_get("result")?),
        payload_overview: parse_json_map(row.try_get("payload_overview")?),
        payload: parse_json_value(row.try_get("payload")?),
        progress_count: row.try_get("progress_count").unwrap_or(0),
        log_count: row.try_get("log_count").unwrap_or(0),
    })
}

const SELECT_WITH_COUNTS: &str = r#"
SELECT j.*,
       (SELECT COUNT(*) FROM job_progress_events e WHERE e.job_id = j.job_id) AS progress_count,
       (SELECT COUNT(*) FROM job_logs l WHERE l.job_id = j.job_id) AS log_count
FROM jobs j
"#;

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create_job(&self, job_id: &str) -> Result<JobRecord> {
        let now = Utc::now();
        let _guard = self.write_lock.lock().await;
        let inserted = sqlx::query(
            "INSERT INTO jobs (job_id, status, job_type, created_at, latest_metrics, payload_overview)
             VALUES (?1, 'pending', 'run', ?2, '{}', '{}')",
        )
        .bind(job_id)
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => {}
            Err(err) => {
                let unique = err
                    .as_database_error()
                    .map(|db| db.is_unique_violation())
                    .unwrap_or(false);
                if unique {
                    return Err(Error::conflict(format!("Job '{job_id}' already exists")));
                }
                return Err(err.into());
            }
        }

        Ok(JobRecord {
            job_id: job_id.to_string(),
            status: JobStatus::Pending,
            job_type: JobType::Run,
            username: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            message: None,
            latest_metrics: Map::new(),
            result: None,
            payload_overview: Map::new(),
            payload: None,
            progress_count: 0,
            log_count: 0,
        })
    }

    async fn update_job(&self, job_id: &str, update: JobUpdate) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query("SELECT status, latest_metrics FROM jobs WHERE job_id = ?1")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(current) = current else {
            return Ok(());
        };

        let status_raw: String = current.try_get("status")?;
        let terminal = JobStatus::from_str(&status_raw)
            .map(|s| s.is_terminal())
            .unwrap_or(false);
        let update = if terminal {
            update.without_terminal_fields()
        } else {
            update
        };
        if update.is_empty() {
            return Ok(());
        }

        let mut sets: Vec<&str> = Vec::new();
        let mut binds: Vec<String> = Vec::new();
        if let Some(status) = update.status {
            sets.push("status = ?");
            binds.push(status.as_str().to_string());
        }
        if let Some(job_type) = update.job_type {
            sets.push("job_type = ?");
            binds.push(job_type.as_str().to_string());
        }
        if let Some(message) = update.message {
            sets.push("message = ?");
            binds.push(message);
        }
        if let Some(started_at) = update.started_at {
            sets.push("started_at = ?");
            binds.push(fmt_ts(started_at));
        }
        if let Some(completed_at) = update.completed_at {
            sets.push("completed_at = ?");
            binds.push(fmt_ts(completed_at));
        }
        if let Some(metrics) = update.latest_metrics {
            let mut merged = parse_json_map(current.try_get("latest_metrics")?);
            merged.extend(metrics);
            sets.push("latest_metrics = ?");
            binds.push(serde_json::to_string(&merged)?);
        }
        if let Some(result) = update.result {
            sets.push("result = ?");
            binds.push(serde_json::to_string(&result)?);
        }
        if let Some(payload) = update.payload {
            sets.push("payload = ?");
            binds.push(serde_json::to_string(&payload)?);
        }

        let sql = format!("UPDATE jobs SET {} WHERE job_id = ?", sets.join(", "));
        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }
        query.bind(job_id).execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<JobRecord> {
        let sql = format!("{SELECT_WITH_COUNTS} WHERE j.job_id = ?1");
        let row = sqlx::query(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => row_to_record(&row),
            None => Err(Error::not_found(format!("Job '{job_id}' not found"))),
        }
    }

    async fn job_exists(&self, job_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM jobs WHERE job_id = ?1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn delete_job(&self, job_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM job_logs WHERE job_id = ?1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM job_progress_events WHERE job_id = ?1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM jobs WHERE job_id = ?1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn record_progress(
        &self,
        job_id: &str,
        event: Option<&str>,
        metrics: &Map<String, Value>,
    ) -> Result<()> {
        let now = Utc::now();
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query("SELECT latest_metrics FROM jobs WHERE job_id = ?1")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(current) = current else {
            // Job already deleted; drop the event.
            return Ok(());
        };

        // Duplicate timestamps are dropped: at-least-once delivery dedups here.
        sqlx::query(
            "INSERT INTO job_progress_events (job_id, timestamp, event, metrics)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (job_id, timestamp) DO NOTHING",
        )
        .bind(job_id)
        .bind(fmt_ts(now))
        .bind(event)
        .bind(serde_json::to_string(metrics)?)
        .execute(&mut *tx)
        .await?;

        if !metrics.is_empty() {
            let mut merged = parse_json_map(current.try_get("latest_metrics")?);
            merged.extend(metrics.clone());
            sqlx::query("UPDATE jobs SET latest_metrics = ?1 WHERE job_id = ?2")
                .bind(serde_json::to_string(&merged)?)
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
        }

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM job_progress_events WHERE job_id = ?1")
                .bind(job_id)
                .fetch_one(&mut *tx)
                .await?;
        if count > self.max_progress_events {
            sqlx::query(
                "DELETE FROM job_progress_events WHERE job_id = ?1 AND timestamp =
                 (SELECT MIN(timestamp) FROM job_progress_events WHERE job_id = ?1)",
            )
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_progress_events(&self, job_id: &str) -> Result<Vec<ProgressEventRecord>> {
        let rows = sqlx::query(
            "SELECT timestamp, event, metrics FROM job_progress_events
             WHERE job_id = ?1 ORDER BY timestamp ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let raw: String = row.try_get("timestamp")?;
                Ok(ProgressEventRecord {
                    timestamp: parse_ts(&raw)?,
                    event: row.try_get("event")?,
                    metrics: parse_json_map(row.try_get("metrics")?),
                })
            })
            .collect()
    }

    async fn get_progress_count(&self, job_id: &str) -> Result<i64> {
        let count =
            sqlx::query_scalar("SELECT COUNT(*) FROM job_progress_events WHERE job_id = ?1")
                .bind(job_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn append_log(
        &self,
        job_id: &str,
        level: &str,
        logger_name: &str,
        message: &str,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let ts = timestamp.unwrap_or_else(Utc::now);
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query("SELECT 1 FROM jobs WHERE job_id = ?1")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            // The worker may emit a final log after the job was deleted.
            return Ok(());
        }

        sqlx::query(
            "INSERT INTO job_logs (job_id, timestamp, level, logger, message)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(job_id)
        .bind(fmt_ts(ts))
        .bind(level)
        .bind(logger_name)
        .bind(message)
        .execute(&mut *tx)
        .await?;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_logs WHERE job_id = ?1")
            .bind(job_id)
            .fetch_one(&mut *tx)
            .await?;
        if count > self.max_log_entries {
            sqlx::query(
                "DELETE FROM job_logs WHERE id =
                 (SELECT id FROM job_logs WHERE job_id = ?1 ORDER BY timestamp ASC, id ASC LIMIT 1)",
            )
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_logs(&self, job_id: &str, query: &LogQuery) -> Result<Vec<LogEntryRecord>> {
        let mut sql = String::from(
            "SELECT timestamp, level, logger, message FROM job_logs WHERE job_id = ?",
        );
        if query.level.is_some() {
            sql.push_str(" AND LOWER(level) = LOWER(?)");
        }
        sql.push_str(" ORDER BY timestamp ASC, id ASC LIMIT ? OFFSET ?");

        let mut q = sqlx::query(&sql).bind(job_id);
        if let Some(level) = &query.level {
            q = q.bind(level);
        }
        // SQLite treats a negative LIMIT as unbounded.
        q = q.bind(query.limit.unwrap_or(-1)).bind(query.offset);

        let rows = q.fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                let raw: String = row.try_get("timestamp")?;
                Ok(LogEntryRecord {
                    timestamp: parse_ts(&raw)?,
                    level: row.try_get("level")?,
                    logger: row.try_get("logger")?,
                    message: row.try_get("message")?,
                })
            })
            .collect()
    }

    async fn get_log_count(&self, job_id: &str, level: Option<&str>) -> Result<i64> {
        let count: i64 = match level {
            Some(level) => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM job_logs WHERE job_id = ?1 AND LOWER(level) = LOWER(?2)",
                )
                .bind(job_id)
                .bind(level)
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM job_logs WHERE job_id = ?1")
                    .bind(job_id)
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count)
    }

    async fn set_payload_overview(
        &self,
        job_id: &str,
        overview: &Map<String, Value>,
    ) -> Result<()> {
        let username = overview
            .get("username")
            .and_then(Value::as_str)
            .map(str::to_string);
        let _guard = self.write_lock.lock().await;
        sqlx::query("UPDATE jobs SET payload_overview = ?1, username = ?2 WHERE job_id = ?3")
            .bind(serde_json::to_string(overview)?)
            .bind(username)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_jobs(&self, filter: &ListFilter) -> Result<Vec<JobRecord>> {
        let mut sql = format!("{SELECT_WITH_COUNTS} WHERE 1=1");
        if filter.status.is_some() {
            sql.push_str(" AND j.status = ?");
        }
        if filter.username.is_some() {
            sql.push_str(" AND j.username = ?");
        }
        if filter.job_type.is_some() {
            sql.push_str(" AND j.job_type = ?");
        }
        sql.push_str(" ORDER BY j.created_at DESC LIMIT ? OFFSET ?");

        let mut q = sqlx::query(&sql);
        if let Some(status) = filter.status {
            q = q.bind(status.as_str());
        }
        if let Some(username) = &filter.username {
            q = q.bind(username);
        }
        if let Some(job_type) = filter.job_type {
            q = q.bind(job_type.as_str());
        }
        q = q.bind(filter.limit).bind(filter.offset);

        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_record).collect()
    }

    async fn count_jobs(&self, filter: &ListFilter) -> Result<i64> {
        let mut sql = String::from("SELECT COUNT(*) FROM jobs j WHERE 1=1");
        if filter.status.is_some() {
            sql.push_str(" AND j.status = ?");
        }
        if filter.username.is_some() {
            sql.push_str(" AND j.username = ?");
        }
        if filter.job_type.is_some() {
            sql.push_str(" AND j.job_type = ?");
        }

        let mut q = sqlx::query_scalar(&sql);
        if let Some(status) = filter.status {
            q = q.bind(status.as_str());
        }
        if let Some(username) = &filter.username {
            q = q.bind(username);
        }
        if let Some(job_type) = filter.job_type {
            q = q.bind(job_type.as_str());
        }

        let count: i64 = q.fetch_one(&self.pool).await?;
        Ok(count)
    }

    async fn recover_orphaned_jobs(&self) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "UPDATE jobs SET status = 'failed', message = ?1, completed_at = ?2
             WHERE status IN ('running', 'validating')",
        )
        .bind(ORPHAN_RECOVERY_MESSAGE)
        .bind(fmt_ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        let count = result.rows_affected();
        if count > 0 {
            tracing::warn!("Recovered {count} orphaned jobs from previous run");
        }
        Ok(count)
    }

    async fn recover_pending_jobs(&self) -> Result<Vec<String>> {
        let rows = sqlx::query_scalar(
            "SELECT job_id FROM jobs WHERE status = 'pending' ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
