//! Remote PostgreSQL job store.
//!
//! Concurrency is delegated to the database: no local lock, and the
//! terminal-state freeze uses `SELECT ... FOR UPDATE` inside a transaction.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Pool, Postgres, Row};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::models::{JobStatus, JobType};
use crate::repository::traits::{
    JobRecord, JobStore, JobUpdate, ListFilter, LogEntryRecord, LogQuery, ProgressEventRecord,
    MAX_LOG_ENTRIES, MAX_PROGRESS_EVENTS, ORPHAN_RECOVERY_MESSAGE,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    job_id VARCHAR(36) PRIMARY KEY,
    status VARCHAR(20) NOT NULL DEFAULT 'pending',
    job_type VARCHAR(20) NOT NULL DEFAULT 'run',
    username VARCHAR(255),
    created_at TIMESTAMPTZ NOT NULL,
    started_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ,
    message TEXT,
    latest_metrics JSONB NOT NULL DEFAULT '{}',
    result JSONB,
    payload_overview JSONB NOT NULL DEFAULT '{}',
    payload JSONB
);
CREATE INDEX IF NOT EXISTS idx_jobs_username ON jobs(username);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at);

CREATE TABLE IF NOT EXISTS job_progress_events (
    job_id VARCHAR(36) NOT NULL REFERENCES jobs(job_id) ON DELETE CASCADE,
    timestamp TIMESTAMPTZ NOT NULL,
    event VARCHAR(255),
    metrics JSONB NOT NULL DEFAULT '{}',
    PRIMARY KEY (job_id, timestamp)
);

CREATE TABLE IF NOT EXISTS job_logs (
    id BIGSERIAL PRIMARY KEY,
    job_id VARCHAR(36) NOT NULL REFERENCES jobs(job_id) ON DELETE CASCADE,
    timestamp TIMESTAMPTZ NOT NULL,
    level VARCHAR(20) NOT NULL,
    logger VARCHAR(255) NOT NULL,
    message TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_logs_job_id ON job_logs(job_id);
"#;

/// PostgreSQL-backed job store.
pub struct PostgresJobStore {
    pool: Pool<Postgres>,
    max_progress_events: i64,
    max_log_entries: i64,
}

impl PostgresJobStore {
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_limits(url, MAX_PROGRESS_EVENTS, MAX_LOG_ENTRIES).await
    }

    pub async fn connect_with_limits(
        url: &str,
        max_progress_events: i64,
        max_log_entries: i64,
    ) -> Result<Self> {
        tracing::info!("Connecting to remote PostgreSQL job store");
        let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;

        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&pool).await?;
        }

        Ok(Self {
            pool,
            max_progress_events,
            max_log_entries,
        })
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

fn json_map(value: Option<Value>) -> Map<String, Value> {
    match value {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

fn row_to_record(row: &PgRow) -> Result<JobRecord> {
    let status_raw: String = row.try_get("status")?;
    let job_type_raw: String = row.try_get("job_type")?;
    Ok(JobRecord {
        job_id: row.try_get("job_id")?,
        status: JobStatus::from_str(&status_raw)
            .ok_or_else(|| Error::Other(format!("Corrupted job status '{status_raw}'")))?,
        job_type: JobType::from_str(&job_type_raw).unwrap_or_default(),
        username: row.try_get("username")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        message: row.try_get("message")?,
        latest_metrics: json_map(row.try_get("latest_metrics")?),
        result: row.try_get("result")?,
        payload_overview: json_map(row.try_get("payload_overview")?),
        payload: row.try_get("payload")?,
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
impl JobStore for PostgresJobStore {
    async fn create_job(&self, job_id: &str) -> Result<JobRecord> {
        let now = Utc::now();
        let inserted = sqlx::query(
            "INSERT INTO jobs (job_id, status, job_type, created_at, latest_metrics, payload_overview)
             VALUES ($1, 'pending', 'run', $2, '{}', '{}')",
        )
        .bind(job_id)
        .bind(now)
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
        let mut tx = self.pool.begin().await?;

        let current =
            sqlx::query("SELECT status, latest_metrics FROM jobs WHERE job_id = $1 FOR UPDATE")
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

        let merged_metrics = match &update.latest_metrics {
            Some(metrics) => {
                let mut merged = json_map(current.try_get("latest_metrics")?);
                merged.extend(metrics.clone());
                Some(Value::Object(merged))
            }
            None => None,
        };

        let mut sets: Vec<String> = Vec::new();
        let mut index = 1usize;
        for (column, present) in [
            ("status", update.status.is_some()),
            ("job_type", update.job_type.is_some()),
            ("message", update.message.is_some()),
            ("started_at", update.started_at.is_some()),
            ("completed_at", update.completed_at.is_some()),
            ("latest_metrics", merged_metrics.is_some()),
            ("result", update.result.is_some()),
            ("payload", update.payload.is_some()),
        ] {
            if present {
                sets.push(format!("{column} = ${index}"));
                index += 1;
            }
        }

        let sql = format!(
            "UPDATE jobs SET {} WHERE job_id = ${index}",
            sets.join(", ")
        );
        let mut query = sqlx::query(&sql);
        if let Some(status) = update.status {
            query = query.bind(status.as_str());
        }
        if let Some(job_type) = update.job_type {
            query = query.bind(job_type.as_str());
        }
        if let Some(message) = update.message {
            query = query.bind(message);
        }
        if let Some(started_at) = update.started_at {
            query = query.bind(started_at);
        }
        if let Some(completed_at) = update.completed_at {
            query = query.bind(completed_at);
        }
        if let Some(metrics) = merged_metrics {
            query = query.bind(metrics);
        }
        if let Some(result) = update.result {
            query = query.bind(result);
        }
        if let Some(payload) = update.payload {
            query = query.bind(payload);
        }
        query.bind(job_id).execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<JobRecord> {
        let sql = format!("{SELECT_WITH_COUNTS} WHERE j.job_id = $1");
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
        let row = sqlx::query("SELECT 1 FROM jobs WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn delete_job(&self, job_id: &str) -> Result<()> {
        // Child rows cascade via the foreign keys.
        sqlx::query("DELETE FROM jobs WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_progress(
        &self,
        job_id: &str,
        event: Option<&str>,
        metrics: &Map<String, Value>,
    ) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let current =
            sqlx::query("SELECT latest_metrics FROM jobs WHERE job_id = $1 FOR UPDATE")
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(current) = current else {
            return Ok(());
        };

        sqlx::query(
            "INSERT INTO job_progress_events (job_id, timestamp, event, metrics)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (job_id, timestamp) DO NOTHING",
        )
        .bind(job_id)
        .bind(now)
        .bind(event)
        .bind(Value::Object(metrics.clone()))
        .execute(&mut *tx)
        .await?;

        if !metrics.is_empty() {
            let mut merged = json_map(current.try_get("latest_metrics")?);
            merged.extend(metrics.clone());
            sqlx::query("UPDATE jobs SET latest_metrics = $1 WHERE job_id = $2")
                .bind(Value::Object(merged))
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
        }

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM job_progress_events WHERE job_id = $1")
                .bind(job_id)
                .fetch_one(&mut *tx)
                .await?;
        if count > self.max_progress_events {
            sqlx::query(
                "DELETE FROM job_progress_events WHERE job_id = $1 AND timestamp =
                 (SELECT MIN(timestamp) FROM job_progress_events WHERE job_id = $1)",
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
             WHERE job_id = $1 ORDER BY timestamp ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ProgressEventRecord {
                    timestamp: row.try_get("timestamp")?,
                    event: row.try_get("event")?,
                    metrics: json_map(row.try_get("metrics")?),
                })
            })
            .collect()
    }

    async fn get_progress_count(&self, job_id: &str) -> Result<i64> {
        let count =
            sqlx::query_scalar("SELECT COUNT(*) FROM job_progress_events WHERE job_id = $1")
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
        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query("SELECT 1 FROM jobs WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Ok(());
        }

        sqlx::query(
            "INSERT INTO job_logs (job_id, timestamp, level, logger, message)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(job_id)
        .bind(ts)
        .bind(level)
        .bind(logger_name)
        .bind(message)
        .execute(&mut *tx)
        .await?;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_logs WHERE job_id = $1")
            .bind(job_id)
            .fetch_one(&mut *tx)
            .await?;
        if count > self.max_log_entries {
            sqlx::query(
                "DELETE FROM job_logs WHERE id =
                 (SELECT id FROM job_logs WHERE job_id = $1 ORDER BY timestamp ASC, id ASC LIMIT 1)",
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
            "SELECT timestamp, level, logger, message FROM job_logs WHERE job_id = $1",
        );
        let mut index = 2usize;
        if query.level.is_some() {
            sql.push_str(&format!(" AND LOWER(level) = LOWER(${index})"));
            index += 1;
        }
        // A NULL limit means no limit in PostgreSQL.
        sql.push_str(&format!(
            " ORDER BY timestamp ASC, id ASC LIMIT ${index} OFFSET ${}",
            index + 1
        ));

        let mut q = sqlx::query(&sql).bind(job_id);
        if let Some(level) = &query.level {
            q = q.bind(level);
        }
        q = q.bind(query.limit).bind(query.offset);

        let rows = q.fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                Ok(LogEntryRecord {
                    timestamp: row.try_get("timestamp")?,
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
                    "SELECT COUNT(*) FROM job_logs WHERE job_id = $1 AND LOWER(level) = LOWER($2)",
                )
                .bind(job_id)
                .bind(level)
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM job_logs WHERE job_id = $1")
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
        sqlx::query("UPDATE jobs SET payload_overview = $1, username = $2 WHERE job_id = $3")
            .bind(Value::Object(overview.clone()))
            .bind(username)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_jobs(&self, filter: &ListFilter) -> Result<Vec<JobRecord>> {
        let mut sql = format!("{SELECT_WITH_COUNTS} WHERE 1=1");
        let mut index = 1usize;
        if filter.status.is_some() {
            sql.push_str(&format!(" AND j.status = ${index}"));
            index += 1;
        }
        if filter.username.is_some() {
            sql.push_str(&format!(" AND j.username = ${index}"));
            index += 1;
        }
        if filter.job_type.is_some() {
            sql.push_str(&format!(" AND j.job_type = ${index}"));
            index += 1;
        }
        sql.push_str(&format!(
            " ORDER BY j.created_at DESC LIMIT ${index} OFFSET ${}",
            index + 1
        ));

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
        let mut index = 1usize;
        if filter.status.is_some() {
            sql.push_str(&format!(" AND j.status = ${index}"));
            index += 1;
        }
        if filter.username.is_some() {
            sql.push_str(&format!(" AND j.username = ${index}"));
            index += 1;
        }
        if filter.job_type.is_some() {
            sql.push_str(&format!(" AND j.job_type = ${index}"));
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
        let result = sqlx::query(
            "UPDATE jobs SET status = 'failed', message = $1, completed_at = $2
             WHERE status IN ('running', 'validating')",
        )
        .bind(ORPHAN_RECOVERY_MESSAGE)
        .bind(Utc::now())
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
