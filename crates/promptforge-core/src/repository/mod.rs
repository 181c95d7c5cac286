//! Durable job persistence.
//!
//! Two interchangeable backends behind the [`JobStore`] trait: an embedded
//! SQLite store and a remote PostgreSQL store. Selection is a configuration
//! flag; callers only see `Arc<dyn JobStore>`.

pub mod postgres;
pub mod sqlite;
pub mod traits;

pub use postgres::PostgresJobStore;
pub use sqlite::SqliteJobStore;
pub use traits::{
    JobRecord, JobStore, JobUpdate, ListFilter, LogEntryRecord, LogQuery, ProgressEventRecord,
    MAX_LOG_ENTRIES, MAX_PROGRESS_EVENTS, ORPHAN_RECOVERY_MESSAGE,
};

use std::sync::Arc;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::{Error, Result};

/// Open the job store selected by configuration.
pub async fn connect_store(config: &StoreConfig) -> Result<Arc<dyn JobStore>> {
    match config.backend {
        StoreBackend::Local => {
            let store = SqliteJobStore::connect(&config.local_db_path).await?;
            Ok(Arc::new(store))
        }
        StoreBackend::Remote => {
            let url = config.remote_db_url.as_deref().ok_or_else(|| {
                Error::Config("Remote job store requires REMOTE_DB_URL".to_string())
            })?;
            let store = PostgresJobStore::connect(url).await?;
            Ok(Arc::new(store))
        }
    }
}
