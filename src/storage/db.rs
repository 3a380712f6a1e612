use std::{
    path::Path,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::{config::Database, storage::{error::StorageError, schema}};

pub type SecondsSinceUnix = i64;

/// How long a writer waits for another connection's transaction.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn open_in_memory() -> Result<rusqlite::Connection, rusqlite::Error> {
    Connection::open_in_memory()
}

pub fn open_from_file(path: &Path) -> Result<rusqlite::Connection, StorageError> {
    let db = Connection::open(path)?;
    db.busy_timeout(BUSY_TIMEOUT)?;
    schema::init(&db)?;
    Ok(db)
}

pub fn open(config: &Database) -> Result<rusqlite::Connection, StorageError> {
    if config.in_memory {
        let db = open_in_memory()?;
        schema::init(&db)?;
        return Ok(db);
    }

    let path = config.path.as_ref().ok_or_else(|| {
        StorageError::Internal(anyhow!("database.path is required unless in_memory = true"))
    })?;
    open_from_file(path)
}

/// converts time to number of seconds since unix_epoch
pub fn system_time_to_i64(time: SystemTime) -> anyhow::Result<SecondsSinceUnix> {
    i64::try_from(
        time.duration_since(UNIX_EPOCH)
            .with_context(|| "failed to get unix timestamp")?
            .as_secs(),
    )
    .with_context(|| "failed to convert timestamp to seconds")
}

pub fn now() -> Result<SecondsSinceUnix, StorageError> {
    system_time_to_i64(SystemTime::now()).map_err(StorageError::Internal)
}

/// converts number of seconds since unix epoch to a UTC date time
pub fn i64_seconds_to_utc(since_unix: SecondsSinceUnix) -> anyhow::Result<DateTime<Utc>> {
    DateTime::from_timestamp(since_unix, 0)
        .ok_or(anyhow!("failed to convert {since_unix} s timestamp to datetime"))
}

#[cfg(test)]
mod tests {
    use crate::{
        config::Database,
        storage::{db::open, schema},
    };

    use super::*;

    #[test]
    fn open_in_memory_db_initializes_schema() {
        let db = open(&Database {
            in_memory: true,
            path: None,
        })
        .unwrap();

        let mut stmt = db
            .prepare("SELECT name FROM sqlite_master WHERE type='table'")
            .unwrap();

        let tables: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();

        for table in schema::tables::ALL_TABLES {
            assert!(tables.contains(&table.to_string()));
        }
    }

    #[test]
    fn open_on_disk_requires_path() {
        let result = open(&Database {
            in_memory: false,
            path: None,
        });
        assert!(matches!(result, Err(StorageError::Internal(_))));
    }

    #[test]
    fn timestamps_round_trip() -> anyhow::Result<()> {
        let secs = system_time_to_i64(SystemTime::now())?;
        assert_eq!(i64_seconds_to_utc(secs)?.timestamp(), secs);
        Ok(())
    }
}
