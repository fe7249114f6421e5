use crate::infrastructure::error::EngineError;
use crate::infrastructure::storage::open_connection;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Per-account checkpoint kept between reconciliation passes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncState {
    pub sync_token: Option<String>,
    pub last_pull_at: Option<DateTime<Utc>>,
    pub last_push_at: Option<DateTime<Utc>>,
}

pub trait SyncStateRepository: Send + Sync {
    fn load(&self, owner_id: &str) -> Result<Option<SyncState>, EngineError>;
    fn save_pull_checkpoint(
        &self,
        owner_id: &str,
        sync_token: Option<&str>,
        pulled_at: DateTime<Utc>,
    ) -> Result<(), EngineError>;
    fn save_push_checkpoint(&self, owner_id: &str, pushed_at: DateTime<Utc>)
    -> Result<(), EngineError>;
    fn clear(&self, owner_id: &str) -> Result<(), EngineError>;
}

#[derive(Debug, Clone)]
pub struct SqliteSyncStateRepository {
    db_path: PathBuf,
}

impl SqliteSyncStateRepository {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    fn connect(&self) -> Result<Connection, EngineError> {
        open_connection(&self.db_path)
    }
}

impl SyncStateRepository for SqliteSyncStateRepository {
    fn load(&self, owner_id: &str) -> Result<Option<SyncState>, EngineError> {
        let connection = self.connect()?;
        let row: Option<(Option<String>, Option<String>, Option<String>)> = connection
            .query_row(
                "SELECT sync_token, last_pull_at, last_push_at FROM sync_state WHERE owner_id = ?1",
                [owner_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((sync_token, last_pull_at, last_push_at)) = row else {
            return Ok(None);
        };

        Ok(Some(SyncState {
            sync_token,
            last_pull_at: parse_checkpoint(last_pull_at, "last_pull_at")?,
            last_push_at: parse_checkpoint(last_push_at, "last_push_at")?,
        }))
    }

    fn save_pull_checkpoint(
        &self,
        owner_id: &str,
        sync_token: Option<&str>,
        pulled_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let connection = self.connect()?;
        connection.execute(
            "INSERT INTO sync_state (owner_id, sync_token, last_pull_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(owner_id) DO UPDATE SET
               sync_token = excluded.sync_token,
               last_pull_at = excluded.last_pull_at",
            params![owner_id, sync_token, pulled_at.to_rfc3339()],
        )?;
        Ok(())
    }

    fn save_push_checkpoint(
        &self,
        owner_id: &str,
        pushed_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let connection = self.connect()?;
        connection.execute(
            "INSERT INTO sync_state (owner_id, last_push_at)
             VALUES (?1, ?2)
             ON CONFLICT(owner_id) DO UPDATE SET last_push_at = excluded.last_push_at",
            params![owner_id, pushed_at.to_rfc3339()],
        )?;
        Ok(())
    }

    fn clear(&self, owner_id: &str) -> Result<(), EngineError> {
        let connection = self.connect()?;
        connection.execute("DELETE FROM sync_state WHERE owner_id = ?1", [owner_id])?;
        Ok(())
    }
}

fn parse_checkpoint(
    raw: Option<String>,
    field_name: &str,
) -> Result<Option<DateTime<Utc>>, EngineError> {
    raw.map(|value| {
        DateTime::parse_from_rfc3339(&value)
            .map(|parsed| parsed.with_timezone(&Utc))
            .map_err(|error| {
                EngineError::Persistence(format!(
                    "invalid sync_state.{field_name} '{value}': {error}"
                ))
            })
    })
    .transpose()
}

#[derive(Debug, Default)]
pub struct InMemorySyncStateRepository {
    states: Mutex<HashMap<String, SyncState>>,
}

impl InMemorySyncStateRepository {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, SyncState>>, EngineError> {
        self.states
            .lock()
            .map_err(|error| EngineError::Persistence(format!("sync state lock poisoned: {error}")))
    }
}

impl SyncStateRepository for InMemorySyncStateRepository {
    fn load(&self, owner_id: &str) -> Result<Option<SyncState>, EngineError> {
        Ok(self.lock()?.get(owner_id).cloned())
    }

    fn save_pull_checkpoint(
        &self,
        owner_id: &str,
        sync_token: Option<&str>,
        pulled_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let mut states = self.lock()?;
        let state = states.entry(owner_id.to_string()).or_default();
        state.sync_token = sync_token.map(ToOwned::to_owned);
        state.last_pull_at = Some(pulled_at);
        Ok(())
    }

    fn save_push_checkpoint(
        &self,
        owner_id: &str,
        pushed_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let mut states = self.lock()?;
        states.entry(owner_id.to_string()).or_default().last_push_at = Some(pushed_at);
        Ok(())
    }

    fn clear(&self, owner_id: &str) -> Result<(), EngineError> {
        self.lock()?.remove(owner_id);
        Ok(())
    }
}
