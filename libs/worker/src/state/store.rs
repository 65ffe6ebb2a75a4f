//! SQLite-based state store.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use stevedore_id::{ContainerHandle, TeamId};
use thiserror::Error;
use tracing::debug;

use super::{ContainerRecord, ContainerRepository, ContainerState, Lock, LockSet, WorkerRepository};
use crate::config::WorkerConfig;
use crate::types::{ContainerIdentity, WorkerInfo};

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("State not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    Invalid(String),
}

const CONTAINER_COLUMNS: &str =
    "handle, worker_name, identity_key, team_id, state, created_at, updated_at";

/// SQLite state store.
///
/// Advisory locks are held in process, so they only exclude callers sharing
/// this store.
pub struct StateStore {
    conn: Mutex<Connection>,
    locks: LockSet,
}

impl StateStore {
    /// Open or create a state store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateStoreError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
            locks: LockSet::new(),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// Open the store at the configured state path, creating its directory
    /// if needed.
    pub fn open_from_config(config: &WorkerConfig) -> Result<Self, StateStoreError> {
        if let Some(parent) = config.state_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        debug!(path = %config.state_path.display(), "Opening state store");
        Self::open(&config.state_path)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StateStoreError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            locks: LockSet::new(),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StateStoreError> {
        self.conn
            .lock()
            .map_err(|_| StateStoreError::Invalid("state store lock poisoned".to_string()))
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<(), StateStoreError> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS workers (
                name TEXT PRIMARY KEY,
                info TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS containers (
                handle TEXT PRIMARY KEY,
                worker_name TEXT NOT NULL,
                identity_key TEXT NOT NULL,
                identity TEXT NOT NULL,
                team_id INTEGER NOT NULL,
                state TEXT NOT NULL,
                expires_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_containers_live_identity
                ON containers(worker_name, identity_key)
                WHERE state IN ('creating', 'created');

            CREATE INDEX IF NOT EXISTS idx_containers_state ON containers(state);
            "#,
        )?;

        debug!("State store schema initialized");
        Ok(())
    }

    /// Insert or update a worker registration.
    pub fn save_worker(&self, worker: &WorkerInfo) -> Result<(), StateStoreError> {
        let info = serde_json::to_string(worker)?;
        let now = chrono::Utc::now().timestamp();
        self.conn()?.execute(
            r#"
            INSERT INTO workers (name, info, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(name) DO UPDATE SET
                info = excluded.info,
                updated_at = excluded.updated_at
            "#,
            params![worker.name, info, now],
        )?;
        Ok(())
    }

    /// Get a worker registration.
    pub fn get_worker(&self, name: &str) -> Result<Option<WorkerInfo>, StateStoreError> {
        let info: Option<String> = self
            .conn()?
            .query_row(
                "SELECT info FROM workers WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;

        info.map(|info| serde_json::from_str(&info))
            .transpose()
            .map_err(Into::into)
    }

    /// List all worker registrations.
    pub fn list_workers(&self) -> Result<Vec<WorkerInfo>, StateStoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT info FROM workers ORDER BY name")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        rows.iter()
            .map(|info| serde_json::from_str(info).map_err(Into::into))
            .collect()
    }

    /// Delete a worker registration.
    pub fn delete_worker(&self, name: &str) -> Result<(), StateStoreError> {
        self.conn()?
            .execute("DELETE FROM workers WHERE name = ?1", params![name])?;
        Ok(())
    }

    /// Find the live record for an identity, or insert a `Creating` one.
    ///
    /// Runs in one immediate transaction under the connection lock, so
    /// concurrent callers with the same identity observe the same record.
    pub fn find_or_create_container(
        &self,
        worker_name: &str,
        identity: &ContainerIdentity,
    ) -> Result<ContainerRecord, StateStoreError> {
        let identity_key = identity.key()?;
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let existing = tx
            .query_row(
                &format!(
                    "SELECT {CONTAINER_COLUMNS} FROM containers
                     WHERE worker_name = ?1 AND identity_key = ?2
                       AND state IN ('creating', 'created')"
                ),
                params![worker_name, identity_key],
                container_from_row,
            )
            .optional()?;

        if let Some(record) = existing {
            tx.commit()?;
            return Ok(record);
        }

        let now = chrono::Utc::now().timestamp();
        let record = ContainerRecord {
            handle: ContainerHandle::new(),
            worker_name: worker_name.to_string(),
            identity_key,
            team_id: identity.team_id(),
            state: ContainerState::Creating,
            created_at: now,
            updated_at: now,
        };

        tx.execute(
            r#"
            INSERT INTO containers (handle, worker_name, identity_key, identity, team_id, state, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                record.handle.to_string(),
                record.worker_name,
                record.identity_key,
                serde_json::to_string(identity)?,
                record.team_id.value(),
                record.state.as_str(),
                record.created_at,
                record.updated_at,
            ],
        )?;
        tx.commit()?;

        debug!(container = %record.handle, worker = %worker_name, "Inserted creating container");
        Ok(record)
    }

    /// Get a container record.
    pub fn get_container(
        &self,
        handle: &ContainerHandle,
    ) -> Result<Option<ContainerRecord>, StateStoreError> {
        self.conn()?
            .query_row(
                &format!("SELECT {CONTAINER_COLUMNS} FROM containers WHERE handle = ?1"),
                params![handle.to_string()],
                container_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Move a record from `from` to `to`.
    pub fn transition_container(
        &self,
        handle: &ContainerHandle,
        from: ContainerState,
        to: ContainerState,
    ) -> Result<ContainerRecord, StateStoreError> {
        let now = chrono::Utc::now().timestamp();
        let updated = self.conn()?.execute(
            "UPDATE containers SET state = ?1, updated_at = ?2 WHERE handle = ?3 AND state = ?4",
            params![to.as_str(), now, handle.to_string(), from.as_str()],
        )?;

        if updated == 0 {
            return match self.get_container(handle)? {
                Some(record) => Err(StateStoreError::Invalid(format!(
                    "container {handle} is {}, expected {}",
                    record.state.as_str(),
                    from.as_str()
                ))),
                None => Err(StateStoreError::NotFound(handle.to_string())),
            };
        }

        self.get_container(handle)?
            .ok_or_else(|| StateStoreError::NotFound(handle.to_string()))
    }

    /// Find a `Created` record belonging to a team.
    pub fn find_created_container_by_handle(
        &self,
        handle: &ContainerHandle,
        team_id: TeamId,
    ) -> Result<Option<ContainerRecord>, StateStoreError> {
        self.conn()?
            .query_row(
                &format!(
                    "SELECT {CONTAINER_COLUMNS} FROM containers
                     WHERE handle = ?1 AND team_id = ?2 AND state = 'created'"
                ),
                params![handle.to_string(), team_id.value()],
                container_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Set a container's expiry.
    pub fn set_container_expiry(
        &self,
        handle: &ContainerHandle,
        expires_at: i64,
    ) -> Result<(), StateStoreError> {
        let updated = self.conn()?.execute(
            "UPDATE containers SET expires_at = ?1 WHERE handle = ?2",
            params![expires_at, handle.to_string()],
        )?;
        if updated == 0 {
            return Err(StateStoreError::NotFound(handle.to_string()));
        }
        Ok(())
    }

    /// Get a container's expiry (Unix seconds), if one is set.
    pub fn container_expiry(&self, handle: &ContainerHandle) -> Result<Option<i64>, StateStoreError> {
        self.conn()?
            .query_row(
                "SELECT expires_at FROM containers WHERE handle = ?1",
                params![handle.to_string()],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()
            .map(Option::flatten)
            .map_err(Into::into)
    }

    /// Delete a container record.
    pub fn delete_container(&self, handle: &ContainerHandle) -> Result<(), StateStoreError> {
        self.conn()?.execute(
            "DELETE FROM containers WHERE handle = ?1",
            params![handle.to_string()],
        )?;
        Ok(())
    }

    /// Count container records by state.
    pub fn count_containers_by_state(&self, state: ContainerState) -> Result<i64, StateStoreError> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM containers WHERE state = ?1",
            params![state.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn container_from_row(row: &Row<'_>) -> rusqlite::Result<ContainerRecord> {
    let handle: String = row.get(0)?;
    let handle = handle
        .parse::<ContainerHandle>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;

    let state: String = row.get(4)?;
    let state = ContainerState::parse(&state).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            Type::Text,
            format!("unknown container state {state:?}").into(),
        )
    })?;

    Ok(ContainerRecord {
        handle,
        worker_name: row.get(1)?,
        identity_key: row.get(2)?,
        team_id: TeamId::new(row.get(3)?),
        state,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

#[async_trait]
impl ContainerRepository for StateStore {
    async fn find_or_create_container(
        &self,
        worker_name: &str,
        identity: &ContainerIdentity,
    ) -> anyhow::Result<ContainerRecord> {
        Ok(StateStore::find_or_create_container(self, worker_name, identity)?)
    }

    async fn mark_created(&self, handle: &ContainerHandle) -> anyhow::Result<ContainerRecord> {
        Ok(self.transition_container(handle, ContainerState::Creating, ContainerState::Created)?)
    }

    async fn mark_failed(&self, handle: &ContainerHandle) -> anyhow::Result<ContainerRecord> {
        Ok(self.transition_container(handle, ContainerState::Creating, ContainerState::Failed)?)
    }

    async fn find_created_container_by_handle(
        &self,
        handle: &ContainerHandle,
        team_id: TeamId,
    ) -> anyhow::Result<Option<ContainerRecord>> {
        Ok(StateStore::find_created_container_by_handle(self, handle, team_id)?)
    }

    async fn update_container_ttl(
        &self,
        handle: &ContainerHandle,
        ttl: Duration,
    ) -> anyhow::Result<()> {
        let expires_at = i64::try_from(ttl.as_secs())
            .ok()
            .and_then(|secs| chrono::Utc::now().timestamp().checked_add(secs))
            .ok_or_else(|| StateStoreError::Invalid(format!("container ttl {ttl:?} out of range")))?;
        Ok(self.set_container_expiry(handle, expires_at)?)
    }

    async fn reap_container(&self, handle: &ContainerHandle) -> anyhow::Result<()> {
        Ok(self.delete_container(handle)?)
    }

    async fn try_acquire_lock(&self, name: &str) -> anyhow::Result<Option<Lock>> {
        let lock = self.locks.try_acquire(name);
        if lock.is_none() {
            debug!(lock = %name, "Lock already held");
        }
        Ok(lock)
    }
}

#[async_trait]
impl WorkerRepository for StateStore {
    async fn list_workers(&self) -> anyhow::Result<Vec<WorkerInfo>> {
        Ok(StateStore::list_workers(self)?)
    }

    async fn get_worker(&self, name: &str) -> anyhow::Result<Option<WorkerInfo>> {
        Ok(StateStore::get_worker(self, name)?)
    }
}
