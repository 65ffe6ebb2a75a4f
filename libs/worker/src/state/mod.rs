//! Persistence of workers and container records.
//!
//! Container records are the only state shared between concurrent callers.
//! The worker core never locks them itself: exactly-once realization of a
//! container rests on [`ContainerRepository::find_or_create_container`]
//! being atomic per identity, plus an advisory lock per handle taken through
//! the repository while the runtime container is created.
//!
//! [`StateStore`] is the SQLite binding of both repositories and also serves
//! as the in-memory store in tests.

mod lock;
mod store;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use stevedore_id::{ContainerHandle, TeamId};

use crate::types::{ContainerIdentity, WorkerInfo};

pub use lock::{container_creating_lock, Lock, LockSet};
pub use store::{StateStore, StateStoreError};

/// Lifecycle state of a container record.
///
/// `Creating` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    /// Handle allocated; the runtime container may not exist yet.
    Creating,
    /// The runtime container exists.
    Created,
    /// Creation failed. Never retried by the worker core.
    Failed,
}

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Created => "created",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "creating" => Some(Self::Creating),
            "created" => Some(Self::Created),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A persisted container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRecord {
    pub handle: ContainerHandle,
    pub worker_name: String,
    /// [`ContainerIdentity::key`] of the identity the container was created for.
    pub identity_key: String,
    pub team_id: TeamId,
    pub state: ContainerState,
    /// Unix seconds.
    pub created_at: i64,
    /// Unix seconds.
    pub updated_at: i64,
}

/// Container record persistence.
#[async_trait]
pub trait ContainerRepository: Send + Sync {
    /// Return the live (`Creating` or `Created`) record for `identity` on
    /// `worker_name`, or atomically insert a new `Creating` record with a
    /// freshly allocated handle.
    async fn find_or_create_container(
        &self,
        worker_name: &str,
        identity: &ContainerIdentity,
    ) -> Result<ContainerRecord>;

    /// Transition a `Creating` record to `Created`.
    async fn mark_created(&self, handle: &ContainerHandle) -> Result<ContainerRecord>;

    /// Transition a `Creating` record to `Failed`.
    async fn mark_failed(&self, handle: &ContainerHandle) -> Result<ContainerRecord>;

    /// Find a `Created` record belonging to `team_id`.
    async fn find_created_container_by_handle(
        &self,
        handle: &ContainerHandle,
        team_id: TeamId,
    ) -> Result<Option<ContainerRecord>>;

    /// Set the container's expiry to `ttl` from now.
    async fn update_container_ttl(&self, handle: &ContainerHandle, ttl: Duration) -> Result<()>;

    /// Delete the record.
    async fn reap_container(&self, handle: &ContainerHandle) -> Result<()>;

    /// Take the advisory lock `name` without waiting. `Ok(None)` if it is
    /// held elsewhere.
    async fn try_acquire_lock(&self, name: &str) -> Result<Option<Lock>>;
}

/// Worker registration lookup.
#[async_trait]
pub trait WorkerRepository: Send + Sync {
    async fn list_workers(&self) -> Result<Vec<WorkerInfo>>;

    async fn get_worker(&self, name: &str) -> Result<Option<WorkerInfo>>;
}
