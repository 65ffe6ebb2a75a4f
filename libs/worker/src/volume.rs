//! Volumes and the volume-service interface.
//!
//! The volume service owns the bytes: it allocates volumes on a worker,
//! layers copy-on-write volumes on existing ones, and accepts streamed
//! artifacts. This module defines what the worker core needs from it, plus
//! the capabilities of the things that can be mounted into a container
//! (input artifacts and explicit bind sources).
//!
//! A mock implementation is provided for testing and development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use stevedore_id::{ContainerHandle, TeamId, VolumeHandle};
use tokio::sync::Mutex;
use tracing::debug;

use crate::state::ContainerRecord;
use crate::runtime::BindMount;
use crate::worker::Worker;

/// How a volume's initial contents are produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VolumeStrategy {
    /// An empty directory.
    Empty,
    /// Layered on an existing volume; data is copied only when written.
    CopyOnWrite { parent: VolumeHandle },
    /// Imported from a path on the worker's host.
    Import { path: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub strategy: VolumeStrategy,
    pub privileged: bool,
}

impl VolumeSpec {
    pub fn empty(privileged: bool) -> Self {
        Self {
            strategy: VolumeStrategy::Empty,
            privileged,
        }
    }
}

/// A volume allocated on a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub handle: VolumeHandle,
    pub worker_name: String,
    /// Path of the volume's data on the worker.
    pub path: String,
    pub privileged: bool,
    pub strategy: VolumeStrategy,
    pub team_id: TeamId,
    /// Container the volume was created for, if any.
    pub container: Option<ContainerHandle>,
    pub mount_path: Option<String>,
}

impl Volume {
    /// Strategy for a volume layered on this one.
    pub fn cow_strategy(&self) -> VolumeStrategy {
        VolumeStrategy::CopyOnWrite {
            parent: self.handle,
        }
    }
}

/// A volume and where it is mounted in a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub volume: Volume,
    pub mount_path: String,
}

/// Volume-service interface.
#[async_trait]
pub trait VolumeService: Send + Sync {
    /// Find or create the volume mounted at `mount_path` in `container`.
    async fn find_or_create_volume_for_container(
        &self,
        spec: &VolumeSpec,
        container: &ContainerRecord,
        team_id: TeamId,
        mount_path: &str,
    ) -> Result<Volume>;

    /// Find or create a copy-on-write volume layered on `parent`.
    async fn find_or_create_cow_volume_for_container(
        &self,
        spec: &VolumeSpec,
        container: &ContainerRecord,
        parent: &Volume,
        team_id: TeamId,
        mount_path: &str,
    ) -> Result<Volume>;

    /// Find or create the worker's shared certificates volume.
    async fn find_or_create_volume_for_resource_certs(&self) -> Result<Option<Volume>>;

    async fn lookup_volume(&self, handle: &VolumeHandle) -> Result<Option<Volume>>;

    async fn find_volume_for_resource_cache(&self, resource_cache_id: i64)
        -> Result<Option<Volume>>;

    async fn find_volume_for_task_cache(
        &self,
        team_id: TeamId,
        job_id: i64,
        step_name: &str,
        path: &str,
    ) -> Result<Option<Volume>>;

    /// Write an artifact into a volume.
    async fn stream_in(&self, volume: &Volume, data: Bytes) -> Result<()>;
}

/// Something that can be mounted as a container input.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// The volume already holding this artifact on `worker`, if any.
    async fn volume_on(&self, worker: &Worker) -> Result<Option<Volume>>;

    /// Copy the artifact into `destination` on `worker`.
    async fn stream_to(&self, worker: &Worker, destination: &Volume) -> Result<()>;
}

/// An explicit bind mount requested by the caller.
#[async_trait]
pub trait BindMountSource: Send + Sync {
    /// Resolve to a mount on `worker`, or `None` if there is nothing to mount.
    async fn volume_on(&self, worker: &Worker) -> Result<Option<BindMount>>;
}

/// Mock volume service for testing and development.
pub struct MockVolumeService {
    worker_name: String,
    /// Volumes by handle.
    volumes: Mutex<HashMap<VolumeHandle, Volume>>,
    /// Container volumes by (container, mount path).
    by_mount: Mutex<HashMap<(ContainerHandle, String), VolumeHandle>>,
    /// Streamed artifacts by volume.
    contents: Mutex<HashMap<VolumeHandle, Bytes>>,
    resource_caches: Mutex<HashMap<i64, VolumeHandle>>,
    creations: AtomicUsize,
    /// Fail volume creation once this many volumes have been created.
    fail_after: Option<usize>,
}

impl MockVolumeService {
    pub fn new(worker_name: impl Into<String>) -> Self {
        Self {
            worker_name: worker_name.into(),
            volumes: Mutex::new(HashMap::new()),
            by_mount: Mutex::new(HashMap::new()),
            contents: Mutex::new(HashMap::new()),
            resource_caches: Mutex::new(HashMap::new()),
            creations: AtomicUsize::new(0),
            fail_after: None,
        }
    }

    /// Create a mock that fails after creating `count` volumes.
    pub fn failing_after(worker_name: impl Into<String>, count: usize) -> Self {
        Self {
            fail_after: Some(count),
            ..Self::new(worker_name)
        }
    }

    /// Number of volumes created so far.
    pub fn creation_count(&self) -> usize {
        self.creations.load(Ordering::SeqCst)
    }

    /// Register a standalone volume, e.g. an artifact already on the worker.
    pub async fn add_volume(&self, strategy: VolumeStrategy) -> Volume {
        let handle = VolumeHandle::new();
        let volume = Volume {
            handle,
            worker_name: self.worker_name.clone(),
            path: format!("/volumes/live/{handle}"),
            privileged: false,
            strategy,
            team_id: TeamId::UNOWNED,
            container: None,
            mount_path: None,
        };
        self.volumes.lock().await.insert(handle, volume.clone());
        volume
    }

    /// Mark a volume as the cache of a resource version.
    pub async fn add_resource_cache(&self, resource_cache_id: i64, volume: &Volume) {
        self.resource_caches
            .lock()
            .await
            .insert(resource_cache_id, volume.handle);
    }

    /// Bytes streamed into a volume, if any.
    pub async fn contents(&self, handle: &VolumeHandle) -> Option<Bytes> {
        self.contents.lock().await.get(handle).cloned()
    }

    async fn create(
        &self,
        spec: &VolumeSpec,
        container: &ContainerRecord,
        team_id: TeamId,
        mount_path: &str,
    ) -> Result<Volume> {
        let key = (container.handle, mount_path.to_string());
        let mut by_mount = self.by_mount.lock().await;

        if let Some(handle) = by_mount.get(&key) {
            if let Some(volume) = self.volumes.lock().await.get(handle) {
                return Ok(volume.clone());
            }
        }

        if let Some(limit) = self.fail_after {
            if self.creations.load(Ordering::SeqCst) >= limit {
                anyhow::bail!("Mock volume service configured to fail");
            }
        }

        let handle = VolumeHandle::new();
        let volume = Volume {
            handle,
            worker_name: self.worker_name.clone(),
            path: format!("/volumes/live/{handle}"),
            privileged: spec.privileged,
            strategy: spec.strategy.clone(),
            team_id,
            container: Some(container.handle),
            mount_path: Some(mount_path.to_string()),
        };

        self.creations.fetch_add(1, Ordering::SeqCst);
        self.volumes.lock().await.insert(handle, volume.clone());
        by_mount.insert(key, handle);

        debug!(
            volume = %handle,
            container = %container.handle,
            mount_path = %mount_path,
            "[MOCK] Created volume"
        );

        Ok(volume)
    }
}

#[async_trait]
impl VolumeService for MockVolumeService {
    async fn find_or_create_volume_for_container(
        &self,
        spec: &VolumeSpec,
        container: &ContainerRecord,
        team_id: TeamId,
        mount_path: &str,
    ) -> Result<Volume> {
        self.create(spec, container, team_id, mount_path).await
    }

    async fn find_or_create_cow_volume_for_container(
        &self,
        spec: &VolumeSpec,
        container: &ContainerRecord,
        parent: &Volume,
        team_id: TeamId,
        mount_path: &str,
    ) -> Result<Volume> {
        if !self.volumes.lock().await.contains_key(&parent.handle) {
            anyhow::bail!("parent volume {} not found", parent.handle);
        }
        self.create(spec, container, team_id, mount_path).await
    }

    async fn find_or_create_volume_for_resource_certs(&self) -> Result<Option<Volume>> {
        let mut volumes = self.volumes.lock().await;
        let certs = volumes.values().find(|v| {
            matches!(&v.strategy, VolumeStrategy::Import { path } if path == "/etc/ssl/certs")
        });
        if let Some(volume) = certs {
            return Ok(Some(volume.clone()));
        }

        let handle = VolumeHandle::new();
        let volume = Volume {
            handle,
            worker_name: self.worker_name.clone(),
            path: format!("/volumes/live/{handle}"),
            privileged: false,
            strategy: VolumeStrategy::Import {
                path: "/etc/ssl/certs".to_string(),
            },
            team_id: TeamId::UNOWNED,
            container: None,
            mount_path: None,
        };
        volumes.insert(handle, volume.clone());
        Ok(Some(volume))
    }

    async fn lookup_volume(&self, handle: &VolumeHandle) -> Result<Option<Volume>> {
        Ok(self.volumes.lock().await.get(handle).cloned())
    }

    async fn find_volume_for_resource_cache(
        &self,
        resource_cache_id: i64,
    ) -> Result<Option<Volume>> {
        let Some(handle) = self.resource_caches.lock().await.get(&resource_cache_id).copied()
        else {
            return Ok(None);
        };
        self.lookup_volume(&handle).await
    }

    async fn find_volume_for_task_cache(
        &self,
        _team_id: TeamId,
        _job_id: i64,
        _step_name: &str,
        _path: &str,
    ) -> Result<Option<Volume>> {
        Ok(None)
    }

    async fn stream_in(&self, volume: &Volume, data: Bytes) -> Result<()> {
        if !self.volumes.lock().await.contains_key(&volume.handle) {
            anyhow::bail!("volume {} not found", volume.handle);
        }
        self.contents.lock().await.insert(volume.handle, data);
        Ok(())
    }
}
