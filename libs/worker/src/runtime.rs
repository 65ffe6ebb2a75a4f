//! Container runtime interface and mock implementation.
//!
//! The runtime interface abstracts the OS-level container lifecycle:
//! - Looking up a container by handle
//! - Creating a container from an image and a mount table
//! - Destroying a container
//!
//! A mock implementation is provided for testing and development.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stevedore_id::ContainerHandle;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::types::ContainerLimits;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindMountMode {
    Ro,
    Rw,
}

/// A host path mounted into a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    pub src_path: String,
    pub dst_path: String,
    pub mode: BindMountMode,
}

/// Everything the runtime needs to create a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContainerSpec {
    pub handle: ContainerHandle,
    /// Rootfs location.
    pub image_url: String,
    pub privileged: bool,
    /// Mount table, in mount order.
    pub bind_mounts: Vec<BindMount>,
    pub env: Vec<String>,
    pub limits: ContainerLimits,
    pub properties: BTreeMap<String, String>,
}

/// A container known to the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContainer {
    pub handle: ContainerHandle,
    pub spec: RuntimeContainerSpec,
}

/// Container runtime interface.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Look up a container. `Ok(None)` when the runtime has no such container.
    async fn lookup(&self, handle: &ContainerHandle) -> Result<Option<RuntimeContainer>>;

    /// Create a container.
    async fn create(&self, spec: RuntimeContainerSpec) -> Result<RuntimeContainer>;

    /// Destroy a container.
    async fn destroy(&self, handle: &ContainerHandle) -> Result<()>;
}

/// Mock runtime for testing and development.
pub struct MockRuntime {
    containers: Mutex<HashMap<ContainerHandle, RuntimeContainer>>,

    /// Number of successful creates.
    create_counter: AtomicU64,

    /// Whether containers should "fail" to be created.
    fail_creates: bool,

    /// Simulated creation latency.
    create_delay: Duration,
}

impl MockRuntime {
    /// Create a new mock runtime.
    pub fn new() -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
            create_counter: AtomicU64::new(0),
            fail_creates: false,
            create_delay: Duration::from_millis(10),
        }
    }

    /// Create a mock runtime that fails all creates.
    pub fn failing() -> Self {
        Self {
            fail_creates: true,
            ..Self::new()
        }
    }

    /// Number of containers created over the runtime's lifetime.
    pub fn create_count(&self) -> u64 {
        self.create_counter.load(Ordering::SeqCst)
    }

    /// Number of containers currently alive.
    pub async fn container_count(&self) -> usize {
        self.containers.lock().await.len()
    }

    /// Drop a container without going through `destroy`, as if the runtime
    /// lost it.
    pub async fn forget(&self, handle: &ContainerHandle) {
        self.containers.lock().await.remove(handle);
    }

    /// Register a container directly, as if it survived a crash of its creator.
    pub async fn insert(&self, spec: RuntimeContainerSpec) -> RuntimeContainer {
        let container = RuntimeContainer {
            handle: spec.handle,
            spec,
        };
        self.containers
            .lock()
            .await
            .insert(container.handle, container.clone());
        container
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn lookup(&self, handle: &ContainerHandle) -> Result<Option<RuntimeContainer>> {
        Ok(self.containers.lock().await.get(handle).cloned())
    }

    async fn create(&self, spec: RuntimeContainerSpec) -> Result<RuntimeContainer> {
        if self.fail_creates {
            anyhow::bail!("Mock runtime configured to fail");
        }

        info!(
            container = %spec.handle,
            image = %spec.image_url,
            mounts = spec.bind_mounts.len(),
            privileged = spec.privileged,
            "[MOCK] Creating container"
        );

        tokio::time::sleep(self.create_delay).await;

        let mut containers = self.containers.lock().await;
        if containers.contains_key(&spec.handle) {
            anyhow::bail!("container {} already exists", spec.handle);
        }

        let container = RuntimeContainer {
            handle: spec.handle,
            spec,
        };
        containers.insert(container.handle, container.clone());
        self.create_counter.fetch_add(1, Ordering::SeqCst);

        debug!(container = %container.handle, "[MOCK] Container created");
        Ok(container)
    }

    async fn destroy(&self, handle: &ContainerHandle) -> Result<()> {
        info!(container = %handle, "[MOCK] Destroying container");

        if self.containers.lock().await.remove(handle).is_none() {
            anyhow::bail!("container {handle} not found");
        }
        Ok(())
    }
}
