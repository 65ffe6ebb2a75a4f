//! Data model shared by matching and provisioning.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use stevedore_id::TeamId;

use crate::volume::{ArtifactSource, BindMountSource};

// =============================================================================
// Workers
// =============================================================================

/// A resource type a worker provides natively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerResourceType {
    /// Type name, e.g. `git`.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Path of the type's root filesystem on the worker.
    pub image: String,
}

/// Registration snapshot of a worker. Read-only for the duration of a
/// matching or provisioning call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub name: String,
    pub platform: String,
    #[serde(default)]
    pub resource_types: Vec<WorkerResourceType>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Owning team; [`TeamId::UNOWNED`] for shared workers.
    #[serde(default)]
    pub team_id: TeamId,
    #[serde(default)]
    pub ephemeral: bool,
    /// Advertised software version.
    #[serde(default)]
    pub version: Option<String>,
    /// Unix seconds.
    pub start_time: i64,
    /// Containers currently reported by the worker.
    #[serde(default)]
    pub active_containers: u32,
}

// =============================================================================
// Resource Types
// =============================================================================

/// A user-defined resource type, declared in terms of another type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomResourceType {
    pub name: String,
    /// The type this one is built from. May itself be custom.
    #[serde(rename = "type")]
    pub base_type: String,
    /// Image configuration handed to the image fetcher.
    #[serde(default)]
    pub source: serde_json::Value,
    #[serde(default)]
    pub privileged: bool,
}

/// User-defined resource types by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceTypeCatalog {
    types: BTreeMap<String, CustomResourceType>,
}

impl ResourceTypeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, resource_type: CustomResourceType) {
        self.types.insert(resource_type.name.clone(), resource_type);
    }

    pub fn get(&self, name: &str) -> Option<&CustomResourceType> {
        self.types.get(name)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CustomResourceType> {
        self.types.values()
    }
}

impl FromIterator<CustomResourceType> for ResourceTypeCatalog {
    fn from_iter<I: IntoIterator<Item = CustomResourceType>>(iter: I) -> Self {
        let mut catalog = Self::new();
        for resource_type in iter {
            catalog.insert(resource_type);
        }
        catalog
    }
}

// =============================================================================
// Requests
// =============================================================================

/// Constraints a worker must meet to run a step.
#[derive(Debug, Clone, Default)]
pub struct WorkerSpec {
    pub team_id: TeamId,
    /// Resource type the step runs, if it is a resource step.
    pub resource_type: Option<String>,
    /// Catalog used to resolve `resource_type` to a base type.
    pub resource_types: ResourceTypeCatalog,
    pub platform: Option<String>,
    pub tags: Vec<String>,
}

/// Where a container's root filesystem comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageSource {
    /// A rootfs URL understood by the runtime.
    Url { url: String },
    /// The image of a (possibly custom) resource type.
    ResourceType { name: String },
    /// An image resource to fetch.
    Resource {
        #[serde(rename = "type")]
        resource_type: String,
        source: serde_json::Value,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
    pub source: ImageSource,
    #[serde(default)]
    pub privileged: bool,
}

/// Resource limits applied to the runtime container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerLimits {
    pub cpu_shares: Option<u64>,
    pub memory_bytes: Option<u64>,
}

/// An artifact mounted into a container.
#[derive(Clone)]
pub struct InputSource {
    pub source: Arc<dyn ArtifactSource>,
    pub destination_path: String,
}

impl std::fmt::Debug for InputSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputSource")
            .field("destination_path", &self.destination_path)
            .finish_non_exhaustive()
    }
}

/// Desired shape of a container.
#[derive(Clone)]
pub struct ContainerSpec {
    pub team_id: TeamId,
    pub image_spec: ImageSpec,
    /// Working directory.
    pub dir: Option<String>,
    pub user: Option<String>,
    pub env: Vec<String>,
    pub limits: ContainerLimits,
    pub inputs: Vec<InputSource>,
    /// Paths the step writes outputs to.
    pub outputs: Vec<String>,
    /// Explicit bind sources, mounted ahead of provisioned volumes.
    pub bind_mounts: Vec<Arc<dyn BindMountSource>>,
}

impl ContainerSpec {
    pub fn new(team_id: TeamId, image_spec: ImageSpec) -> Self {
        Self {
            team_id,
            image_spec,
            dir: None,
            user: None,
            env: Vec::new(),
            limits: ContainerLimits::default(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            bind_mounts: Vec::new(),
        }
    }
}

impl std::fmt::Debug for ContainerSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerSpec")
            .field("team_id", &self.team_id)
            .field("image_spec", &self.image_spec)
            .field("dir", &self.dir)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("bind_mounts", &self.bind_mounts.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Identity
// =============================================================================

/// What a container exists for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContainerOwner {
    /// A step of a build.
    BuildStep {
        build_id: i64,
        plan_id: String,
        team_id: TeamId,
    },
    /// A check of a resource configuration.
    ResourceCheck {
        resource_config_id: i64,
        team_id: TeamId,
    },
}

impl ContainerOwner {
    pub fn team_id(&self) -> TeamId {
        match self {
            Self::BuildStep { team_id, .. } | Self::ResourceCheck { team_id, .. } => *team_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerType {
    Check,
    Get,
    Put,
    Task,
}

/// Descriptive metadata recorded with a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerMetadata {
    #[serde(rename = "type")]
    pub container_type: ContainerType,
    #[serde(default)]
    pub step_name: Option<String>,
    #[serde(default)]
    pub pipeline_id: Option<i64>,
    #[serde(default)]
    pub job_id: Option<i64>,
    #[serde(default)]
    pub build_id: Option<i64>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
}

impl ContainerMetadata {
    pub fn new(container_type: ContainerType) -> Self {
        Self {
            container_type,
            step_name: None,
            pipeline_id: None,
            job_id: None,
            build_id: None,
            working_directory: None,
            user: None,
        }
    }
}

/// Owner plus metadata: names one logical container. Requests with equal
/// identities converge on the same container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerIdentity {
    pub owner: ContainerOwner,
    pub metadata: ContainerMetadata,
}

impl ContainerIdentity {
    pub fn new(owner: ContainerOwner, metadata: ContainerMetadata) -> Self {
        Self { owner, metadata }
    }

    pub fn team_id(&self) -> TeamId {
        self.owner.team_id()
    }

    /// Deterministic key for this identity: the hex SHA-256 of its owner
    /// and metadata encodings.
    pub fn key(&self) -> Result<String, serde_json::Error> {
        let mut hasher = Sha256::new();
        // Field order is fixed by the derive, so the encoding is stable.
        hasher.update(serde_json::to_vec(&self.owner)?);
        hasher.update(b":");
        hasher.update(serde_json::to_vec(&self.metadata)?);
        Ok(hex::encode(hasher.finalize()))
    }
}

// =============================================================================
// Images
// =============================================================================

/// Image configuration that shapes the runtime container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub user: Option<String>,
}

/// Result of fetching a container's image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedImage {
    /// Rootfs location understood by the runtime.
    pub url: String,
    pub privileged: bool,
    pub metadata: ImageMetadata,
    /// Version of the image resource, if one was fetched.
    #[serde(default)]
    pub version: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(build_id: i64) -> ContainerIdentity {
        ContainerIdentity::new(
            ContainerOwner::BuildStep {
                build_id,
                plan_id: "plan-1".to_string(),
                team_id: TeamId::new(1),
            },
            ContainerMetadata::new(ContainerType::Task),
        )
    }

    #[test]
    fn test_identity_key_deterministic() {
        assert_eq!(identity(7).key().unwrap(), identity(7).key().unwrap());
        assert_ne!(identity(7).key().unwrap(), identity(8).key().unwrap());
    }

    #[test]
    fn test_identity_key_is_sha256_hex() {
        let key = identity(7).key().unwrap();
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_identity_key_covers_metadata() {
        let a = identity(7);
        let mut b = identity(7);
        b.metadata.step_name = Some("unit".to_string());
        assert_ne!(a.key().unwrap(), b.key().unwrap());
    }

    #[test]
    fn test_catalog_from_json() {
        let catalog: ResourceTypeCatalog = serde_json::from_value(serde_json::json!({
            "my-git": { "name": "my-git", "type": "git" }
        }))
        .unwrap();
        assert_eq!(catalog.get("my-git").unwrap().base_type, "git");
    }
}
