//! Error types for worker matching and container provisioning.

use stevedore_id::ContainerHandle;
use thiserror::Error;

/// Reasons a worker cannot satisfy a [`WorkerSpec`](crate::WorkerSpec).
///
/// These are not fatal: the caller is expected to try another worker.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MatchError {
    #[error("mismatched team")]
    TeamMismatch,

    #[error("unsupported resource type")]
    UnsupportedResourceType,

    #[error("incompatible platform")]
    IncompatiblePlatform,

    #[error("mismatched tags")]
    MismatchedTags,
}

/// Errors from finding or creating a container on a worker.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The database says the container was created, but the runtime has no
    /// such container.
    #[error("container not found: {0}")]
    ContainerNotFound(ContainerHandle),

    #[error("persistence error: {0:#}")]
    Persistence(#[source] anyhow::Error),

    #[error("runtime lookup failed: {0:#}")]
    RuntimeLookup(#[source] anyhow::Error),

    #[error("failed to fetch image: {0:#}")]
    ImageFetch(#[source] anyhow::Error),

    #[error("failed to provision volumes: {0:#}")]
    VolumeProvision(#[source] anyhow::Error),

    #[error("failed to resolve bind mounts: {0:#}")]
    BindMount(#[source] anyhow::Error),

    #[error("failed to create runtime container: {0:#}")]
    RuntimeCreate(#[source] anyhow::Error),

    /// The runtime container was created but could not be recorded as such.
    /// The runtime container has been destroyed.
    #[error("failed to mark container as created: {0:#}")]
    PostCreatePersist(#[source] anyhow::Error),
}

impl ContainerError {
    /// Returns true if the persisted record was moved to `Failed`
    /// because of this error.
    pub fn marks_failed(&self) -> bool {
        matches!(
            self,
            Self::ImageFetch(_)
                | Self::VolumeProvision(_)
                | Self::BindMount(_)
                | Self::RuntimeCreate(_)
        )
    }
}

/// Result type for container operations.
pub type ContainerResult<T> = Result<T, ContainerError>;
