//! stevedore Worker Core
//!
//! Decides which CI workers may run a piece of work, and realizes the
//! containers for that work on a chosen worker exactly once per container
//! identity.
//!
//! ## Flow
//!
//! ```text
//! WorkerSpec ──► satisfying_workers ──► Worker
//!                 (team, resource type,    │
//!                  platform, tags,         ▼
//!                  version gate)     find_or_create_container
//!                                     ├── ImageFetcher
//!                                     ├── provision_volumes ──► VolumeService
//!                                     ├── resolve_bind_mounts
//!                                     └── ContainerRuntime
//! ```
//!
//! Persistence, runtime, volume service and image fetching are collaborators
//! behind traits. `StateStore` is the SQLite persistence binding; the mocks
//! stand in for the rest in tests and development.
//!
//! ## Modules
//!
//! - `satisfy`: Worker matching and resource-type resolution
//! - `version`: Worker version gate
//! - `container`: Container find-or-create
//! - `provision`: Volumes of a new container
//! - `mounts`: Mount table of a new container
//! - `state`: Container and worker persistence

pub mod config;
pub mod container;
pub mod error;
pub mod image;
pub mod mounts;
pub mod observe;
pub mod provision;
pub mod runtime;
pub mod satisfy;
pub mod state;
pub mod telemetry;
pub mod types;
pub mod version;
pub mod volume;
pub mod worker;

// Re-export commonly used types
pub use config::WorkerConfig;
pub use container::Container;
pub use error::{ContainerError, ContainerResult, MatchError};
pub use image::{ImageFetcher, ImageFetchingDelegate, MockImageFetcher, NoopDelegate};
pub use observe::{ContainerObserver, CountingObserver, NoopObserver};
pub use runtime::{ContainerRuntime, MockRuntime};
pub use satisfy::{
    determine_underlying_type_name, satisfying_pool, satisfying_registrations, satisfying_workers,
};
pub use state::{ContainerRepository, ContainerState, StateStore, WorkerRepository};
pub use types::{
    ContainerIdentity, ContainerSpec, ResourceTypeCatalog, WorkerInfo, WorkerSpec,
};
pub use version::Version;
pub use volume::{ArtifactSource, BindMountSource, MockVolumeService, VolumeService};
pub use worker::{Worker, WorkerServices};
