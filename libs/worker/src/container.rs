//! Find-or-create of containers.
//!
//! A container identity moves through `Creating` to either `Created` or
//! `Failed`, both terminal:
//!
//! 1. the repository returns the live record for the identity, or inserts a
//!    `Creating` one with a fresh handle
//! 2. the runtime is asked for a container with that handle
//! 3. a `Created` record must have a runtime container; a missing one is an
//!    orphan and is never re-created
//! 4. a `Creating` record without a runtime container is realized: image,
//!    volumes, mounts, then the runtime container. Any failure marks the
//!    record `Failed`
//! 5. the record is marked `Created`; if that fails the runtime container
//!    is destroyed again
//!
//! Steps 2 to 5 run under the handle's creating lock, so concurrent callers
//! for one identity realize it once.

use std::collections::BTreeMap;
use std::time::Duration;

use stevedore_id::{ContainerHandle, TeamId};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{ContainerError, ContainerResult};
use crate::image::{ImageFetchRequest, ImageFetchingDelegate};
use crate::runtime::{BindMount, RuntimeContainer, RuntimeContainerSpec};
use crate::state::{container_creating_lock, ContainerRecord, ContainerState};
use crate::types::{ContainerIdentity, ContainerSpec, FetchedImage, ResourceTypeCatalog};
use crate::worker::Worker;

/// How long to wait before retrying a creating lock held by another caller.
const CREATING_LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Runtime property carrying the user processes run as.
pub const USER_PROPERTY: &str = "user";

/// A realized container: its `Created` record and the live runtime object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    record: ContainerRecord,
    runtime: RuntimeContainer,
}

impl Container {
    pub fn handle(&self) -> ContainerHandle {
        self.record.handle
    }

    pub fn record(&self) -> &ContainerRecord {
        &self.record
    }

    pub fn runtime(&self) -> &RuntimeContainer {
        &self.runtime
    }

    pub fn bind_mounts(&self) -> &[BindMount] {
        &self.runtime.spec.bind_mounts
    }
}

impl Worker {
    /// Find the container for `identity`, creating it if needed.
    ///
    /// `cancel` is only observed while the image is fetched.
    #[instrument(skip_all, fields(worker = %self.name(), team = %spec.team_id))]
    pub async fn find_or_create_container(
        &self,
        cancel: watch::Receiver<bool>,
        delegate: &dyn ImageFetchingDelegate,
        identity: &ContainerIdentity,
        spec: &ContainerSpec,
        resource_types: &ResourceTypeCatalog,
    ) -> ContainerResult<Container> {
        let services = self.services();

        let (record, existing, _lock) = loop {
            let record = services
                .containers
                .find_or_create_container(self.name(), identity)
                .await
                .map_err(|e| {
                    error!(error = %e, "Failed to find container in db");
                    ContainerError::Persistence(e)
                })?;

            if record.state == ContainerState::Created {
                let existing = self.lookup_runtime_container(&record.handle).await?;
                break (record, existing, None);
            }

            let lock_name = container_creating_lock(&record.handle);
            let Some(lock) = services
                .containers
                .try_acquire_lock(&lock_name)
                .await
                .map_err(ContainerError::Persistence)?
            else {
                debug!(container = %record.handle, "Container is being created elsewhere, waiting");
                tokio::time::sleep(CREATING_LOCK_RETRY_INTERVAL).await;
                continue;
            };

            // The lock holder we waited on may have finished or failed.
            let current = services
                .containers
                .find_or_create_container(self.name(), identity)
                .await
                .map_err(ContainerError::Persistence)?;
            if current.handle != record.handle {
                continue;
            }

            let existing = self.lookup_runtime_container(&current.handle).await?;
            break (current, existing, Some(lock));
        };

        let handle = record.handle;

        if record.state == ContainerState::Created {
            debug!(container = %handle, "Found created container in db");
            return match existing {
                Some(runtime) => Ok(Container { record, runtime }),
                None => {
                    error!(container = %handle, "Created container missing from runtime");
                    Err(ContainerError::ContainerNotFound(handle))
                }
            };
        }

        let runtime = match existing {
            Some(runtime) => {
                info!(container = %handle, "Runtime container already exists, finishing creation");
                runtime
            }
            None => match self
                .create_runtime_container(cancel, delegate, &record, spec, resource_types)
                .await
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!(container = %handle, error = %e, "Failed to create container");
                    if let Err(mark_err) = services.containers.mark_failed(&handle).await {
                        error!(
                            container = %handle,
                            error = %mark_err,
                            "Failed to mark container as failed"
                        );
                    }
                    return Err(e);
                }
            },
        };

        debug!(container = %handle, "Created container in runtime");
        services.observer.container_created();

        let record = match services.containers.mark_created(&handle).await {
            Ok(record) => record,
            Err(e) => {
                error!(container = %handle, error = %e, "Failed to mark container as created");
                if let Err(destroy_err) = services.runtime.destroy(&handle).await {
                    warn!(
                        container = %handle,
                        error = %destroy_err,
                        "Failed to destroy unrecorded runtime container"
                    );
                }
                return Err(ContainerError::PostCreatePersist(e));
            }
        };

        info!(container = %handle, "Created container");

        Ok(Container { record, runtime })
    }

    /// Find a created container of `team_id` by handle.
    ///
    /// `Ok(None)` if there is no such record or the runtime no longer has
    /// the container.
    #[instrument(skip_all, fields(worker = %self.name(), container = %handle))]
    pub async fn find_container_by_handle(
        &self,
        team_id: TeamId,
        handle: &ContainerHandle,
    ) -> ContainerResult<Option<Container>> {
        let Some(record) = self
            .services()
            .containers
            .find_created_container_by_handle(handle, team_id)
            .await
            .map_err(ContainerError::Persistence)?
        else {
            return Ok(None);
        };

        let Some(runtime) = self.lookup_runtime_container(handle).await? else {
            debug!("Created container missing from runtime");
            return Ok(None);
        };

        Ok(Some(Container { record, runtime }))
    }

    async fn lookup_runtime_container(
        &self,
        handle: &ContainerHandle,
    ) -> ContainerResult<Option<RuntimeContainer>> {
        self.services().runtime.lookup(handle).await.map_err(|e| {
            error!(container = %handle, error = %e, "Failed to look up container in runtime");
            ContainerError::RuntimeLookup(e)
        })
    }

    async fn create_runtime_container(
        &self,
        cancel: watch::Receiver<bool>,
        delegate: &dyn ImageFetchingDelegate,
        record: &ContainerRecord,
        spec: &ContainerSpec,
        resource_types: &ResourceTypeCatalog,
    ) -> ContainerResult<RuntimeContainer> {
        let services = self.services();

        let image = services
            .images
            .fetch_for_container(
                ImageFetchRequest {
                    worker_name: self.name(),
                    spec: &spec.image_spec,
                    team_id: spec.team_id,
                    delegate,
                    resource_types,
                    container: record,
                },
                cancel,
            )
            .await
            .map_err(ContainerError::ImageFetch)?;

        let volume_mounts = self
            .provision_volumes(image.privileged, record, spec)
            .await
            .map_err(ContainerError::VolumeProvision)?;

        let bind_mounts = self
            .resolve_bind_mounts(&volume_mounts, &spec.bind_mounts)
            .await
            .map_err(ContainerError::BindMount)?;

        debug!(container = %record.handle, mounts = bind_mounts.len(), "Creating runtime container");

        services
            .runtime
            .create(runtime_spec(record.handle, &image, spec, bind_mounts))
            .await
            .map_err(|e| {
                services.observer.container_failed();
                ContainerError::RuntimeCreate(e)
            })
    }
}

/// What the runtime is asked to create.
///
/// The image environment comes first so `spec.env` can override it.
fn runtime_spec(
    handle: ContainerHandle,
    image: &FetchedImage,
    spec: &ContainerSpec,
    bind_mounts: Vec<BindMount>,
) -> RuntimeContainerSpec {
    let env = image
        .metadata
        .env
        .iter()
        .chain(&spec.env)
        .cloned()
        .collect();

    let mut properties = BTreeMap::new();
    if let Some(user) = spec.user.as_ref().or(image.metadata.user.as_ref()) {
        properties.insert(USER_PROPERTY.to_string(), user.clone());
    }

    RuntimeContainerSpec {
        handle,
        image_url: image.url.clone(),
        privileged: image.privileged,
        bind_mounts,
        env,
        limits: spec.limits,
        properties,
    }
}
