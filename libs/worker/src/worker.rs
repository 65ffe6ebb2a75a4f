//! A worker bound to its collaborators.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use stevedore_id::{TeamId, VolumeHandle};

use crate::config::WorkerConfig;
use crate::image::ImageFetcher;
use crate::observe::ContainerObserver;
use crate::runtime::ContainerRuntime;
use crate::state::ContainerRepository;
use crate::types::{WorkerInfo, WorkerResourceType};
use crate::version::{self, Version};
use crate::volume::{Volume, VolumeService};

/// Collaborators serving one worker.
#[derive(Clone)]
pub struct WorkerServices {
    pub containers: Arc<dyn ContainerRepository>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub volumes: Arc<dyn VolumeService>,
    pub images: Arc<dyn ImageFetcher>,
    pub observer: Arc<dyn ContainerObserver>,
}

/// A registered worker and the services that act on it.
///
/// Matching (`satisfying`) only reads the registration snapshot; container
/// and volume operations go through the services.
pub struct Worker {
    info: WorkerInfo,
    services: WorkerServices,
    scratch_path: String,
}

impl Worker {
    pub fn new(info: WorkerInfo, services: WorkerServices, config: &WorkerConfig) -> Self {
        Self {
            info,
            services,
            scratch_path: config.scratch_path.clone(),
        }
    }

    pub fn info(&self) -> &WorkerInfo {
        &self.info
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn platform(&self) -> &str {
        &self.info.platform
    }

    pub fn resource_types(&self) -> &[WorkerResourceType] {
        &self.info.resource_types
    }

    pub fn tags(&self) -> &[String] {
        &self.info.tags
    }

    pub fn team_id(&self) -> TeamId {
        self.info.team_id
    }

    pub fn is_owned_by_team(&self) -> bool {
        !self.info.team_id.is_unowned()
    }

    pub fn ephemeral(&self) -> bool {
        self.info.ephemeral
    }

    /// Containers the worker reported when it registered.
    pub fn build_containers(&self) -> u32 {
        self.info.active_containers
    }

    /// Time since the worker started. Zero if its clock is ahead of ours.
    pub fn uptime(&self) -> Duration {
        let elapsed = chrono::Utc::now().timestamp() - self.info.start_time;
        Duration::from_secs(elapsed.max(0) as u64)
    }

    pub fn is_version_compatible(&self, required: &Version) -> bool {
        version::is_compatible(self.info.version.as_deref(), required)
    }

    /// The natively provided resource type whose image lives at `path`.
    pub fn find_resource_type_by_path(&self, path: &str) -> Option<&WorkerResourceType> {
        self.info.resource_types.iter().find(|rt| rt.image == path)
    }

    pub async fn find_volume_for_resource_cache(
        &self,
        resource_cache_id: i64,
    ) -> Result<Option<Volume>> {
        self.services
            .volumes
            .find_volume_for_resource_cache(resource_cache_id)
            .await
    }

    pub async fn find_volume_for_task_cache(
        &self,
        team_id: TeamId,
        job_id: i64,
        step_name: &str,
        path: &str,
    ) -> Result<Option<Volume>> {
        self.services
            .volumes
            .find_volume_for_task_cache(team_id, job_id, step_name, path)
            .await
    }

    /// The worker's shared certificates volume.
    pub async fn certs_volume(&self) -> Result<Option<Volume>> {
        self.services
            .volumes
            .find_or_create_volume_for_resource_certs()
            .await
    }

    pub async fn lookup_volume(&self, handle: &VolumeHandle) -> Result<Option<Volume>> {
        self.services.volumes.lookup_volume(handle).await
    }

    /// Write an artifact into one of this worker's volumes.
    pub async fn stream_in(&self, volume: &Volume, data: Bytes) -> Result<()> {
        self.services.volumes.stream_in(volume, data).await
    }

    pub(crate) fn services(&self) -> &WorkerServices {
        &self.services
    }

    pub(crate) fn scratch_path(&self) -> &str {
        &self.scratch_path
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("info", &self.info)
            .field("scratch_path", &self.scratch_path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::image::MockImageFetcher;
    use crate::observe::NoopObserver;
    use crate::runtime::MockRuntime;
    use crate::state::StateStore;
    use crate::volume::MockVolumeService;

    pub(crate) fn test_info(name: &str) -> WorkerInfo {
        WorkerInfo {
            name: name.to_string(),
            platform: "linux".to_string(),
            resource_types: vec![WorkerResourceType {
                resource_type: "git".to_string(),
                image: "/opt/resource-types/git".to_string(),
            }],
            tags: vec![],
            team_id: TeamId::UNOWNED,
            ephemeral: false,
            version: Some("2.3.1".to_string()),
            start_time: chrono::Utc::now().timestamp() - 60,
            active_containers: 4,
        }
    }

    pub(crate) fn test_worker(info: WorkerInfo) -> Worker {
        let services = WorkerServices {
            containers: Arc::new(StateStore::open_in_memory().unwrap()),
            runtime: Arc::new(MockRuntime::new()),
            volumes: Arc::new(MockVolumeService::new(info.name.clone())),
            images: Arc::new(MockImageFetcher::new()),
            observer: Arc::new(NoopObserver),
        };
        Worker::new(info, services, &WorkerConfig::default())
    }

    #[test]
    fn test_worker_accessors() {
        let worker = test_worker(test_info("w1"));

        assert_eq!(worker.name(), "w1");
        assert_eq!(worker.platform(), "linux");
        assert!(!worker.is_owned_by_team());
        assert!(!worker.ephemeral());
        assert_eq!(worker.build_containers(), 4);
        assert!(worker.uptime() >= Duration::from_secs(60));
    }

    #[test]
    fn test_worker_owned_by_team() {
        let mut info = test_info("w1");
        info.team_id = TeamId::new(5);
        assert!(test_worker(info).is_owned_by_team());
    }

    #[test]
    fn test_uptime_never_negative() {
        let mut info = test_info("w1");
        info.start_time = chrono::Utc::now().timestamp() + 3600;
        assert_eq!(test_worker(info).uptime(), Duration::ZERO);
    }

    #[test]
    fn test_find_resource_type_by_path() {
        let worker = test_worker(test_info("w1"));

        let found = worker.find_resource_type_by_path("/opt/resource-types/git");
        assert_eq!(found.unwrap().resource_type, "git");
        assert!(worker.find_resource_type_by_path("/opt/other").is_none());
    }

    #[test]
    fn test_is_version_compatible() {
        let worker = test_worker(test_info("w1"));
        assert!(worker.is_version_compatible(&"2.0".parse().unwrap()));
        assert!(!worker.is_version_compatible(&"3.0".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_certs_volume() {
        let worker = test_worker(test_info("w1"));
        let certs = worker.certs_volume().await.unwrap().unwrap();
        let found = worker.lookup_volume(&certs.handle).await.unwrap();
        assert_eq!(found, Some(certs));
    }
}
