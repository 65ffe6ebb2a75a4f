//! The mount table of a new container.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, instrument};

use crate::runtime::{BindMount, BindMountMode};
use crate::volume::{BindMountSource, VolumeMount};
use crate::worker::Worker;

impl Worker {
    /// Build the container's mount table.
    ///
    /// Explicit sources come first so they take precedence; a source with
    /// nothing to mount on this worker is skipped. Every provisioned volume
    /// follows as a read-write mount, in provisioning order.
    #[instrument(skip_all, fields(worker = %self.name()))]
    pub async fn resolve_bind_mounts(
        &self,
        volume_mounts: &[VolumeMount],
        sources: &[Arc<dyn BindMountSource>],
    ) -> Result<Vec<BindMount>> {
        let mut bind_mounts = Vec::with_capacity(sources.len() + volume_mounts.len());

        for source in sources {
            match source.volume_on(self).await? {
                Some(mount) => bind_mounts.push(mount),
                None => debug!("Bind source has nothing to mount on this worker"),
            }
        }

        bind_mounts.extend(volume_mounts.iter().map(|mount| BindMount {
            src_path: mount.volume.path.clone(),
            dst_path: mount.mount_path.clone(),
            mode: BindMountMode::Rw,
        }));

        Ok(bind_mounts)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::volume::{MockVolumeService, VolumeStrategy};
    use crate::worker::tests::{test_info, test_worker};

    struct Fixed(Option<BindMount>);

    #[async_trait]
    impl BindMountSource for Fixed {
        async fn volume_on(&self, _worker: &Worker) -> Result<Option<BindMount>> {
            Ok(self.0.clone())
        }
    }

    struct Broken;

    #[async_trait]
    impl BindMountSource for Broken {
        async fn volume_on(&self, _worker: &Worker) -> Result<Option<BindMount>> {
            anyhow::bail!("certs volume unavailable")
        }
    }

    fn certs() -> BindMount {
        BindMount {
            src_path: "/volumes/live/certs".to_string(),
            dst_path: "/etc/ssl/certs".to_string(),
            mode: BindMountMode::Ro,
        }
    }

    async fn volume_mounts(paths: &[&str]) -> Vec<VolumeMount> {
        let service = MockVolumeService::new("w1");
        let mut mounts = Vec::new();
        for path in paths {
            mounts.push(VolumeMount {
                volume: service.add_volume(VolumeStrategy::Empty).await,
                mount_path: path.to_string(),
            });
        }
        mounts
    }

    #[tokio::test]
    async fn test_explicit_sources_first() {
        let worker = test_worker(test_info("w1"));
        let volumes = volume_mounts(&["/scratch", "/a", "/a/b"]).await;
        let sources: Vec<Arc<dyn BindMountSource>> =
            vec![Arc::new(Fixed(None)), Arc::new(Fixed(Some(certs())))];

        let mounts = worker.resolve_bind_mounts(&volumes, &sources).await.unwrap();

        let dsts: Vec<_> = mounts.iter().map(|m| m.dst_path.as_str()).collect();
        assert_eq!(dsts, vec!["/etc/ssl/certs", "/scratch", "/a", "/a/b"]);
        assert_eq!(mounts[0], certs());
        assert!(mounts[1..].iter().all(|m| m.mode == BindMountMode::Rw));
        assert_eq!(mounts[2].src_path, volumes[1].volume.path);
    }

    #[tokio::test]
    async fn test_no_sources() {
        let worker = test_worker(test_info("w1"));
        let volumes = volume_mounts(&["/scratch"]).await;

        let mounts = worker.resolve_bind_mounts(&volumes, &[]).await.unwrap();

        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].dst_path, "/scratch");
    }

    #[tokio::test]
    async fn test_source_error_propagates() {
        let worker = test_worker(test_info("w1"));
        let volumes = volume_mounts(&["/scratch"]).await;
        let sources: Vec<Arc<dyn BindMountSource>> = vec![Arc::new(Broken)];

        let result = worker.resolve_bind_mounts(&volumes, &sources).await;

        assert!(result.is_err());
    }
}
