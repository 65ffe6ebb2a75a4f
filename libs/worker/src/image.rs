//! Image fetching interface.
//!
//! Fetching an image may involve running other containers (to check and get
//! an image resource) and streaming volumes, all owned by the image-fetch
//! subsystem. The worker core only asks for the finished [`FetchedImage`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use stevedore_id::TeamId;
use tokio::sync::watch;
use tracing::debug;

use crate::state::ContainerRecord;
use crate::types::{FetchedImage, ImageMetadata, ImageSpec, ResourceTypeCatalog};

/// Receives progress of an image fetch, e.g. to show it in a build log.
pub trait ImageFetchingDelegate: Send + Sync {
    fn image_fetch_started(&self, _spec: &ImageSpec) {}

    fn image_version_determined(&self, _version: &str) {}
}

/// Delegate that ignores all progress.
pub struct NoopDelegate;

impl ImageFetchingDelegate for NoopDelegate {}

/// Parameters of one image fetch.
pub struct ImageFetchRequest<'a> {
    pub worker_name: &'a str,
    pub spec: &'a ImageSpec,
    pub team_id: TeamId,
    pub delegate: &'a dyn ImageFetchingDelegate,
    pub resource_types: &'a ResourceTypeCatalog,
    /// The container the image is fetched for.
    pub container: &'a ContainerRecord,
}

/// Image-fetch interface.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Fetch the image for a container. Must give up with an error once
    /// `cancel` turns true.
    async fn fetch_for_container(
        &self,
        request: ImageFetchRequest<'_>,
        cancel: watch::Receiver<bool>,
    ) -> Result<FetchedImage>;
}

/// Mock image fetcher for testing and development.
pub struct MockImageFetcher {
    image: FetchedImage,
    fail_fetches: bool,
    fetch_delay: Duration,
    fetches: AtomicUsize,
}

impl MockImageFetcher {
    /// Create a fetcher returning an unprivileged image.
    pub fn new() -> Self {
        Self::returning(FetchedImage {
            url: "raw:///images/busybox".to_string(),
            privileged: false,
            metadata: ImageMetadata::default(),
            version: None,
        })
    }

    /// Create a fetcher returning `image`.
    pub fn returning(image: FetchedImage) -> Self {
        Self {
            image,
            fail_fetches: false,
            fetch_delay: Duration::ZERO,
            fetches: AtomicUsize::new(0),
        }
    }

    /// Create a fetcher that fails all fetches.
    pub fn failing() -> Self {
        Self {
            fail_fetches: true,
            ..Self::new()
        }
    }

    /// Make every fetch take `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }

    /// Number of fetches started.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl Default for MockImageFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageFetcher for MockImageFetcher {
    async fn fetch_for_container(
        &self,
        request: ImageFetchRequest<'_>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<FetchedImage> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        request.delegate.image_fetch_started(request.spec);

        if self.fail_fetches {
            anyhow::bail!("Mock image fetcher configured to fail");
        }

        if *cancel.borrow() {
            anyhow::bail!("image fetch cancelled");
        }

        let cancelled = async {
            // A dropped sender can never cancel.
            if cancel.wait_for(|cancelled| *cancelled).await.is_err() {
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(self.fetch_delay) => {}
            _ = cancelled => {
                anyhow::bail!("image fetch cancelled");
            }
        }

        if let Some(version) = &self.image.version {
            request.delegate.image_version_determined(version);
        }

        debug!(
            container = %request.container.handle,
            worker = %request.worker_name,
            "[MOCK] Fetched image"
        );

        Ok(self.image.clone())
    }
}
