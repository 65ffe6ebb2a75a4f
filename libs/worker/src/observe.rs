//! Container lifecycle observation.
//!
//! The worker core reports lifecycle events instead of keeping counters;
//! whoever embeds it decides where they go.

use std::sync::atomic::{AtomicU64, Ordering};

/// Receives container lifecycle events.
pub trait ContainerObserver: Send + Sync {
    /// A runtime container was created.
    fn container_created(&self) {}

    /// Creating a runtime container failed.
    fn container_failed(&self) {}
}

/// Observer that drops all events.
pub struct NoopObserver;

impl ContainerObserver for NoopObserver {}

/// Observer that counts events.
#[derive(Debug, Default)]
pub struct CountingObserver {
    pub created: AtomicU64,
    pub failed: AtomicU64,
}

impl CountingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

impl ContainerObserver for CountingObserver {
    fn container_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    fn container_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }
}
