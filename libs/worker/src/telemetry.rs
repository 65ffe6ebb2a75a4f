//! Tracing setup for processes embedding the worker core.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::WorkerConfig;

/// Install a JSON tracing subscriber.
///
/// `RUST_LOG` wins over the configured level. Returns false if a global
/// subscriber was already installed.
pub fn init_tracing(config: &WorkerConfig) -> bool {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_is_idempotent() {
        let config = WorkerConfig::default();
        init_tracing(&config);
        assert!(!init_tracing(&config));
    }
}
