//! Named, non-blocking, in-process locks.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use stevedore_id::ContainerHandle;
use tracing::warn;

/// Name of the lock held while a container's runtime object is created.
pub fn container_creating_lock(handle: &ContainerHandle) -> String {
    format!("container-creating:{handle}")
}

/// A set of named locks.
#[derive(Debug, Clone, Default)]
pub struct LockSet {
    held: Arc<Mutex<HashSet<String>>>,
}

impl LockSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock `name`, or `None` if someone else holds it.
    pub fn try_acquire(&self, name: &str) -> Option<Lock> {
        let mut held = self.held.lock().ok()?;
        if !held.insert(name.to_string()) {
            return None;
        }
        Some(Lock {
            name: name.to_string(),
            held: self.held.clone(),
        })
    }

    pub fn is_held(&self, name: &str) -> bool {
        self.held
            .lock()
            .map(|held| held.contains(name))
            .unwrap_or(false)
    }
}

/// A held lock. Released on drop.
#[derive(Debug)]
pub struct Lock {
    name: String,
    held: Arc<Mutex<HashSet<String>>>,
}

impl Lock {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        match self.held.lock() {
            Ok(mut held) => {
                held.remove(&self.name);
            }
            Err(_) => warn!(lock = %self.name, "Lock set poisoned; lock not released"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_is_exclusive_until_dropped() {
        let locks = LockSet::new();

        let lock = locks.try_acquire("a").unwrap();
        assert_eq!(lock.name(), "a");
        assert!(locks.try_acquire("a").is_none());
        assert!(locks.try_acquire("b").is_some());

        drop(lock);
        assert!(!locks.is_held("a"));
        assert!(locks.try_acquire("a").is_some());
    }

    #[test]
    fn test_creating_lock_name() {
        let handle = ContainerHandle::new();
        assert_eq!(
            container_creating_lock(&handle),
            format!("container-creating:{handle}")
        );
    }
}
