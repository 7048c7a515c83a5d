//! Swappable policy snapshot.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use super::model::Policy;

/// The publish point for the active policy.
///
/// Readers take an `Arc` snapshot and keep it for the whole check; a reload
/// replaces the snapshot wholesale. The lock is held only long enough to
/// clone or swap the `Arc`.
#[derive(Debug)]
pub struct PolicyHandle {
    current: RwLock<Arc<Policy>>,
}

impl PolicyHandle {
    /// Create a handle publishing `policy`.
    pub fn new(policy: Policy) -> Self {
        Self {
            current: RwLock::new(Arc::new(policy)),
        }
    }

    /// Get the active policy snapshot.
    pub fn current(&self) -> Arc<Policy> {
        Arc::clone(&self.current.read())
    }

    /// Replace the active policy, returning the snapshot it replaced.
    pub fn publish(&self, policy: Policy) -> Arc<Policy> {
        let next = Arc::new(policy);
        let previous = std::mem::replace(&mut *self.current.write(), next);
        info!(version = previous.version, "Published new admission policy");
        previous
    }
}
