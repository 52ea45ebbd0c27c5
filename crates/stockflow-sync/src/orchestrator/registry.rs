//! Active-run registry
//!
//! One entry per integration with a run in flight. The entry lives exactly
//! as long as the [`RunGuard`] handed out for it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, Default)]
pub struct RunRegistry {
    active: Arc<Mutex<HashSet<Uuid>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `integration_id`, or fail with [`SyncError::AlreadySyncing`]
    pub fn try_acquire(&self, integration_id: Uuid) -> SyncResult<RunGuard> {
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        if !active.insert(integration_id) {
            return Err(SyncError::AlreadySyncing(integration_id));
        }
        Ok(RunGuard {
            active: self.active.clone(),
            integration_id,
        })
    }

    pub fn is_active(&self, integration_id: Uuid) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(&integration_id)
    }
}

/// Releases the integration when dropped
#[derive(Debug)]
pub struct RunGuard {
    active: Arc<Mutex<HashSet<Uuid>>>,
    integration_id: Uuid,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.integration_id);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_second_claim_is_rejected_until_release() {
        let registry = RunRegistry::new();
        let id = Uuid::new_v4();

        let guard = registry.try_acquire(id).unwrap();
        assert!(registry.is_active(id));
        assert!(matches!(registry.try_acquire(id), Err(SyncError::AlreadySyncing(x)) if x == id));

        // Other integrations are unaffected
        let other = registry.try_acquire(Uuid::new_v4()).unwrap();

        drop(guard);
        assert!(!registry.is_active(id));
        assert!(registry.try_acquire(id).is_ok());
        drop(other);
    }
}
