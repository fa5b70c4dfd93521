//! Named job locks.
//!
//! A job takes its lock for its whole duration; a second job with the same
//! name is refused instead of queued.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use crate::{HaError, HaResult};

pub const UPDATE: &str = "update";
pub const FAILOVER_UPGRADE: &str = "failover_upgrade";
pub const FAILOVER_UPGRADE_FINISH: &str = "failover_upgrade_finish";
pub const VRRP_EVENT: &str = "vrrp_event";
pub const DIRECTORY_JOIN_LEAVE: &str = "directoryservices_join_leave";

#[derive(Debug, Clone, Default)]
pub struct JobLocks {
    held: Arc<Mutex<BTreeSet<&'static str>>>,
}

impl JobLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes `name`, or fails with [`HaError::Busy`] if another job holds it.
    pub fn acquire(&self, name: &'static str) -> HaResult<JobGuard> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if !held.insert(name) {
            return Err(HaError::Busy(name));
        }
        Ok(JobGuard {
            locks: self.clone(),
            name,
        })
    }

    pub fn is_held(&self, name: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }
}

/// Releases the lock on drop.
#[derive(Debug)]
pub struct JobGuard {
    locks: JobLocks,
    name: &'static str,
}

impl JobGuard {
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.locks
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_is_busy_until_release() {
        let locks = JobLocks::new();
        let guard = locks.acquire(FAILOVER_UPGRADE).unwrap();
        assert!(matches!(locks.acquire(FAILOVER_UPGRADE), Err(HaError::Busy("failover_upgrade"))));
        assert!(locks.acquire(VRRP_EVENT).is_ok());
        drop(guard);
        assert!(!locks.is_held(FAILOVER_UPGRADE));
        assert!(locks.acquire(FAILOVER_UPGRADE).is_ok());
    }
}
