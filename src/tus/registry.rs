//! Per-upload exclusive locks

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// One lock plus the number of guards holding or awaiting it.
#[derive(Default)]
struct Slot {
    mutex: Arc<Mutex<()>>,
    users: usize,
}

/// Process-wide map from upload ID to its lock.
///
/// Entries are created on first use and removed when their last user is
/// gone, so the table only holds IDs that are locked or being waited on.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    locks: Arc<DashMap<String, Slot>>,
}

/// Exclusive access to one upload. Released on drop.
///
/// A guard is registered before the wait starts, so a caller dropped while
/// still waiting releases its entry too.
pub struct SessionGuard {
    id: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<String, Slot>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the lock of `id`. Different IDs never contend.
    pub async fn lock(&self, id: &str) -> SessionGuard {
        let mutex = {
            let mut slot = self.locks.entry(id.to_string()).or_insert_with(Slot::default);
            slot.users += 1;
            slot.mutex.clone()
        };
        let mut session = SessionGuard {
            id: id.to_string(),
            guard: None,
            locks: self.locks.clone(),
        };
        session.guard = Some(mutex.lock_owned().await);
        session
    }

    /// Number of IDs currently locked or awaited.
    pub fn active(&self) -> usize {
        self.locks.len()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        if let Entry::Occupied(mut slot) = self.locks.entry(self.id.clone()) {
            let users = &mut slot.get_mut().users;
            *users = users.saturating_sub(1);
            if *users == 0 {
                slot.remove();
                trace!("Released idle lock entry for {}", self.id);
            }
        }
    }
}
