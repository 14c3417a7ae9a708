//! Per-organization and per-proposal serialization
//!
//! Lock order is always proposal, then organization. Guards are never held
//! across an `.await`.
//!
//! ```ignore
//! let org_lock = locks.org(&org_id);
//! let _org = org_lock.lock();
//! ```

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// Shared lock handle
pub type LockSlot = Arc<Mutex<()>>;

/// Registry of named mutexes
#[derive(Debug, Default)]
pub struct LockRegistry {
    orgs: DashMap<String, LockSlot>,
    proposals: DashMap<(String, String), LockSlot>,
    order_ids: Mutex<()>,
}

impl LockRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock serializing writers of one organization's shared state
    /// (ledger tail, member list, credits, deletion)
    pub fn org(&self, org_id: &str) -> LockSlot {
        self.orgs
            .entry(org_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Lock serializing vote casting and resolution of one proposal
    pub fn proposal(&self, org_id: &str, proposal_id: &str) -> LockSlot {
        self.proposals
            .entry((org_id.to_string(), proposal_id.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the slot of a resolved proposal once nobody holds or awaits it
    ///
    /// Call after releasing the guard. Returns whether the slot was removed.
    pub fn release_proposal(&self, org_id: &str, proposal_id: &str) -> bool {
        self.proposals
            .remove_if(&(org_id.to_string(), proposal_id.to_string()), |_, slot| {
                Arc::strong_count(slot) == 1
            })
            .is_some()
    }

    /// Guard for reserving payment order IDs across organizations
    pub fn order_ids(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.order_ids.lock()
    }

    #[cfg(test)]
    pub(crate) fn proposal_slots(&self) -> usize {
        self.proposals.len()
    }

    /// Drop the proposal slots of a deleted organization
    ///
    /// The org slot itself is kept: a caller may still be waiting on it.
    pub fn forget_proposals(&self, org_id: &str) {
        self.proposals.retain(|(org, _), _| org != org_id);
    }
}
