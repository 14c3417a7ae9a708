//! Organization deletion saga
//!
//! Each step commits atomically together with the updated
//! [`DeletionMarker`], so a crash leaves a marker naming the last finished
//! step and [`OrgDeletion::resume_pending_deletions`] picks up from there.
//! When a `delete_org` proposal triggers the deletion, the first step is
//! staged into the same write set as the proposal's approval.
//! The marker is kept after completion as a tombstone.

use crate::{
    locks::LockRegistry,
    storage::{Storage, WriteSet},
    types::{DeletionMarker, DeletionStage, OrgStatus},
    Error, Result,
};
use chrono::Utc;
use std::sync::Arc;

/// Drives cascading organization deletion
#[derive(Debug, Clone)]
pub struct OrgDeletion {
    storage: Arc<Storage>,
    locks: Arc<LockRegistry>,
}

impl OrgDeletion {
    /// Create the saga driver
    pub fn new(storage: Arc<Storage>, locks: Arc<LockRegistry>) -> Self {
        Self { storage, locks }
    }

    /// Delete an organization, or finish a deletion already under way
    pub fn run(&self, org_id: &str, proposal_id: Option<&str>) -> Result<DeletionMarker> {
        let org_lock = self.locks.org(org_id);
        let _org = org_lock.lock();

        let marker = match self.storage.deletion_marker(org_id)? {
            Some(marker) => marker,
            None => {
                let mut ws = self.storage.write_set();
                let marker = self.stage_start(&mut ws, org_id, proposal_id)?;
                ws.commit()?;
                marker
            }
        };
        self.finish(marker)
    }

    /// Re-drive every deletion that has not reached `Completed`
    pub fn resume_pending_deletions(&self) -> Result<usize> {
        let pending = self.storage.pending_deletions()?;
        let count = pending.len();
        for marker in pending {
            tracing::warn!(
                org_id = %marker.org_id,
                stage = ?marker.stage,
                "Resuming interrupted organization deletion"
            );
            self.run(&marker.org_id, None)?;
        }
        Ok(count)
    }

    /// Saga state for an organization
    pub fn marker(&self, org_id: &str) -> Result<Option<DeletionMarker>> {
        self.storage.deletion_marker(org_id)
    }

    /// Stage the `Started` step: org flagged `Deleting`, member snapshot taken
    ///
    /// The caller holds the organization lock until the write set is
    /// committed, then passes the marker to [`finish`](Self::finish).
    pub(crate) fn stage_start(
        &self,
        ws: &mut WriteSet<'_>,
        org_id: &str,
        proposal_id: Option<&str>,
    ) -> Result<DeletionMarker> {
        let mut org = self
            .storage
            .find_org(org_id)?
            .ok_or_else(|| Error::OrgNotFound(org_id.to_string()))?;
        org.status = OrgStatus::Deleting;

        let marker = DeletionMarker {
            org_id: org_id.to_string(),
            members: org.members.iter().cloned().collect(),
            invite_code: org.invite_code.clone(),
            stage: DeletionStage::Started,
            proposal_id: proposal_id.map(str::to_string),
            started_at: Utc::now(),
            completed_at: None,
        };

        ws.put_org(&org)?;
        ws.put_deletion(&marker)?;
        Ok(marker)
    }

    /// Run the remaining steps of a committed marker. Caller holds the
    /// organization lock.
    pub(crate) fn finish(&self, marker: DeletionMarker) -> Result<DeletionMarker> {
        if marker.stage == DeletionStage::Started {
            tracing::info!(
                org_id = %marker.org_id,
                members = marker.members.len(),
                proposal_id = ?marker.proposal_id,
                "Organization deletion started"
            );
        }
        let marker = self.drive(marker)?;
        self.locks.forget_proposals(&marker.org_id);
        Ok(marker)
    }

    fn drive(&self, mut marker: DeletionMarker) -> Result<DeletionMarker> {
        let org_id = marker.org_id.clone();

        if marker.stage < DeletionStage::MembershipsCleared {
            let mut ws = self.storage.write_set();
            for member in &marker.members {
                ws.remove_membership(member, &org_id)?;
            }
            marker.stage = DeletionStage::MembershipsCleared;
            ws.put_deletion(&marker)?;
            ws.commit()?;
            tracing::debug!(org_id = %org_id, "Memberships cleared");
        }

        if marker.stage < DeletionStage::RecordsPurged {
            let mut ws = self.storage.write_set();
            ws.purge_org_records(&org_id)?;
            // Another org may have drawn the same code since
            if self.storage.lookup_invite(&marker.invite_code)?.as_deref() == Some(org_id.as_str()) {
                ws.delete_invite(&marker.invite_code)?;
            }
            marker.stage = DeletionStage::RecordsPurged;
            ws.put_deletion(&marker)?;
            ws.commit()?;
            tracing::debug!(org_id = %org_id, "Organization records purged");
        }

        if marker.stage < DeletionStage::Completed {
            let mut ws = self.storage.write_set();
            ws.delete_org(&org_id)?;
            marker.stage = DeletionStage::Completed;
            marker.completed_at = Some(Utc::now());
            ws.put_deletion(&marker)?;
            ws.commit()?;
            tracing::info!(org_id = %org_id, "Organization deleted");
        }

        Ok(marker)
    }
}
