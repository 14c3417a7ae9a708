//! Deadline sweep scheduler
//!
//! Resolution is idempotent, so the sweep may run at any frequency and
//! alongside live voting.

use crate::{
    deletion::OrgDeletion, governance::ProposalMachine, metrics::Metrics, storage::Storage, Result,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Totals for one pass over every organization
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepSummary {
    /// Interrupted deletions finished
    pub deletions_resumed: usize,
    /// Organizations swept
    pub orgs_swept: usize,
    /// Proposals resolved
    pub proposals_resolved: usize,
    /// Organizations removed by an approved `delete_org`
    pub orgs_deleted: usize,
    /// Organizations whose sweep failed
    pub failures: usize,
}

/// Periodic driver for [`ProposalMachine::resolve_expired`]
#[derive(Debug, Clone)]
pub struct SweepScheduler {
    storage: Arc<Storage>,
    proposals: ProposalMachine,
    deletion: OrgDeletion,
    metrics: Metrics,
    interval: Duration,
}

impl SweepScheduler {
    /// Create a scheduler
    pub fn new(
        storage: Arc<Storage>,
        proposals: ProposalMachine,
        deletion: OrgDeletion,
        metrics: Metrics,
        interval: Duration,
    ) -> Self {
        Self {
            storage,
            proposals,
            deletion,
            metrics,
            interval,
        }
    }

    /// Sweep every active organization once
    ///
    /// A failing organization is logged and skipped.
    pub fn run_once(&self) -> Result<SweepSummary> {
        let started = Instant::now();
        let mut summary = SweepSummary {
            deletions_resumed: self.deletion.resume_pending_deletions()?,
            ..SweepSummary::default()
        };

        for org_id in self.storage.list_active_org_ids()? {
            match self.proposals.resolve_expired(&org_id) {
                Ok(report) => {
                    summary.orgs_swept += 1;
                    summary.proposals_resolved += report.resolved();
                    if report.org_deleted {
                        summary.orgs_deleted += 1;
                    }
                }
                Err(e) => {
                    summary.failures += 1;
                    warn!(org_id = %org_id, error = %e, "Sweep failed for organization");
                }
            }
        }

        self.metrics
            .record_sweep_duration(started.elapsed().as_secs_f64());
        debug!(
            orgs = summary.orgs_swept,
            resolved = summary.proposals_resolved,
            failures = summary.failures,
            "Sweep finished"
        );
        Ok(summary)
    }

    /// Run the sweep every interval until `shutdown` turns true or its
    /// sender is dropped
    pub async fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Starting deadline sweep scheduler");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    // RocksDB calls block; keep them off the async workers
                    let scheduler = self.clone();
                    match tokio::task::spawn_blocking(move || scheduler.run_once()).await {
                        Ok(Ok(summary)) if summary.proposals_resolved > 0 => info!(
                            resolved = summary.proposals_resolved,
                            orgs_deleted = summary.orgs_deleted,
                            "Sweep resolved proposals"
                        ),
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => warn!("Sweep failed: {}", e),
                        Err(e) => warn!("Sweep task aborted: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Deadline sweep scheduler stopped");
    }
}
