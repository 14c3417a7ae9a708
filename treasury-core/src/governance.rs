//! Proposal voting state machine
//!
//! ```text
//! voting ──┬─> approved ──> executed (advisory, after payout)
//!          ├─> rejected
//!          └─> expired
//! ```
//!
//! A vote resolves its proposal immediately once the outcome is fixed:
//! votes in favour reach the majority, or every member has voted. Anything
//! else waits for the deadline sweep. The majority is always computed from
//! the member count at resolution time.
//!
//! Vote casting and resolution of one proposal are serialized by its
//! proposal lock. Every write then takes the organization lock and
//! re-reads the organization, so nothing lands after a deletion starts.
//! Approval appends the block and moves the balance in the same write.

use crate::{
    balance::BalanceMutator,
    config::GovernanceConfig,
    deletion::OrgDeletion,
    ledger::Ledger,
    locks::LockRegistry,
    metrics::Metrics,
    storage::Storage,
    types::{
        format_rupiah, is_supported_bank, BlockData, BlockKind, NewProposal, Proposal,
        ProposalAction, ProposalStatus, SweepReport, Tally, VoteChoice, VoteReceipt,
    },
    Error, Result,
};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Votes in favour needed to approve: `floor(member_count / 2) + 1`
pub fn majority(member_count: u32) -> u64 {
    u64::from(member_count) / 2 + 1
}

/// Outcome once the outcome can no longer change, if ever
fn early_outcome(tally: &Tally, member_count: u32) -> Option<ProposalStatus> {
    if tally.votes_for >= majority(member_count) {
        Some(ProposalStatus::Approved)
    } else if tally.total() >= u64::from(member_count) {
        Some(ProposalStatus::Rejected)
    } else {
        None
    }
}

/// Outcome of a proposal whose deadline has passed
fn deadline_outcome(tally: &Tally, member_count: u32) -> ProposalStatus {
    if tally.total() == 0 {
        ProposalStatus::Expired
    } else if tally.votes_for >= majority(member_count) {
        ProposalStatus::Approved
    } else {
        ProposalStatus::Rejected
    }
}

/// Ledger payload written when a proposal is approved
fn approval_block(proposal: &Proposal, kind: BlockKind) -> BlockData {
    let description = if proposal.description.is_empty() {
        proposal.title.clone()
    } else {
        proposal.description.clone()
    };

    let mut data = BlockData::new(kind, description, proposal.action.amount());
    data.proposal_id = Some(proposal.id.clone());
    if let ProposalAction::Transfer { recipient, .. } = &proposal.action {
        data.recipient_name = Some(recipient.name.clone());
        data.recipient_bank = Some(recipient.bank.clone());
        data.recipient_account = Some(recipient.account.clone());
        data.payout_status = Some("pending".to_string());
    }
    data
}

/// Proposal lifecycle engine
#[derive(Debug, Clone)]
pub struct ProposalMachine {
    storage: Arc<Storage>,
    locks: Arc<LockRegistry>,
    ledger: Ledger,
    balances: BalanceMutator,
    deletion: OrgDeletion,
    metrics: Metrics,
    config: GovernanceConfig,
}

impl ProposalMachine {
    /// Create the state machine
    pub fn new(
        storage: Arc<Storage>,
        locks: Arc<LockRegistry>,
        ledger: Ledger,
        balances: BalanceMutator,
        deletion: OrgDeletion,
        metrics: Metrics,
        config: GovernanceConfig,
    ) -> Self {
        Self {
            storage,
            locks,
            ledger,
            balances,
            deletion,
            metrics,
            config,
        }
    }

    /// Open a proposal for voting
    pub fn create_proposal(&self, org_id: &str, input: NewProposal) -> Result<Proposal> {
        self.create_proposal_at(org_id, input, Utc::now())
    }

    /// [`create_proposal`](Self::create_proposal) with an explicit clock
    pub fn create_proposal_at(
        &self,
        org_id: &str,
        input: NewProposal,
        now: DateTime<Utc>,
    ) -> Result<Proposal> {
        let org_lock = self.locks.org(org_id);
        let _org = org_lock.lock();

        let org = self.storage.get_org(org_id)?;
        if !org.is_member(&input.proposer_id) {
            return Err(Error::NotMember {
                org_id: org_id.to_string(),
                user_id: input.proposer_id,
            });
        }

        let title = input.title.trim();
        if title.is_empty() {
            return Err(Error::Validation("Proposal title is required".to_string()));
        }

        let hours = input
            .voting_hours
            .unwrap_or(self.config.default_voting_hours);
        if !self.config.allowed_voting_hours.contains(&hours) {
            return Err(Error::Validation(format!(
                "Voting duration of {} hours is not allowed",
                hours
            )));
        }

        validate_action(&input.action)?;

        let amount_display = match input.action {
            ProposalAction::DeleteOrg => "-".to_string(),
            ref action => format_rupiah(action.amount()),
        };

        let proposal = Proposal {
            id: Uuid::now_v7().to_string(),
            org_id: org_id.to_string(),
            title: title.to_string(),
            description: input.description.trim().to_string(),
            action: input.action,
            amount_display,
            proposer_id: input.proposer_id,
            proposer_name: input.proposer_name,
            status: ProposalStatus::Voting,
            created_at: now,
            expires_at: now + Duration::hours(i64::from(hours)),
            executed_at: None,
            payout_ref: None,
        };

        let mut ws = self.storage.write_set();
        ws.put_proposal(&proposal)?;
        ws.commit()?;

        tracing::info!(
            org_id,
            proposal_id = %proposal.id,
            action = proposal.action.type_name(),
            amount = proposal.action.amount(),
            expires_at = %proposal.expires_at,
            "Proposal created"
        );
        Ok(proposal)
    }

    /// Record a ballot, resolving the proposal if the outcome is now fixed
    pub fn cast_vote(
        &self,
        org_id: &str,
        proposal_id: &str,
        voter_id: &str,
        choice: VoteChoice,
    ) -> Result<VoteReceipt> {
        self.cast_vote_at(org_id, proposal_id, voter_id, choice, Utc::now())
    }

    /// [`cast_vote`](Self::cast_vote) with an explicit clock
    pub fn cast_vote_at(
        &self,
        org_id: &str,
        proposal_id: &str,
        voter_id: &str,
        choice: VoteChoice,
        now: DateTime<Utc>,
    ) -> Result<VoteReceipt> {
        let proposal_lock = self.locks.proposal(org_id, proposal_id);
        let receipt = {
            let _proposal = proposal_lock.lock();
            self.record_ballot(org_id, proposal_id, voter_id, choice, now)
        };
        drop(proposal_lock);

        let closed = match &receipt {
            Ok(receipt) => receipt.resolution.is_some(),
            Err(e) => matches!(e, Error::ProposalClosed { .. }),
        };
        if closed {
            self.locks.release_proposal(org_id, proposal_id);
        }
        receipt
    }

    /// Body of [`cast_vote_at`](Self::cast_vote_at). Caller holds the proposal lock.
    fn record_ballot(
        &self,
        org_id: &str,
        proposal_id: &str,
        voter_id: &str,
        choice: VoteChoice,
        now: DateTime<Utc>,
    ) -> Result<VoteReceipt> {
        let proposal = self.storage.get_proposal(org_id, proposal_id)?;
        if proposal.status != ProposalStatus::Voting {
            return Err(Error::ProposalClosed {
                proposal_id: proposal_id.to_string(),
                status: proposal.status.to_string(),
            });
        }
        // Expiry belongs to the sweep
        if proposal.is_past_deadline(now) {
            return Err(Error::VotingWindowElapsed(proposal_id.to_string()));
        }
        if self.storage.get_vote(org_id, proposal_id, voter_id)?.is_some() {
            return Err(Error::AlreadyVoted {
                proposal_id: proposal_id.to_string(),
                voter_id: voter_id.to_string(),
            });
        }

        let org = {
            let org_lock = self.locks.org(org_id);
            let _org = org_lock.lock();

            let org = self.storage.get_org(org_id)?;
            if !org.is_member(voter_id) {
                return Err(Error::NotMember {
                    org_id: org_id.to_string(),
                    user_id: voter_id.to_string(),
                });
            }

            let mut ws = self.storage.write_set();
            ws.record_vote(org_id, proposal_id, voter_id, choice)?;
            ws.commit()?;
            org
        };
        self.metrics.record_vote();

        tracing::debug!(org_id, proposal_id, voter_id, choice = choice.as_str(), "Vote recorded");

        let tally = self.storage.get_tally(org_id, proposal_id)?;
        let member_count = org.member_count;
        let resolution = early_outcome(&tally, member_count);
        if let Some(outcome) = resolution {
            self.resolve(proposal, outcome, &tally, member_count, now)?;
        }

        let all_voted = tally.total() >= u64::from(member_count);
        let message = match (resolution, all_voted) {
            (Some(ProposalStatus::Approved), true) => {
                "All members have voted: proposal approved".to_string()
            }
            (Some(ProposalStatus::Approved), false) => {
                "Majority reached: proposal approved".to_string()
            }
            (Some(_), _) => "All members have voted: proposal rejected".to_string(),
            (None, _) => match choice {
                VoteChoice::For => "Vote in favour recorded".to_string(),
                VoteChoice::Against => "Vote against recorded".to_string(),
            },
        };

        Ok(VoteReceipt {
            message,
            votes_for: tally.votes_for,
            votes_against: tally.votes_against,
            member_count,
            majority: majority(member_count),
            resolution,
        })
    }

    /// Resolve every voting proposal past its deadline
    pub fn resolve_expired(&self, org_id: &str) -> Result<SweepReport> {
        self.resolve_expired_at(org_id, Utc::now())
    }

    /// [`resolve_expired`](Self::resolve_expired) with an explicit clock
    pub fn resolve_expired_at(&self, org_id: &str, now: DateTime<Utc>) -> Result<SweepReport> {
        self.storage.get_org(org_id)?;

        let mut due: Vec<Proposal> = self
            .storage
            .list_proposals(org_id)?
            .into_iter()
            .filter(|p| p.status == ProposalStatus::Voting && p.is_past_deadline(now))
            .collect();
        due.sort_by_key(|p| p.created_at);

        let mut report = SweepReport::default();
        for candidate in due {
            let proposal_lock = self.locks.proposal(org_id, &candidate.id);
            let step = {
                let _proposal = proposal_lock.lock();
                self.resolve_at_deadline(org_id, &candidate.id, now)
            };
            drop(proposal_lock);

            let resolved = match step {
                Ok(resolved) => resolved,
                Err(Error::OrgNotFound(_)) => break,
                Err(e) => return Err(e),
            };
            self.locks.release_proposal(org_id, &candidate.id);

            // A vote may have resolved it since the listing
            let (outcome, org_deleted) = match resolved {
                Some(resolved) => resolved,
                None => continue,
            };
            match outcome {
                ProposalStatus::Expired => report.expired += 1,
                ProposalStatus::Approved => report.approved += 1,
                _ => report.rejected += 1,
            }
            if org_deleted {
                report.org_deleted = true;
                break;
            }
        }

        if report.resolved() > 0 {
            tracing::info!(
                org_id,
                expired = report.expired,
                approved = report.approved,
                rejected = report.rejected,
                org_deleted = report.org_deleted,
                "Expired proposals resolved"
            );
        }
        Ok(report)
    }

    /// Resolve one due proposal. Caller holds the proposal lock.
    ///
    /// `None` when it is no longer voting.
    fn resolve_at_deadline(
        &self,
        org_id: &str,
        proposal_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<(ProposalStatus, bool)>> {
        let proposal = self.storage.get_proposal(org_id, proposal_id)?;
        if proposal.status != ProposalStatus::Voting {
            return Ok(None);
        }

        let org = self.storage.get_org(org_id)?;
        let tally = self.storage.get_tally(org_id, proposal_id)?;
        let outcome = deadline_outcome(&tally, org.member_count);
        let org_deleted = self.resolve(proposal, outcome, &tally, org.member_count, now)?;
        Ok(Some((outcome, org_deleted)))
    }

    /// Mark an approved transfer as paid out
    pub fn mark_executed(
        &self,
        org_id: &str,
        proposal_id: &str,
        payout_ref: &str,
    ) -> Result<Proposal> {
        let proposal_lock = self.locks.proposal(org_id, proposal_id);
        let executed = {
            let _proposal = proposal_lock.lock();
            self.execute(org_id, proposal_id, payout_ref)
        };
        drop(proposal_lock);

        if executed.is_ok() {
            self.locks.release_proposal(org_id, proposal_id);
        }
        executed
    }

    fn execute(&self, org_id: &str, proposal_id: &str, payout_ref: &str) -> Result<Proposal> {
        let mut proposal = self.storage.get_proposal(org_id, proposal_id)?;
        if proposal.status != ProposalStatus::Approved {
            return Err(Error::Validation(format!(
                "Proposal {} is {}, only approved proposals can be executed",
                proposal_id, proposal.status
            )));
        }

        proposal.status = ProposalStatus::Executed;
        proposal.payout_ref = Some(payout_ref.to_string());

        let org_lock = self.locks.org(org_id);
        let _org = org_lock.lock();
        self.storage.get_org(org_id)?;

        let mut ws = self.storage.write_set();
        ws.put_proposal(&proposal)?;
        ws.commit()?;

        tracing::info!(org_id, proposal_id, payout_ref, "Proposal executed");
        Ok(proposal)
    }

    /// Proposal by ID
    pub fn get_proposal(&self, org_id: &str, proposal_id: &str) -> Result<Proposal> {
        self.storage.get_proposal(org_id, proposal_id)
    }

    /// Every proposal of an organization, oldest first
    pub fn list_proposals(&self, org_id: &str) -> Result<Vec<Proposal>> {
        let mut proposals = self.storage.list_proposals(org_id)?;
        proposals.sort_by_key(|p| p.created_at);
        Ok(proposals)
    }

    /// Current counts and ballots
    pub fn tally(&self, org_id: &str, proposal_id: &str) -> Result<Tally> {
        self.storage.get_proposal(org_id, proposal_id)?;
        self.storage.get_tally(org_id, proposal_id)
    }

    /// Move a voting proposal to `outcome`. Caller holds the proposal lock.
    ///
    /// The status change and its effects (approval block and balance delta,
    /// or the start of a deletion) commit in one write set under the
    /// organization lock. Returns true when an approved `delete_org` removed
    /// the organization.
    fn resolve(
        &self,
        mut proposal: Proposal,
        outcome: ProposalStatus,
        tally: &Tally,
        member_count: u32,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        proposal.status = outcome;
        if outcome == ProposalStatus::Approved {
            proposal.executed_at = Some(now);
        }

        let org_lock = self.locks.org(&proposal.org_id);
        let _org = org_lock.lock();
        self.storage.get_org(&proposal.org_id)?;

        let mut ws = self.storage.write_set();
        ws.put_proposal(&proposal)?;
        let mut block = None;
        let mut deletion = None;
        match (outcome, proposal.action.block_kind()) {
            (ProposalStatus::Approved, Some(kind)) => {
                block = Some(self.ledger.stage_block(
                    &mut ws,
                    &proposal.org_id,
                    approval_block(&proposal, kind),
                )?);
                self.balances.stage_delta(
                    &mut ws,
                    &proposal.org_id,
                    proposal.action.balance_delta(),
                )?;
            }
            (ProposalStatus::Approved, None) => {
                deletion = Some(self.deletion.stage_start(
                    &mut ws,
                    &proposal.org_id,
                    Some(&proposal.id),
                )?);
            }
            _ => {}
        }
        ws.commit()?;

        if let Some(block) = block {
            self.ledger.record_committed();
            tracing::debug!(
                org_id = %proposal.org_id,
                proposal_id = %proposal.id,
                hash = %block.current_hash,
                "Approval block appended"
            );
        }

        self.metrics.record_resolution(outcome);
        tracing::info!(
            org_id = %proposal.org_id,
            proposal_id = %proposal.id,
            outcome = outcome.as_str(),
            votes_for = tally.votes_for,
            votes_against = tally.votes_against,
            majority = majority(member_count),
            "Proposal resolved"
        );

        match deletion {
            Some(marker) => {
                self.deletion.finish(marker)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

fn validate_action(action: &ProposalAction) -> Result<()> {
    if let ProposalAction::DeleteOrg = action {
        return Ok(());
    }
    if action.amount() <= 0 {
        return Err(Error::Validation("Amount must be positive".to_string()));
    }
    if let ProposalAction::Transfer { recipient, .. } = action {
        if recipient.name.trim().is_empty() {
            return Err(Error::Validation("Recipient name is required".to_string()));
        }
        if recipient.account.is_empty() || !recipient.account.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::Validation(
                "Recipient account number must be digits".to_string(),
            ));
        }
        if !is_supported_bank(&recipient.bank) {
            return Err(Error::Validation(format!(
                "Unsupported recipient bank: {}",
                recipient.bank
            )));
        }
    }
    Ok(())
}
