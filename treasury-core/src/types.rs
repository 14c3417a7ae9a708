//! Core types for the treasury
//!
//! Amounts are signed integers in the smallest currency unit. Persisted
//! records are bincode-encoded, so enums use serde's default (external)
//! tagging and no field is conditionally skipped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Previous-hash sentinel carried by every genesis block
pub const GENESIS_PREVIOUS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Bank and e-wallet codes accepted as transfer recipients
pub const SUPPORTED_BANKS: &[(&str, &str)] = &[
    ("bca", "Bank BCA"),
    ("bni", "Bank BNI"),
    ("bri", "Bank BRI"),
    ("mandiri", "Bank Mandiri"),
    ("cimb", "Bank CIMB Niaga"),
    ("danamon", "Bank Danamon"),
    ("permata", "Bank Permata"),
    ("bsi", "Bank Syariah Indonesia"),
    ("gopay", "GoPay"),
    ("ovo", "OVO"),
    ("dana", "DANA"),
    ("shopeepay", "ShopeePay"),
    ("linkaja", "LinkAja"),
];

/// Whether `code` names a supported recipient bank
pub fn is_supported_bank(code: &str) -> bool {
    SUPPORTED_BANKS.iter().any(|(c, _)| *c == code)
}

/// Format minor units the way members read them, e.g. `Rp 50.000`
pub fn format_rupiah(amount: i64) -> String {
    let digits = amount.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(ch);
    }
    if amount < 0 {
        format!("-Rp {}", grouped)
    } else {
        format!("Rp {}", grouped)
    }
}

// =========================================================================
// ORGANIZATION
// =========================================================================

/// Organization lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrgStatus {
    /// Normal operation
    Active,
    /// Cascade deletion in progress; treated as not found
    Deleting,
}

/// A group sharing one cash balance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    /// Organization ID
    pub id: String,
    /// Display name
    pub name: String,
    /// Free-form description
    pub description: String,
    /// 6-character join code
    pub invite_code: String,
    /// Member user IDs
    pub members: BTreeSet<String>,
    /// Always equals `members.len()`
    pub member_count: u32,
    /// Creator user ID
    pub created_by: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Lifecycle status
    pub status: OrgStatus,
    /// Current balance. Stored in its own merge-operated column, filled
    /// in on read.
    #[serde(skip)]
    pub balance: i64,
}

impl Organization {
    /// Whether `user_id` is a current member
    pub fn is_member(&self, user_id: &str) -> bool {
        self.members.contains(user_id)
    }
}

// =========================================================================
// LEDGER
// =========================================================================

/// Block type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockKind {
    /// Chain anchor
    Genesis,
    /// Approved income proposal
    Income,
    /// Approved expense proposal
    Expense,
    /// Approved bank/e-wallet transfer proposal
    Transfer,
    /// Settled gateway deposit
    Payment,
}

impl BlockKind {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::Genesis => "genesis",
            BlockKind::Income => "income",
            BlockKind::Expense => "expense",
            BlockKind::Transfer => "transfer",
            BlockKind::Payment => "payment",
        }
    }
}

/// Business payload of a block; everything the hash covers besides linkage
///
/// Field order is part of the hash contract and must not change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockData {
    /// Block type
    #[serde(rename = "type")]
    pub kind: BlockKind,
    /// Description
    pub description: String,
    /// Amount (minor units, unsigned direction given by `kind`)
    pub amount: i64,
    /// Proposal that produced this block
    pub proposal_id: Option<String>,
    /// Transfer recipient name
    pub recipient_name: Option<String>,
    /// Transfer recipient bank code
    pub recipient_bank: Option<String>,
    /// Transfer recipient account number
    pub recipient_account: Option<String>,
    /// `pending` for transfers at approval time
    pub payout_status: Option<String>,
    /// Gateway order that produced this block
    pub payment_order_id: Option<String>,
    /// Payer display name
    pub paid_by: Option<String>,
    /// Payer user ID
    pub paid_by_uid: Option<String>,
}

impl BlockData {
    /// Payload with only the required fields set
    pub fn new(kind: BlockKind, description: impl Into<String>, amount: i64) -> Self {
        Self {
            kind,
            description: description.into(),
            amount,
            proposal_id: None,
            recipient_name: None,
            recipient_bank: None,
            recipient_account: None,
            payout_status: None,
            payment_order_id: None,
            paid_by: None,
            paid_by_uid: None,
        }
    }

    /// Genesis payload
    pub fn genesis() -> Self {
        Self::new(BlockKind::Genesis, "Genesis block - organization created", 0)
    }
}

/// One immutable ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Record ID (not hashed)
    pub id: Uuid,
    /// Business payload
    pub data: BlockData,
    /// `current_hash` of the predecessor, or the genesis sentinel
    pub previous_hash: String,
    /// SHA-256 over payload, previous hash, timestamp and nonce
    pub current_hash: String,
    /// Hash salt (0 for genesis)
    pub nonce: u64,
    /// Creation time, milliseconds since the Unix epoch
    pub timestamp: i64,
}

/// Last block of a chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTip {
    /// Height of the tail block (genesis = 0)
    pub height: u64,
    /// Tail `current_hash`
    pub hash: String,
}

/// Result of a ledger verification query
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainVerification {
    /// Whole chain verified
    pub valid: bool,
    /// Position of the first faulty block
    pub first_invalid_index: Option<usize>,
    /// Human-readable outcome
    pub detail: String,
    /// The chain as loaded
    pub chain: Vec<Block>,
}

// =========================================================================
// PROPOSALS
// =========================================================================

/// Transfer beneficiary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    /// Beneficiary name
    pub name: String,
    /// Bank or e-wallet code (see [`SUPPORTED_BANKS`])
    pub bank: String,
    /// Account number
    pub account: String,
}

/// What a proposal does when approved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalAction {
    /// Credit the balance
    Income {
        /// Amount (minor units)
        amount: i64,
    },
    /// Debit the balance
    Expense {
        /// Amount (minor units)
        amount: i64,
    },
    /// Debit the balance and pay out to a bank/e-wallet
    Transfer {
        /// Amount (minor units)
        amount: i64,
        /// Beneficiary
        recipient: Recipient,
    },
    /// Delete the organization and everything under it
    DeleteOrg,
}

impl ProposalAction {
    /// Requested amount (0 for `DeleteOrg`)
    pub fn amount(&self) -> i64 {
        match self {
            ProposalAction::Income { amount }
            | ProposalAction::Expense { amount }
            | ProposalAction::Transfer { amount, .. } => *amount,
            ProposalAction::DeleteOrg => 0,
        }
    }

    /// Signed balance change on approval
    pub fn balance_delta(&self) -> i64 {
        match self {
            ProposalAction::Income { amount } => *amount,
            ProposalAction::Expense { amount } | ProposalAction::Transfer { amount, .. } => {
                -*amount
            }
            ProposalAction::DeleteOrg => 0,
        }
    }

    /// Ledger block type written on approval, if any
    pub fn block_kind(&self) -> Option<BlockKind> {
        match self {
            ProposalAction::Income { .. } => Some(BlockKind::Income),
            ProposalAction::Expense { .. } => Some(BlockKind::Expense),
            ProposalAction::Transfer { .. } => Some(BlockKind::Transfer),
            ProposalAction::DeleteOrg => None,
        }
    }

    /// Wire name
    pub fn type_name(&self) -> &'static str {
        match self {
            ProposalAction::Income { .. } => "income",
            ProposalAction::Expense { .. } => "expense",
            ProposalAction::Transfer { .. } => "transfer",
            ProposalAction::DeleteOrg => "delete_org",
        }
    }
}

/// Proposal lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    /// Open for votes
    Voting,
    /// Majority in favour
    Approved,
    /// Majority not reached
    Rejected,
    /// Deadline passed without a single vote
    Expired,
    /// Approved transfer paid out
    Executed,
}

impl ProposalStatus {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Voting => "voting",
            ProposalStatus::Approved => "approved",
            ProposalStatus::Rejected => "rejected",
            ProposalStatus::Expired => "expired",
            ProposalStatus::Executed => "executed",
        }
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ballot choice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteChoice {
    /// In favour
    For,
    /// Against
    Against,
}

impl VoteChoice {
    /// Tally column suffix
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteChoice::For => "for",
            VoteChoice::Against => "against",
        }
    }
}

/// A pending request for a treasury action
///
/// Vote counts live in their own records; see [`Tally`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    /// Proposal ID
    pub id: String,
    /// Owning organization
    pub org_id: String,
    /// Title
    pub title: String,
    /// Description
    pub description: String,
    /// Action executed on approval
    pub action: ProposalAction,
    /// Amount as shown to members
    pub amount_display: String,
    /// Proposer user ID
    pub proposer_id: String,
    /// Proposer display name
    pub proposer_name: String,
    /// Lifecycle status
    pub status: ProposalStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Voting deadline
    pub expires_at: DateTime<Utc>,
    /// Set on approval
    pub executed_at: Option<DateTime<Utc>>,
    /// Payout provider reference once executed
    pub payout_ref: Option<String>,
}

impl Proposal {
    /// Deadline has passed at `now`
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Input for creating a proposal
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProposal {
    /// Title
    pub title: String,
    /// Description
    pub description: String,
    /// Action executed on approval
    pub action: ProposalAction,
    /// Proposer user ID
    pub proposer_id: String,
    /// Proposer display name
    pub proposer_name: String,
    /// Voting window in hours (configured default when `None`)
    pub voting_hours: Option<u32>,
}

/// Vote counts and ballots for one proposal
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tally {
    /// Ballots in favour
    pub votes_for: u64,
    /// Ballots against
    pub votes_against: u64,
    /// One entry per voter
    pub voters: BTreeMap<String, VoteChoice>,
}

impl Tally {
    /// Ballots cast
    pub fn total(&self) -> u64 {
        self.votes_for + self.votes_against
    }
}

/// Outcome of a vote
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteReceipt {
    /// Human-readable outcome
    pub message: String,
    /// Ballots in favour after this vote
    pub votes_for: u64,
    /// Ballots against after this vote
    pub votes_against: u64,
    /// Current member count
    pub member_count: u32,
    /// Votes in favour needed to approve
    pub majority: u64,
    /// Set when this vote resolved the proposal
    pub resolution: Option<ProposalStatus>,
}

/// Outcome of one deadline sweep over an organization
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// Proposals closed with no votes
    pub expired: usize,
    /// Proposals approved
    pub approved: usize,
    /// Proposals rejected
    pub rejected: usize,
    /// An approved `delete_org` removed the organization
    pub org_deleted: bool,
}

impl SweepReport {
    /// Proposals resolved in this sweep
    pub fn resolved(&self) -> usize {
        self.expired + self.approved + self.rejected
    }
}

// =========================================================================
// PAYMENTS
// =========================================================================

/// Gateway mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMode {
    /// No gateway; orders settle immediately
    Mock,
    /// Gateway sandbox
    Sandbox,
    /// Live gateway
    Production,
}

impl PaymentMode {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMode::Mock => "mock",
            PaymentMode::Sandbox => "sandbox",
            PaymentMode::Production => "production",
        }
    }
}

/// Well-known payment order statuses. Gateways may report others, which are
/// stored verbatim.
pub mod payment_status {
    /// Awaiting the payer
    pub const PENDING: &str = "pending";
    /// Funds settled
    pub const SETTLEMENT: &str = "settlement";
    /// Card capture accepted
    pub const CAPTURE: &str = "capture";
    /// Capture flagged by fraud screening
    pub const FRAUD: &str = "fraud";
    /// Checkout could not be opened at the gateway
    pub const FAILURE: &str = "failure";
}

/// A member-initiated deposit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentOrder {
    /// Order ID
    pub order_id: String,
    /// Receiving organization
    pub org_id: String,
    /// Payer user ID
    pub payer_id: String,
    /// Payer display name
    pub payer_name: String,
    /// Amount (minor units)
    pub amount: i64,
    /// Description
    pub description: String,
    /// Gateway status
    pub status: String,
    /// Gateway mode the order was created in
    pub mode: PaymentMode,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last status change
    pub updated_at: DateTime<Utc>,
    /// Raw body of the last gateway notification
    pub last_notification: Option<String>,
}

/// Records that an order's money has been moved
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditMarker {
    /// Credited order
    pub order_id: String,
    /// Credited organization
    pub org_id: String,
    /// Amount credited
    pub amount: i64,
    /// Ledger block written for the credit
    pub block_id: Uuid,
    /// Crediting time
    pub credited_at: DateTime<Utc>,
}

// =========================================================================
// DELETION SAGA
// =========================================================================

/// Progress of an organization deletion
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionStage {
    /// Org flagged, member snapshot taken
    Started,
    /// Org ID removed from every member's membership list
    MembershipsCleared,
    /// Proposals, votes, blocks, balance and payments removed
    RecordsPurged,
    /// Org record removed
    Completed,
}

/// Saga state for one organization deletion
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionMarker {
    /// Organization being deleted
    pub org_id: String,
    /// Members at the time deletion started
    pub members: Vec<String>,
    /// Invite code to release
    pub invite_code: String,
    /// Last completed step
    pub stage: DeletionStage,
    /// Approved proposal that triggered the deletion
    pub proposal_id: Option<String>,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// Completion time
    pub completed_at: Option<DateTime<Utc>>,
}
