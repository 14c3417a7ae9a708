//! Error types for the treasury engine

use thiserror::Error;

/// Result type for treasury operations
pub type Result<T> = std::result::Result<T, Error>;

/// Treasury errors
///
/// Every variant is per-request and recoverable by retrying the originating
/// action. Ledger integrity faults are reported through
/// [`ChainVerification`](crate::types::ChainVerification), not as errors.
#[derive(Error, Debug)]
pub enum Error {
    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Rejected input (bad amount, malformed invite code, unknown bank, ...)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Deposit below the configured floor
    #[error("Amount {amount} is below the minimum of {minimum}")]
    AmountBelowMinimum {
        /// Requested amount
        amount: i64,
        /// Configured minimum
        minimum: i64,
    },

    /// Organization not found (or being deleted)
    #[error("Organization not found: {0}")]
    OrgNotFound(String),

    /// Proposal not found
    #[error("Proposal not found: {0}")]
    ProposalNotFound(String),

    /// Payment order not found
    #[error("Payment order not found: {0}")]
    PaymentNotFound(String),

    /// No organization uses this invite code
    #[error("Invite code not found: {0}")]
    InviteCodeNotFound(String),

    /// Caller is not a member of the organization
    #[error("User {user_id} is not a member of organization {org_id}")]
    NotMember {
        /// Organization
        org_id: String,
        /// Offending user
        user_id: String,
    },

    /// Caller is already a member of the organization
    #[error("User {user_id} is already a member of organization {org_id}")]
    AlreadyMember {
        /// Organization
        org_id: String,
        /// Offending user
        user_id: String,
    },

    /// Voter already cast a ballot on this proposal
    #[error("User {voter_id} has already voted on proposal {proposal_id}")]
    AlreadyVoted {
        /// Proposal
        proposal_id: String,
        /// Voter
        voter_id: String,
    },

    /// Proposal already decided
    #[error("Proposal {proposal_id} is no longer open for voting (status: {status})")]
    ProposalClosed {
        /// Proposal
        proposal_id: String,
        /// Current status
        status: String,
    },

    /// Deadline passed but the sweep has not resolved the proposal yet
    #[error("Voting window for proposal {0} has closed, awaiting resolution")]
    VotingWindowElapsed(String),

    /// Genesis block requested for a chain that already has one
    #[error("Chain already initialized for organization {0}")]
    ChainAlreadyInitialized(String),

    /// Gateway callback signature mismatch
    #[error("Invalid signature for order {0}")]
    InvalidSignature(String),

    /// Payment gateway or payout provider failure
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for errors caused by the caller's input or permissions
    /// (nothing was changed and retrying unchanged will fail again).
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::AmountBelowMinimum { .. }
                | Error::NotMember { .. }
                | Error::AlreadyMember { .. }
                | Error::AlreadyVoted { .. }
                | Error::ProposalClosed { .. }
                | Error::VotingWindowElapsed(_)
                | Error::InvalidSignature(_)
        )
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Gateway(err.to_string())
    }
}
