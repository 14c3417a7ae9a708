//! Kas Treasury Core
//!
//! Shared-cash treasury for groups of equal members: proposals, majority
//! voting, gateway deposits, and a per-organization hash-chained ledger.
//!
//! # Architecture
//!
//! - **Hash Chain**: Every executed transaction is a block linked to its
//!   predecessor by SHA-256, so retroactive edits are detectable
//! - **Per-Org Serialization**: Ledger tail, member list and credits are
//!   written under an organization lock; votes under a proposal lock
//! - **Commutative Counters**: Balances and vote tallies are RocksDB merge
//!   operands, never read-modify-write
//! - **Exactly-Once Credits**: Gateway callbacks are keyed by order ID
//!
//! # Invariants
//!
//! - `block[i].previous_hash == block[i-1].current_hash`
//! - `votes_for + votes_against <= member_count`, one ballot per voter
//! - An order credits the balance at most once
//! - Balance and block of one approval commit together or not at all

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod balance;
pub mod config;
pub mod deletion;
pub mod error;
pub mod governance;
pub mod hasher;
pub mod ledger;
pub mod locks;
pub mod metrics;
pub mod organization;
pub mod payment;
pub mod payout;
pub mod scheduler;
pub mod storage;
pub mod treasury;
pub mod types;

// Re-exports
pub use config::Config;
pub use error::{Error, Result};
pub use governance::{majority, ProposalMachine};
pub use ledger::Ledger;
pub use storage::Storage;
pub use treasury::Treasury;
pub use types::{
    Block, BlockData, BlockKind, ChainVerification, NewProposal, Organization, PaymentOrder,
    Proposal, ProposalAction, ProposalStatus, VoteChoice,
};
