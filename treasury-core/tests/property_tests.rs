//! Property-based tests for ledger and voting invariants
//!
//! - Every chain built by genesis + appends verifies
//! - Tampering with any hashed field of any block is reported at that block
//! - Vote totals never exceed the member count, one ballot per voter

use proptest::prelude::*;
use tempfile::TempDir;
use treasury_core::{
    hasher,
    ledger::verify_blocks,
    types::{Block, BlockData, BlockKind, NewProposal, ProposalAction, GENESIS_PREVIOUS_HASH},
    Config, Treasury, VoteChoice,
};
use uuid::Uuid;

/// Strategy for non-genesis block types
fn kind_strategy() -> impl Strategy<Value = BlockKind> {
    prop_oneof![
        Just(BlockKind::Income),
        Just(BlockKind::Expense),
        Just(BlockKind::Transfer),
        Just(BlockKind::Payment),
    ]
}

/// Strategy for block payloads
fn payload_strategy() -> impl Strategy<Value = BlockData> {
    (kind_strategy(), "[a-zA-Z ]{0,24}", 1i64..100_000_000).prop_map(
        |(kind, description, amount)| BlockData::new(kind, description, amount),
    )
}

/// Which hashed field to corrupt
#[derive(Debug, Clone, Copy)]
enum Tamper {
    Amount,
    Description,
    Nonce,
    Timestamp,
    PreviousHash,
}

fn tamper_strategy() -> impl Strategy<Value = Tamper> {
    prop_oneof![
        Just(Tamper::Amount),
        Just(Tamper::Description),
        Just(Tamper::Nonce),
        Just(Tamper::Timestamp),
        Just(Tamper::PreviousHash),
    ]
}

/// Build a linked chain in memory the way the ledger does
fn build_chain(payloads: Vec<BlockData>, nonces: Vec<u64>) -> Vec<Block> {
    let mut chain = Vec::with_capacity(payloads.len() + 1);
    let genesis_data = BlockData::genesis();
    let timestamp = 1_700_000_000_000i64;
    chain.push(Block {
        id: Uuid::now_v7(),
        current_hash: hasher::compute_hash(&genesis_data, GENESIS_PREVIOUS_HASH, timestamp, 0)
            .unwrap(),
        data: genesis_data,
        previous_hash: GENESIS_PREVIOUS_HASH.to_string(),
        nonce: 0,
        timestamp,
    });

    for (i, (data, nonce)) in payloads.into_iter().zip(nonces).enumerate() {
        let previous_hash = chain[i].current_hash.clone();
        // Same-millisecond blocks are allowed
        let timestamp = timestamp + (i as i64 / 2);
        let current_hash = hasher::compute_hash(&data, &previous_hash, timestamp, nonce).unwrap();
        chain.push(Block {
            id: Uuid::now_v7(),
            data,
            previous_hash,
            current_hash,
            nonce,
            timestamp,
        });
    }
    chain
}

fn open_treasury() -> (Treasury, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.data_dir = temp_dir.path().to_path_buf();
    (Treasury::open(config).unwrap(), temp_dir)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// In-memory chains verify
    #[test]
    fn prop_built_chains_verify(
        payloads in prop::collection::vec(payload_strategy(), 0..30),
        nonces in prop::collection::vec(0u64..1_000_000, 30),
    ) {
        let chain = build_chain(payloads, nonces);
        let len = chain.len();
        let result = verify_blocks(chain).unwrap();
        prop_assert!(result.valid);
        prop_assert_eq!(result.first_invalid_index, None);
        prop_assert_eq!(result.chain.len(), len);
    }

    /// Tampering is reported at the first tampered block
    #[test]
    fn prop_tampering_detected_at_index(
        payloads in prop::collection::vec(payload_strategy(), 1..20),
        nonces in prop::collection::vec(0u64..1_000_000, 20),
        position in any::<prop::sample::Index>(),
        tamper in tamper_strategy(),
    ) {
        let mut chain = build_chain(payloads, nonces);
        let index = position.index(chain.len());
        let block = &mut chain[index];
        match tamper {
            Tamper::Amount => block.data.amount += 1,
            Tamper::Description => block.data.description.push('!'),
            Tamper::Nonce => block.nonce += 1,
            Tamper::Timestamp => block.timestamp -= 1,
            Tamper::PreviousHash => block.previous_hash = format!("{}0", block.previous_hash),
        }

        let result = verify_blocks(chain).unwrap();
        prop_assert!(!result.valid);
        prop_assert_eq!(result.first_invalid_index, Some(index));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Chains written through the ledger verify
    #[test]
    fn prop_stored_chains_verify(payloads in prop::collection::vec(payload_strategy(), 0..15)) {
        let (treasury, _temp) = open_treasury();
        let org = treasury.orgs().create_org("Kas", "", "alice").unwrap();
        let count = payloads.len();
        for payload in payloads {
            treasury.ledger().append_block(&org.id, payload).unwrap();
        }

        let result = treasury.ledger().verify_chain(&org.id).unwrap();
        prop_assert!(result.valid);
        prop_assert_eq!(result.chain.len(), count + 1);
    }

    /// Vote totals stay within the member count whatever the callers do
    #[test]
    fn prop_vote_totals_bounded(
        members in 1usize..8,
        ballots in prop::collection::vec((0usize..10, any::<bool>()), 0..24),
    ) {
        let (treasury, _temp) = open_treasury();
        let org = treasury.orgs().create_org("Kas", "", "m0").unwrap();
        for i in 1..members {
            treasury.orgs().join_by_invite(&org.invite_code, &format!("m{}", i)).unwrap();
        }
        let proposal = treasury
            .proposals()
            .create_proposal(&org.id, NewProposal {
                title: "Dues".to_string(),
                description: String::new(),
                action: ProposalAction::Income { amount: 10_000 },
                proposer_id: "m0".to_string(),
                proposer_name: "M0".to_string(),
                voting_hours: None,
            })
            .unwrap();

        for (voter, in_favour) in ballots {
            let choice = if in_favour { VoteChoice::For } else { VoteChoice::Against };
            // Non-members, repeat voters and closed proposals are rejected
            let _ = treasury
                .proposals()
                .cast_vote(&org.id, &proposal.id, &format!("m{}", voter), choice);

            let tally = treasury.proposals().tally(&org.id, &proposal.id).unwrap();
            prop_assert!(tally.total() <= members as u64);
            prop_assert_eq!(tally.total(), tally.voters.len() as u64);
            let in_favour = tally.voters.values().filter(|c| **c == VoteChoice::For).count();
            prop_assert_eq!(tally.votes_for, in_favour as u64);
        }
    }
}
