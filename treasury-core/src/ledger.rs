//! Per-organization hash-chained ledger
//!
//! Blocks are keyed by height, assigned under the organization lock, so the
//! chain order is the write order even when two blocks share a millisecond.
//! Blocks are only ever appended; whole chains disappear with their org.

use crate::{
    hasher,
    locks::LockRegistry,
    metrics::Metrics,
    storage::{Storage, WriteSet},
    types::{Block, BlockData, ChainVerification, GENESIS_PREVIOUS_HASH},
    Error, Result,
};
use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use uuid::Uuid;

/// Nonces are drawn from `0..NONCE_RANGE`
const NONCE_RANGE: u64 = 1_000_000;

/// Hash-chain ledger
#[derive(Debug, Clone)]
pub struct Ledger {
    storage: Arc<Storage>,
    locks: Arc<LockRegistry>,
    metrics: Metrics,
}

impl Ledger {
    /// Create a ledger over shared storage
    pub fn new(storage: Arc<Storage>, locks: Arc<LockRegistry>, metrics: Metrics) -> Self {
        Self {
            storage,
            locks,
            metrics,
        }
    }

    /// Write the first block of an organization's chain
    pub fn create_genesis_block(&self, org_id: &str) -> Result<Block> {
        let org_lock = self.locks.org(org_id);
        let _org = org_lock.lock();

        self.storage.get_org(org_id)?;
        if self.storage.chain_tip(org_id)?.is_some() {
            return Err(Error::ChainAlreadyInitialized(org_id.to_string()));
        }

        let mut ws = self.storage.write_set();
        let block = self.stage_genesis(&mut ws, org_id)?;
        ws.commit()?;
        self.record_committed();

        tracing::info!(org_id, hash = %block.current_hash, "Genesis block created");
        Ok(block)
    }

    /// Stage the genesis block of a chain that has none yet
    pub(crate) fn stage_genesis(&self, ws: &mut WriteSet<'_>, org_id: &str) -> Result<Block> {
        let timestamp = Utc::now().timestamp_millis();
        let data = BlockData::genesis();
        let current_hash = hasher::compute_hash(&data, GENESIS_PREVIOUS_HASH, timestamp, 0)?;
        let block = Block {
            id: Uuid::now_v7(),
            data,
            previous_hash: GENESIS_PREVIOUS_HASH.to_string(),
            current_hash,
            nonce: 0,
            timestamp,
        };
        ws.append_block(org_id, 0, &block)?;
        Ok(block)
    }

    /// Count a block whose write set was committed
    pub(crate) fn record_committed(&self) {
        self.metrics.record_block_appended();
    }

    /// Append a block after the current tail
    ///
    /// Does not touch the balance.
    pub fn append_block(&self, org_id: &str, data: BlockData) -> Result<Block> {
        let org_lock = self.locks.org(org_id);
        let _org = org_lock.lock();

        self.storage.get_org(org_id)?;

        let mut ws = self.storage.write_set();
        let block = self.stage_block(&mut ws, org_id, data)?;
        ws.commit()?;
        self.metrics.record_block_appended();
        Ok(block)
    }

    /// Stage a block linked to the current tail
    ///
    /// The caller must hold the organization lock until the write set is
    /// committed, and must stage at most one block per write set.
    pub(crate) fn stage_block(
        &self,
        ws: &mut WriteSet<'_>,
        org_id: &str,
        data: BlockData,
    ) -> Result<Block> {
        let (height, previous_hash) = match self.storage.chain_tip(org_id)? {
            Some(tip) => (tip.height + 1, tip.hash),
            None => {
                tracing::warn!(org_id, "Appending to a chain without genesis");
                (0, GENESIS_PREVIOUS_HASH.to_string())
            }
        };

        let timestamp = Utc::now().timestamp_millis();
        let nonce = rand::thread_rng().gen_range(0..NONCE_RANGE);
        let current_hash = hasher::compute_hash(&data, &previous_hash, timestamp, nonce)?;

        let block = Block {
            id: Uuid::now_v7(),
            data,
            previous_hash,
            current_hash,
            nonce,
            timestamp,
        };
        ws.append_block(org_id, height, &block)?;

        tracing::debug!(
            org_id,
            height,
            block_type = block.data.kind.as_str(),
            amount = block.data.amount,
            "Block staged"
        );
        Ok(block)
    }

    /// Chain in write order
    pub fn get_chain(&self, org_id: &str) -> Result<Vec<Block>> {
        self.storage.load_chain(org_id)
    }

    /// Audit an organization's chain
    ///
    /// Reads without taking the organization lock.
    pub fn verify_chain(&self, org_id: &str) -> Result<ChainVerification> {
        let chain = self.storage.load_chain(org_id)?;
        let verification = verify_blocks(chain)?;
        self.metrics.record_verification(verification.valid);

        if verification.valid {
            tracing::debug!(org_id, blocks = verification.chain.len(), "Chain verified");
        } else {
            tracing::warn!(
                org_id,
                index = ?verification.first_invalid_index,
                detail = %verification.detail,
                "Chain verification failed"
            );
        }
        Ok(verification)
    }
}

/// Check a chain in one pass, stopping at the first fault
///
/// Per block: the genesis sentinel (index 0 only), the recomputed hash, and
/// the link to the predecessor (index > 0).
pub fn verify_blocks(chain: Vec<Block>) -> Result<ChainVerification> {
    if chain.is_empty() {
        return Ok(ChainVerification {
            valid: true,
            first_invalid_index: None,
            detail: "Chain is empty".to_string(),
            chain,
        });
    }

    let mut fault = None;
    for (index, block) in chain.iter().enumerate() {
        if index == 0 && block.previous_hash != GENESIS_PREVIOUS_HASH {
            fault = Some((index, "Genesis block has an invalid previous hash".to_string()));
            break;
        }

        let computed = hasher::recompute(block)?;
        if computed != block.current_hash {
            fault = Some((
                index,
                format!(
                    "Block {} hash mismatch: stored {}, computed {}",
                    index, block.current_hash, computed
                ),
            ));
            break;
        }

        if index > 0 && block.previous_hash != chain[index - 1].current_hash {
            fault = Some((
                index,
                format!(
                    "Block {} previous hash does not match block {}",
                    index,
                    index - 1
                ),
            ));
            break;
        }
    }

    Ok(match fault {
        Some((index, detail)) => ChainVerification {
            valid: false,
            first_invalid_index: Some(index),
            detail,
            chain,
        },
        None => ChainVerification {
            valid: true,
            first_invalid_index: None,
            detail: format!("Chain verified: {} blocks", chain.len()),
            chain,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BlockKind, OrgStatus, Organization};
    use crate::Config;
    use tempfile::TempDir;

    fn setup() -> (Ledger, Arc<Storage>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        let storage = Arc::new(Storage::open(&config).unwrap());

        let org = Organization {
            id: "org-1".to_string(),
            name: "Kas".to_string(),
            description: String::new(),
            invite_code: "ABC234".to_string(),
            members: ["alice".to_string()].into_iter().collect(),
            member_count: 1,
            created_by: "alice".to_string(),
            created_at: Utc::now(),
            status: OrgStatus::Active,
            balance: 0,
        };
        let mut ws = storage.write_set();
        ws.put_org(&org).unwrap();
        ws.commit().unwrap();

        let ledger = Ledger::new(
            storage.clone(),
            Arc::new(LockRegistry::new()),
            Metrics::new().unwrap(),
        );
        (ledger, storage, temp_dir)
    }

    #[test]
    fn test_genesis_block() {
        let (ledger, _storage, _temp) = setup();
        let genesis = ledger.create_genesis_block("org-1").unwrap();

        assert_eq!(genesis.previous_hash, GENESIS_PREVIOUS_HASH);
        assert_eq!(genesis.nonce, 0);
        assert_eq!(genesis.data.amount, 0);
        assert_eq!(genesis.data.kind, BlockKind::Genesis);
        assert_eq!(hasher::recompute(&genesis).unwrap(), genesis.current_hash);
    }

    #[test]
    fn test_genesis_requires_org_and_empty_chain() {
        let (ledger, _storage, _temp) = setup();
        assert!(matches!(
            ledger.create_genesis_block("missing"),
            Err(Error::OrgNotFound(_))
        ));

        ledger.create_genesis_block("org-1").unwrap();
        assert!(matches!(
            ledger.create_genesis_block("org-1"),
            Err(Error::ChainAlreadyInitialized(_))
        ));
    }

    #[test]
    fn test_append_links_to_tail() {
        let (ledger, _storage, _temp) = setup();
        let genesis = ledger.create_genesis_block("org-1").unwrap();
        let first = ledger
            .append_block("org-1", BlockData::new(BlockKind::Income, "Dues", 50_000))
            .unwrap();
        let second = ledger
            .append_block("org-1", BlockData::new(BlockKind::Expense, "Snacks", 5_000))
            .unwrap();

        assert_eq!(first.previous_hash, genesis.current_hash);
        assert_eq!(second.previous_hash, first.current_hash);
        assert!(second.nonce < NONCE_RANGE);

        let chain = ledger.get_chain("org-1").unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[2].id, second.id);
    }

    #[test]
    fn test_verify_empty_and_valid_chain() {
        let (ledger, _storage, _temp) = setup();
        let empty = ledger.verify_chain("org-1").unwrap();
        assert!(empty.valid);
        assert!(empty.chain.is_empty());

        ledger.create_genesis_block("org-1").unwrap();
        for i in 0..5 {
            ledger
                .append_block("org-1", BlockData::new(BlockKind::Income, "Dues", 1_000 * i))
                .unwrap();
        }
        let result = ledger.verify_chain("org-1").unwrap();
        assert!(result.valid);
        assert_eq!(result.first_invalid_index, None);
        assert_eq!(result.chain.len(), 6);
    }

    #[test]
    fn test_verify_detects_tampered_amount() {
        let (ledger, storage, _temp) = setup();
        ledger.create_genesis_block("org-1").unwrap();
        ledger
            .append_block("org-1", BlockData::new(BlockKind::Income, "Dues", 50_000))
            .unwrap();
        ledger
            .append_block("org-1", BlockData::new(BlockKind::Expense, "Rent", 10_000))
            .unwrap();

        let mut chain = ledger.get_chain("org-1").unwrap();
        chain[1].data.amount = 5_000_000;
        storage.put_block("org-1", 1, &chain[1]).unwrap();

        let result = ledger.verify_chain("org-1").unwrap();
        assert!(!result.valid);
        assert_eq!(result.first_invalid_index, Some(1));
        assert!(result.detail.contains("hash mismatch"));
    }

    #[test]
    fn test_verify_detects_broken_link() {
        let (ledger, storage, _temp) = setup();
        ledger.create_genesis_block("org-1").unwrap();
        ledger
            .append_block("org-1", BlockData::new(BlockKind::Income, "Dues", 50_000))
            .unwrap();

        // Re-hash block 1 over a forged predecessor so only the link is wrong
        let mut chain = ledger.get_chain("org-1").unwrap();
        chain[1].previous_hash = "f".repeat(64);
        chain[1].current_hash = hasher::recompute(&chain[1]).unwrap();
        storage.put_block("org-1", 1, &chain[1]).unwrap();

        let result = ledger.verify_chain("org-1").unwrap();
        assert_eq!(result.first_invalid_index, Some(1));
        assert!(result.detail.contains("previous hash"));
    }

    #[test]
    fn test_verify_detects_bad_genesis_sentinel() {
        let (ledger, storage, _temp) = setup();
        ledger.create_genesis_block("org-1").unwrap();

        let mut chain = ledger.get_chain("org-1").unwrap();
        chain[0].previous_hash = "1".repeat(64);
        storage.put_block("org-1", 0, &chain[0]).unwrap();

        let result = ledger.verify_chain("org-1").unwrap();
        assert_eq!(result.first_invalid_index, Some(0));
    }
}
