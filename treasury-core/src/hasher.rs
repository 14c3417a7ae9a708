//! Block hashing
//!
//! The hash input is the JSON encoding of [`BlockData`] (fixed field order,
//! absent fields as `null`) followed by the previous hash, the decimal
//! millisecond timestamp and the decimal nonce, all as UTF-8. The digest is
//! SHA-256, lowercase hex. Any implementation that follows these rules
//! reproduces the stored hashes bit for bit.

use crate::{
    types::{Block, BlockData},
    Result,
};
use sha2::{Digest, Sha256};

/// Canonical bytes hashed for a block
pub fn canonical_bytes(
    data: &BlockData,
    previous_hash: &str,
    timestamp: i64,
    nonce: u64,
) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(data)?;
    bytes.extend_from_slice(previous_hash.as_bytes());
    bytes.extend_from_slice(timestamp.to_string().as_bytes());
    bytes.extend_from_slice(nonce.to_string().as_bytes());
    Ok(bytes)
}

/// Hash a block's content and linkage
pub fn compute_hash(
    data: &BlockData,
    previous_hash: &str,
    timestamp: i64,
    nonce: u64,
) -> Result<String> {
    let bytes = canonical_bytes(data, previous_hash, timestamp, nonce)?;
    Ok(hash_bytes(&bytes))
}

/// Recompute the hash a stored block should carry
pub fn recompute(block: &Block) -> Result<String> {
    compute_hash(&block.data, &block.previous_hash, block.timestamp, block.nonce)
}

/// SHA-256 of arbitrary bytes, lowercase hex
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BlockKind, GENESIS_PREVIOUS_HASH};

    #[test]
    fn test_known_genesis_vector() {
        let hash = compute_hash(
            &BlockData::genesis(),
            GENESIS_PREVIOUS_HASH,
            1_700_000_000_000,
            0,
        )
        .unwrap();

        assert_eq!(
            hash,
            "3b322933b8a2fcfc0bb4827a09bc87fdeb039ab002a699a92403e6488dc2d00f"
        );
    }

    #[test]
    fn test_hash_is_deterministic() {
        let data = BlockData::new(BlockKind::Income, "Iuran Januari", 50_000);
        let a = compute_hash(&data, GENESIS_PREVIOUS_HASH, 1, 7).unwrap();
        let b = compute_hash(&data, GENESIS_PREVIOUS_HASH, 1, 7).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_nonce_separates_same_instant_blocks() {
        let data = BlockData::new(BlockKind::Expense, "Snacks", 12_000);
        let a = compute_hash(&data, GENESIS_PREVIOUS_HASH, 1_000, 1).unwrap();
        let b = compute_hash(&data, GENESIS_PREVIOUS_HASH, 1_000, 2).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_every_input_affects_hash() {
        let data = BlockData::new(BlockKind::Income, "Dues", 10_000);
        let base = compute_hash(&data, "ab", 5, 9).unwrap();

        let mut changed = data.clone();
        changed.amount = 10_001;
        assert_ne!(base, compute_hash(&changed, "ab", 5, 9).unwrap());
        assert_ne!(base, compute_hash(&data, "ac", 5, 9).unwrap());
        assert_ne!(base, compute_hash(&data, "ab", 6, 9).unwrap());
        assert_ne!(base, compute_hash(&data, "ab", 5, 8).unwrap());
    }
}
