//! Balance mutation
//!
//! Deltas are RocksDB merge operands summed by an associative operator, so
//! concurrent credits and debits commute and none is ever lost.

use crate::{
    storage::{Storage, WriteSet},
    Result,
};
use std::sync::Arc;

/// Applies signed deltas to organization balances
#[derive(Debug, Clone)]
pub struct BalanceMutator {
    storage: Arc<Storage>,
}

impl BalanceMutator {
    /// Create a mutator over shared storage
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Add `delta` (negative for debits) to an organization's balance
    pub fn apply_delta(&self, org_id: &str, delta: i64) -> Result<()> {
        let mut ws = self.storage.write_set();
        self.stage_delta(&mut ws, org_id, delta)?;
        ws.commit()?;
        tracing::debug!(org_id, delta, "Balance delta applied");
        Ok(())
    }

    /// Stage a delta to commit together with other records
    pub fn stage_delta(&self, ws: &mut WriteSet<'_>, org_id: &str, delta: i64) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }
        ws.merge_balance(org_id, delta)
    }

    /// Current balance
    pub fn balance(&self, org_id: &str) -> Result<i64> {
        self.storage.balance(org_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use std::thread;
    use tempfile::TempDir;

    fn setup() -> (BalanceMutator, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        let storage = Arc::new(Storage::open(&config).unwrap());
        (BalanceMutator::new(storage), temp_dir)
    }

    #[test]
    fn test_apply_delta() {
        let (mutator, _temp) = setup();
        mutator.apply_delta("org-1", 50_000).unwrap();
        mutator.apply_delta("org-1", -20_000).unwrap();
        mutator.apply_delta("org-1", 0).unwrap();
        assert_eq!(mutator.balance("org-1").unwrap(), 30_000);
    }

    #[test]
    fn test_concurrent_deltas_are_not_lost() {
        let (mutator, _temp) = setup();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let mutator = mutator.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        let delta = if i % 2 == 0 { 1_000 } else { -250 };
                        mutator.apply_delta("org-1", delta).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // 4 threads * 100 * 1_000 - 4 threads * 100 * 250
        assert_eq!(mutator.balance("org-1").unwrap(), 300_000);
    }
}
