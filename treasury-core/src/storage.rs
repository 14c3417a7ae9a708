//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `organizations` - Organization records (key: org_id)
//! - `invite_codes` - Invite code index (key: code, value: org_id)
//! - `memberships` - Per-user membership list (key: user_id || org_id)
//! - `balances` - Org balances, i64 merge operands (key: org_id)
//! - `blocks` - Hash-chained blocks (key: org_id || height)
//! - `chain_tips` - Tail of each chain (key: org_id)
//! - `proposals` - Proposals (key: org_id || proposal_id)
//! - `votes` - One ballot per voter (key: org_id || proposal_id || voter_id)
//! - `tallies` - Vote counters, i64 merge operands (key: org_id || proposal_id || side)
//! - `payments` - Payment orders (key: order_id)
//! - `org_payments` - Payment index (key: org_id || order_id)
//! - `credits` - Exactly-once credit markers (key: order_id)
//! - `deletions` - Org deletion saga markers (key: org_id)
//!
//! `||` is a single `0x00` separator; identifiers never contain it, so every
//! org's records occupy the contiguous range `[org_id 0x00, org_id 0x01)`.

use crate::{
    error::{Error, Result},
    types::{
        Block, ChainTip, CreditMarker, DeletionMarker, DeletionStage, OrgStatus, Organization,
        PaymentOrder, Proposal, Tally, VoteChoice,
    },
    Config,
};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, MergeOperands, Options,
    WriteBatch, DB,
};
use serde::{de::DeserializeOwned, Serialize};

/// Column family names
const CF_ORGS: &str = "organizations";
const CF_INVITES: &str = "invite_codes";
const CF_MEMBERSHIPS: &str = "memberships";
const CF_BALANCES: &str = "balances";
const CF_BLOCKS: &str = "blocks";
const CF_TIPS: &str = "chain_tips";
const CF_PROPOSALS: &str = "proposals";
const CF_VOTES: &str = "votes";
const CF_TALLIES: &str = "tallies";
const CF_PAYMENTS: &str = "payments";
const CF_ORG_PAYMENTS: &str = "org_payments";
const CF_CREDITS: &str = "credits";
const CF_DELETIONS: &str = "deletions";

const ALL_CFS: [&str; 13] = [
    CF_ORGS,
    CF_INVITES,
    CF_MEMBERSHIPS,
    CF_BALANCES,
    CF_BLOCKS,
    CF_TIPS,
    CF_PROPOSALS,
    CF_VOTES,
    CF_TALLIES,
    CF_PAYMENTS,
    CF_ORG_PAYMENTS,
    CF_CREDITS,
    CF_DELETIONS,
];

const SEP: u8 = 0x00;

/// Associative add over big-endian i64 operands
///
/// Backs balances and vote counters so concurrent writers never overwrite
/// each other. Returns `None` (merge failure) on a malformed operand.
fn add_i64_merge(_key: &[u8], existing: Option<&[u8]>, operands: &MergeOperands) -> Option<Vec<u8>> {
    let mut total = match existing {
        Some(bytes) => decode_i64(bytes)?,
        None => 0,
    };
    for operand in operands.iter() {
        total = total.checked_add(decode_i64(operand)?)?;
    }
    Some(total.to_be_bytes().to_vec())
}

fn decode_i64(bytes: &[u8]) -> Option<i64> {
    <[u8; 8]>::try_from(bytes).ok().map(i64::from_be_bytes)
}

fn key2(a: &str, b: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(a.len() + b.len() + 1);
    key.extend_from_slice(a.as_bytes());
    key.push(SEP);
    key.extend_from_slice(b.as_bytes());
    key
}

fn key3(a: &str, b: &str, c: &str) -> Vec<u8> {
    let mut key = key2(a, b);
    key.push(SEP);
    key.extend_from_slice(c.as_bytes());
    key
}

fn prefix_of(parts: &[&str]) -> Vec<u8> {
    let mut key = Vec::new();
    for part in parts {
        key.extend_from_slice(part.as_bytes());
        key.push(SEP);
    }
    key
}

fn block_key(org_id: &str, height: u64) -> Vec<u8> {
    let mut key = prefix_of(&[org_id]);
    key.extend_from_slice(&height.to_be_bytes());
    key
}

/// Exclusive upper bound for every key starting with `org_id 0x00`
fn org_range(org_id: &str) -> (Vec<u8>, Vec<u8>) {
    let start = prefix_of(&[org_id]);
    let mut end = org_id.as_bytes().to_vec();
    end.push(SEP + 1);
    (start, end)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Storage wrapper for RocksDB
pub struct Storage {
    db: DB,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").field("path", &self.db.path()).finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);
        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name)))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(
            path = ?path,
            column_families = ALL_CFS.len(),
            "Opened treasury store"
        );

        Ok(Self { db })
    }

    fn cf_options(name: &str) -> Options {
        let mut opts = Options::default();
        match name {
            CF_BALANCES | CF_TALLIES => {
                opts.set_merge_operator_associative("add_i64", add_i64_merge);
            }
            CF_BLOCKS | CF_PAYMENTS => {
                opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
            }
            _ => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
            }
        }
        opts
    }

    // Helpers

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn get_record<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf_handle(cf_name)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_counter(&self, cf_name: &str, key: &[u8]) -> Result<i64> {
        let cf = self.cf_handle(cf_name)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) => decode_i64(&bytes)
                .ok_or_else(|| Error::Storage(format!("Corrupt counter in {}", cf_name))),
            None => Ok(0),
        }
    }

    /// All entries whose key starts with `prefix`, in key order
    fn scan_prefix(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>> {
        let cf = self.cf_handle(cf_name)?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

        let mut entries = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key, value));
        }
        Ok(entries)
    }

    /// Start an atomic multi-record update
    pub fn write_set(&self) -> WriteSet<'_> {
        WriteSet {
            storage: self,
            batch: WriteBatch::default(),
        }
    }

    // Organization operations

    /// Organization record regardless of lifecycle status, with balance
    pub fn find_org(&self, org_id: &str) -> Result<Option<Organization>> {
        let org: Option<Organization> = self.get_record(CF_ORGS, org_id.as_bytes())?;
        match org {
            Some(mut org) => {
                org.balance = self.balance(org_id)?;
                Ok(Some(org))
            }
            None => Ok(None),
        }
    }

    /// Active organization, or `OrgNotFound`
    pub fn get_org(&self, org_id: &str) -> Result<Organization> {
        match self.find_org(org_id)? {
            Some(org) if org.status == OrgStatus::Active => Ok(org),
            _ => Err(Error::OrgNotFound(org_id.to_string())),
        }
    }

    /// IDs of every active organization
    pub fn list_active_org_ids(&self) -> Result<Vec<String>> {
        let cf = self.cf_handle(CF_ORGS)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let org: Organization = decode(&value)?;
            if org.status == OrgStatus::Active {
                ids.push(org.id);
            }
        }
        Ok(ids)
    }

    /// Organization currently using an invite code
    pub fn lookup_invite(&self, code: &str) -> Result<Option<String>> {
        let cf = self.cf_handle(CF_INVITES)?;
        match self.db.get_cf(cf, code.as_bytes())? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| Error::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    /// Organizations a user belongs to
    pub fn memberships(&self, user_id: &str) -> Result<Vec<String>> {
        let prefix = prefix_of(&[user_id]);
        self.scan_prefix(CF_MEMBERSHIPS, &prefix)?
            .into_iter()
            .map(|(key, _)| {
                String::from_utf8(key[prefix.len()..].to_vec())
                    .map_err(|e| Error::Serialization(e.to_string()))
            })
            .collect()
    }

    /// Current balance (0 when nothing was ever applied)
    pub fn balance(&self, org_id: &str) -> Result<i64> {
        self.get_counter(CF_BALANCES, org_id.as_bytes())
    }

    // Ledger operations

    /// Tail of an organization's chain
    pub fn chain_tip(&self, org_id: &str) -> Result<Option<ChainTip>> {
        self.get_record(CF_TIPS, org_id.as_bytes())
    }

    /// Every block of an organization's chain in height order
    pub fn load_chain(&self, org_id: &str) -> Result<Vec<Block>> {
        self.scan_prefix(CF_BLOCKS, &prefix_of(&[org_id]))?
            .into_iter()
            .map(|(_, value)| decode(&value))
            .collect()
    }

    /// Overwrite the block stored at `height` without touching the tip
    #[cfg(test)]
    pub(crate) fn put_block(&self, org_id: &str, height: u64, block: &Block) -> Result<()> {
        let cf = self.cf_handle(CF_BLOCKS)?;
        self.db.put_cf(cf, block_key(org_id, height), encode(block)?)?;
        Ok(())
    }

    // Proposal operations

    /// Proposal by ID
    pub fn get_proposal(&self, org_id: &str, proposal_id: &str) -> Result<Proposal> {
        self.get_record(CF_PROPOSALS, &key2(org_id, proposal_id))?
            .ok_or_else(|| Error::ProposalNotFound(proposal_id.to_string()))
    }

    /// Every proposal of an organization
    pub fn list_proposals(&self, org_id: &str) -> Result<Vec<Proposal>> {
        self.scan_prefix(CF_PROPOSALS, &prefix_of(&[org_id]))?
            .into_iter()
            .map(|(_, value)| decode(&value))
            .collect()
    }

    /// Ballots and counters of a proposal
    pub fn get_tally(&self, org_id: &str, proposal_id: &str) -> Result<Tally> {
        let votes_for =
            self.get_counter(CF_TALLIES, &key3(org_id, proposal_id, VoteChoice::For.as_str()))?;
        let votes_against = self.get_counter(
            CF_TALLIES,
            &key3(org_id, proposal_id, VoteChoice::Against.as_str()),
        )?;

        let prefix = prefix_of(&[org_id, proposal_id]);
        let mut voters = std::collections::BTreeMap::new();
        for (key, value) in self.scan_prefix(CF_VOTES, &prefix)? {
            let voter = String::from_utf8(key[prefix.len()..].to_vec())
                .map_err(|e| Error::Serialization(e.to_string()))?;
            voters.insert(voter, decode::<VoteChoice>(&value)?);
        }

        Ok(Tally {
            votes_for: votes_for.max(0) as u64,
            votes_against: votes_against.max(0) as u64,
            voters,
        })
    }

    /// Ballot cast by `voter_id`, if any
    pub fn get_vote(
        &self,
        org_id: &str,
        proposal_id: &str,
        voter_id: &str,
    ) -> Result<Option<VoteChoice>> {
        self.get_record(CF_VOTES, &key3(org_id, proposal_id, voter_id))
    }

    // Payment operations

    /// Payment order by ID
    pub fn get_payment(&self, order_id: &str) -> Result<PaymentOrder> {
        self.get_record(CF_PAYMENTS, order_id.as_bytes())?
            .ok_or_else(|| Error::PaymentNotFound(order_id.to_string()))
    }

    /// Payment orders of an organization
    pub fn list_org_payments(&self, org_id: &str) -> Result<Vec<PaymentOrder>> {
        let prefix = prefix_of(&[org_id]);
        let mut orders = Vec::new();
        for (key, _) in self.scan_prefix(CF_ORG_PAYMENTS, &prefix)? {
            let order_id = String::from_utf8(key[prefix.len()..].to_vec())
                .map_err(|e| Error::Serialization(e.to_string()))?;
            if let Some(order) = self.get_record(CF_PAYMENTS, order_id.as_bytes())? {
                orders.push(order);
            }
        }
        Ok(orders)
    }

    /// Credit marker for an order, present once its money has moved
    pub fn credit_marker(&self, order_id: &str) -> Result<Option<CreditMarker>> {
        self.get_record(CF_CREDITS, order_id.as_bytes())
    }

    // Deletion saga

    /// Saga marker for an organization
    pub fn deletion_marker(&self, org_id: &str) -> Result<Option<DeletionMarker>> {
        self.get_record(CF_DELETIONS, org_id.as_bytes())
    }

    /// Deletions that started but never completed
    pub fn pending_deletions(&self) -> Result<Vec<DeletionMarker>> {
        let cf = self.cf_handle(CF_DELETIONS)?;
        let mut pending = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let marker: DeletionMarker = decode(&value)?;
            if marker.stage != DeletionStage::Completed {
                pending.push(marker);
            }
        }
        Ok(pending)
    }
}

/// Staged writes committed atomically with [`WriteSet::commit`]
pub struct WriteSet<'a> {
    storage: &'a Storage,
    batch: WriteBatch,
}

impl<'a> WriteSet<'a> {
    fn cf(&self, name: &str) -> Result<&'a ColumnFamily> {
        self.storage.cf_handle(name)
    }

    /// Store an organization record
    pub fn put_org(&mut self, org: &Organization) -> Result<()> {
        let cf = self.cf(CF_ORGS)?;
        self.batch.put_cf(cf, org.id.as_bytes(), encode(org)?);
        Ok(())
    }

    /// Remove an organization record
    pub fn delete_org(&mut self, org_id: &str) -> Result<()> {
        let cf = self.cf(CF_ORGS)?;
        self.batch.delete_cf(cf, org_id.as_bytes());
        Ok(())
    }

    /// Point an invite code at an organization
    pub fn put_invite(&mut self, code: &str, org_id: &str) -> Result<()> {
        let cf = self.cf(CF_INVITES)?;
        self.batch.put_cf(cf, code.as_bytes(), org_id.as_bytes());
        Ok(())
    }

    /// Release an invite code
    pub fn delete_invite(&mut self, code: &str) -> Result<()> {
        let cf = self.cf(CF_INVITES)?;
        self.batch.delete_cf(cf, code.as_bytes());
        Ok(())
    }

    /// Add an org to a user's membership list
    pub fn add_membership(&mut self, user_id: &str, org_id: &str) -> Result<()> {
        let cf = self.cf(CF_MEMBERSHIPS)?;
        self.batch.put_cf(cf, key2(user_id, org_id), []);
        Ok(())
    }

    /// Remove an org from a user's membership list
    pub fn remove_membership(&mut self, user_id: &str, org_id: &str) -> Result<()> {
        let cf = self.cf(CF_MEMBERSHIPS)?;
        self.batch.delete_cf(cf, key2(user_id, org_id));
        Ok(())
    }

    /// Add a signed delta to an organization's balance (merge operand)
    pub fn merge_balance(&mut self, org_id: &str, delta: i64) -> Result<()> {
        let cf = self.cf(CF_BALANCES)?;
        self.batch.merge_cf(cf, org_id.as_bytes(), delta.to_be_bytes());
        Ok(())
    }

    /// Store a block at `height` and make it the chain tail
    pub fn append_block(&mut self, org_id: &str, height: u64, block: &Block) -> Result<()> {
        let blocks = self.cf(CF_BLOCKS)?;
        self.batch.put_cf(blocks, block_key(org_id, height), encode(block)?);

        let tip = ChainTip {
            height,
            hash: block.current_hash.clone(),
        };
        let tips = self.cf(CF_TIPS)?;
        self.batch.put_cf(tips, org_id.as_bytes(), encode(&tip)?);
        Ok(())
    }

    /// Store a proposal record
    pub fn put_proposal(&mut self, proposal: &Proposal) -> Result<()> {
        let cf = self.cf(CF_PROPOSALS)?;
        self.batch
            .put_cf(cf, key2(&proposal.org_id, &proposal.id), encode(proposal)?);
        Ok(())
    }

    /// Record a ballot and bump its counter by one
    pub fn record_vote(
        &mut self,
        org_id: &str,
        proposal_id: &str,
        voter_id: &str,
        choice: VoteChoice,
    ) -> Result<()> {
        let votes = self.cf(CF_VOTES)?;
        self.batch
            .put_cf(votes, key3(org_id, proposal_id, voter_id), encode(&choice)?);

        let tallies = self.cf(CF_TALLIES)?;
        self.batch.merge_cf(
            tallies,
            key3(org_id, proposal_id, choice.as_str()),
            1i64.to_be_bytes(),
        );
        Ok(())
    }

    /// Store a payment order and index it under its organization
    pub fn put_payment(&mut self, order: &PaymentOrder) -> Result<()> {
        let payments = self.cf(CF_PAYMENTS)?;
        self.batch
            .put_cf(payments, order.order_id.as_bytes(), encode(order)?);

        let index = self.cf(CF_ORG_PAYMENTS)?;
        self.batch.put_cf(index, key2(&order.org_id, &order.order_id), []);
        Ok(())
    }

    /// Mark an order as credited
    pub fn put_credit(&mut self, marker: &CreditMarker) -> Result<()> {
        let cf = self.cf(CF_CREDITS)?;
        self.batch
            .put_cf(cf, marker.order_id.as_bytes(), encode(marker)?);
        Ok(())
    }

    /// Store a deletion saga marker
    pub fn put_deletion(&mut self, marker: &DeletionMarker) -> Result<()> {
        let cf = self.cf(CF_DELETIONS)?;
        self.batch
            .put_cf(cf, marker.org_id.as_bytes(), encode(marker)?);
        Ok(())
    }

    /// Remove every record owned by an organization except the org record
    /// itself, its saga marker and member lists
    pub fn purge_org_records(&mut self, org_id: &str) -> Result<()> {
        let orders = self.storage.list_org_payments(org_id)?;
        let payments = self.cf(CF_PAYMENTS)?;
        let credits = self.cf(CF_CREDITS)?;
        for order in &orders {
            self.batch.delete_cf(payments, order.order_id.as_bytes());
            self.batch.delete_cf(credits, order.order_id.as_bytes());
        }

        let (start, end) = org_range(org_id);
        for name in [CF_BLOCKS, CF_PROPOSALS, CF_VOTES, CF_TALLIES, CF_ORG_PAYMENTS] {
            let cf = self.cf(name)?;
            self.batch.delete_range_cf(cf, &start, &end);
        }

        let tips = self.cf(CF_TIPS)?;
        self.batch.delete_cf(tips, org_id.as_bytes());
        let balances = self.cf(CF_BALANCES)?;
        self.batch.delete_cf(balances, org_id.as_bytes());
        Ok(())
    }

    /// Atomically apply every staged write
    pub fn commit(self) -> Result<()> {
        let ops = self.batch.len();
        self.storage.db.write(self.batch)?;
        tracing::trace!(ops, "Write set committed");
        Ok(())
    }
}
