//! Organization registry: creation, invite codes and membership

use crate::{
    ledger::Ledger,
    locks::LockRegistry,
    storage::Storage,
    types::{OrgStatus, Organization},
    Error, Result,
};
use chrono::Utc;
use rand::Rng;
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

/// Invite code alphabet (no 0/O/1/I)
pub const INVITE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Invite code length
pub const INVITE_CODE_LEN: usize = 6;

/// Random invite code. Uniqueness is not checked.
pub fn generate_invite_code() -> String {
    let mut rng = rand::thread_rng();
    (0..INVITE_CODE_LEN)
        .map(|_| INVITE_ALPHABET[rng.gen_range(0..INVITE_ALPHABET.len())] as char)
        .collect()
}

/// Creates organizations and manages their member lists
#[derive(Debug, Clone)]
pub struct OrgRegistry {
    storage: Arc<Storage>,
    locks: Arc<LockRegistry>,
    ledger: Ledger,
}

impl OrgRegistry {
    /// Create a registry
    pub fn new(storage: Arc<Storage>, locks: Arc<LockRegistry>, ledger: Ledger) -> Self {
        Self {
            storage,
            locks,
            ledger,
        }
    }

    /// Create an organization with its creator as sole member and a genesis block
    pub fn create_org(&self, name: &str, description: &str, creator_id: &str) -> Result<Organization> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Validation("Organization name is required".to_string()));
        }
        if creator_id.is_empty() {
            return Err(Error::Validation("Creator is required".to_string()));
        }

        let mut members = BTreeSet::new();
        members.insert(creator_id.to_string());

        let org = Organization {
            id: Uuid::new_v4().simple().to_string(),
            name: name.to_string(),
            description: description.trim().to_string(),
            invite_code: generate_invite_code(),
            members,
            member_count: 1,
            created_by: creator_id.to_string(),
            created_at: Utc::now(),
            status: OrgStatus::Active,
            balance: 0,
        };

        let org_lock = self.locks.org(&org.id);
        let _org = org_lock.lock();

        // A colliding code simply takes over the index entry
        let mut ws = self.storage.write_set();
        ws.put_org(&org)?;
        ws.put_invite(&org.invite_code, &org.id)?;
        ws.add_membership(creator_id, &org.id)?;
        let genesis = self.ledger.stage_genesis(&mut ws, &org.id)?;
        ws.commit()?;
        self.ledger.record_committed();

        tracing::info!(
            org_id = %org.id,
            creator = creator_id,
            invite_code = %org.invite_code,
            genesis_hash = %genesis.current_hash,
            "Organization created"
        );
        Ok(org)
    }

    /// Join the organization an invite code points at
    pub fn join_by_invite(&self, code: &str, user_id: &str) -> Result<Organization> {
        let code = code.trim().to_uppercase();
        if code.len() != INVITE_CODE_LEN || !code.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(Error::Validation(format!(
                "Invite code must be {} letters or digits",
                INVITE_CODE_LEN
            )));
        }
        if user_id.is_empty() {
            return Err(Error::Validation("User is required".to_string()));
        }

        let org_id = self
            .storage
            .lookup_invite(&code)?
            .ok_or_else(|| Error::InviteCodeNotFound(code.clone()))?;

        let org_lock = self.locks.org(&org_id);
        let _org = org_lock.lock();

        let mut org = self.storage.get_org(&org_id)?;
        if org.is_member(user_id) {
            return Err(Error::AlreadyMember {
                org_id,
                user_id: user_id.to_string(),
            });
        }

        org.members.insert(user_id.to_string());
        org.member_count = org.members.len() as u32;

        let mut ws = self.storage.write_set();
        ws.put_org(&org)?;
        ws.add_membership(user_id, &org.id)?;
        ws.commit()?;

        tracing::info!(
            org_id = %org.id,
            user_id,
            member_count = org.member_count,
            "Member joined"
        );
        Ok(org)
    }

    /// Active organization with its current balance
    pub fn get_org(&self, org_id: &str) -> Result<Organization> {
        self.storage.get_org(org_id)
    }

    /// Active organizations a user belongs to
    pub fn organizations_for(&self, user_id: &str) -> Result<Vec<Organization>> {
        let mut orgs = Vec::new();
        for org_id in self.storage.memberships(user_id)? {
            match self.storage.get_org(&org_id) {
                Ok(org) => orgs.push(org),
                Err(Error::OrgNotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(orgs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{metrics::Metrics, Config};
    use tempfile::TempDir;

    fn setup() -> (OrgRegistry, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        let storage = Arc::new(Storage::open(&config).unwrap());
        let locks = Arc::new(LockRegistry::new());
        let ledger = Ledger::new(storage.clone(), locks.clone(), Metrics::new().unwrap());
        (OrgRegistry::new(storage, locks, ledger), temp_dir)
    }

    #[test]
    fn test_invite_code_alphabet() {
        for _ in 0..100 {
            let code = generate_invite_code();
            assert_eq!(code.len(), INVITE_CODE_LEN);
            assert!(code.bytes().all(|b| INVITE_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn test_create_org() {
        let (registry, _temp) = setup();
        let org = registry.create_org("  Kas RT 05 ", "", "alice").unwrap();

        assert_eq!(org.name, "Kas RT 05");
        assert_eq!(org.member_count, 1);
        assert!(org.is_member("alice"));

        let loaded = registry.get_org(&org.id).unwrap();
        assert_eq!(loaded.balance, 0);
        assert_eq!(registry.ledger.get_chain(&org.id).unwrap().len(), 1);
        assert!(matches!(
            registry.create_org(" ", "", "alice"),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_create_org_commits_genesis_with_org() {
        let (registry, _temp) = setup();
        let org = registry.create_org("Kas", "", "alice").unwrap();

        let tip = registry.storage.chain_tip(&org.id).unwrap().unwrap();
        assert_eq!(tip.height, 0);
        let chain = registry.ledger.get_chain(&org.id).unwrap();
        assert_eq!(chain[0].current_hash, tip.hash);
        assert!(registry.ledger.verify_chain(&org.id).unwrap().valid);
        assert!(matches!(
            registry.ledger.create_genesis_block(&org.id),
            Err(Error::ChainAlreadyInitialized(_))
        ));
    }

    #[test]
    fn test_join_by_invite() {
        let (registry, _temp) = setup();
        let org = registry.create_org("Kas", "", "alice").unwrap();

        let joined = registry
            .join_by_invite(&format!(" {} ", org.invite_code.to_lowercase()), "bob")
            .unwrap();
        assert_eq!(joined.member_count, 2);
        assert_eq!(joined.members.len(), 2);

        assert!(matches!(
            registry.join_by_invite(&org.invite_code, "bob"),
            Err(Error::AlreadyMember { .. })
        ));
        assert!(matches!(
            registry.join_by_invite("ABC", "carol"),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_unknown_invite_code() {
        let (registry, _temp) = setup();
        registry.create_org("Kas", "", "alice").unwrap();
        // '1' is outside the alphabet, so no generated code can match
        assert!(matches!(
            registry.join_by_invite("AAAAA1", "bob"),
            Err(Error::InviteCodeNotFound(_))
        ));
    }

    #[test]
    fn test_organizations_for_user() {
        let (registry, _temp) = setup();
        let a = registry.create_org("A", "", "alice").unwrap();
        let b = registry.create_org("B", "", "bob").unwrap();
        registry.join_by_invite(&b.invite_code, "alice").unwrap();

        let mut ids: Vec<_> = registry
            .organizations_for("alice")
            .unwrap()
            .into_iter()
            .map(|o| o.id)
            .collect();
        ids.sort();
        let mut expected = vec![a.id, b.id];
        expected.sort();
        assert_eq!(ids, expected);
        assert!(registry.organizations_for("nobody").unwrap().is_empty());
    }
}
