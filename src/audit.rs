//! Append-only verification log.
//!
//! Entries are keyed `sha256(package_id)/<uuid7>` so a prefix scan returns one
//! package's history in insertion order. Each entry carries the sha256 of the
//! previous entry for the same package; the newest hash is kept in a separate
//! heads tree. Entry and head are written in one sled transaction, so the
//! chain never forks under concurrent appends and any edit to a stored entry
//! breaks it.
use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use sled::Transactional;
use sled::transaction::ConflictableTransactionError;
use uuid7::uuid7;

use crate::error::{CodeError, StoreError};
use crate::model::TimeStamp;
use crate::store::{decode, encode};
use crate::utils::{owned_key, owner_prefix};

const ENTRIES_TREE: &str = "audit_entries";
const HEADS_TREE: &str = "audit_heads";

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum Action {
    #[n(0)]
    Generate,
    #[n(1)]
    Verify,
    #[n(2)]
    Regenerate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum ActorType {
    #[n(0)]
    System,
    #[n(1)]
    Staff,
    #[n(2)]
    Customer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum Outcome {
    #[n(0)]
    Success,
    #[n(1)]
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct LogEntry {
    #[n(0)]
    pub entry_id: String, // uuid7, orders entries within a package
    #[n(1)]
    pub package_id: String,
    #[n(2)]
    pub shipment_id: Option<String>,
    #[n(3)]
    pub action: Action,
    #[n(4)]
    pub actor_type: ActorType,
    #[n(5)]
    pub actor_id: Option<String>,
    #[n(6)]
    pub outcome: Outcome,
    #[n(7)]
    pub reason: Option<CodeError>,
    #[n(8)]
    pub metadata: BTreeMap<String, String>,
    #[n(9)]
    pub source_ip: Option<String>,
    #[n(10)]
    pub created_at: TimeStamp<Utc>,
    #[n(11)]
    pub prev_hash: String, // empty for the first entry of a package
}

impl LogEntry {
    pub fn new(
        package_id: &str,
        action: Action,
        actor_type: ActorType,
        actor_id: Option<&str>,
        created_at: TimeStamp<Utc>,
    ) -> Self {
        Self {
            entry_id: uuid7().to_string(),
            package_id: package_id.to_string(),
            shipment_id: None,
            action,
            actor_type,
            actor_id: actor_id.map(str::to_string),
            outcome: Outcome::Success,
            reason: None,
            metadata: BTreeMap::new(),
            source_ip: None,
            created_at,
            prev_hash: String::new(),
        }
    }
    pub fn set_shipment(mut self, shipment_id: Option<&str>) -> Self {
        self.shipment_id = shipment_id.map(str::to_string);
        self
    }
    pub fn set_source_ip(mut self, source_ip: Option<&str>) -> Self {
        self.source_ip = source_ip.map(str::to_string);
        self
    }
    pub fn failed(mut self, reason: CodeError) -> Self {
        self.outcome = Outcome::Failure;
        self.reason = Some(reason);
        self
    }
    pub fn note(&mut self, key: &str, value: impl ToString) {
        self.metadata.insert(key.to_string(), value.to_string());
    }
}

#[derive(Clone)]
pub struct AuditLog {
    entries: sled::Tree,
    heads: sled::Tree,
}

impl AuditLog {
    pub fn open(db: &sled::Db) -> Result<Self, StoreError> {
        Ok(Self {
            entries: db.open_tree(ENTRIES_TREE)?,
            heads: db.open_tree(HEADS_TREE)?,
        })
    }

    /// Seal `entry` onto its package's chain. Returns the new chain head.
    pub fn append(&self, entry: &LogEntry) -> Result<String, StoreError> {
        let key = owned_key(&entry.package_id, &entry.entry_id);

        let head = (&self.entries, &self.heads).transaction(|(entries, heads)| {
            let prev_hash = heads
                .get(entry.package_id.as_bytes())?
                .map(|h| String::from_utf8_lossy(&h).into_owned())
                .unwrap_or_default();

            let mut sealed = entry.clone();
            sealed.prev_hash = prev_hash;
            let cbor = encode(&sealed).map_err(ConflictableTransactionError::Abort)?;
            let hash = sha256::digest(&cbor);

            entries.insert(key.as_bytes(), cbor)?;
            heads.insert(entry.package_id.as_bytes(), hash.as_bytes())?;
            Ok(hash)
        })?;

        Ok(head)
    }

    /// Best-effort append. A failed write is reported to the log and never
    /// changes the outcome of the operation being audited.
    pub fn record(&self, entry: LogEntry) {
        if let Err(e) = self.append(&entry) {
            tracing::error!(
                error = %e,
                package_id = %entry.package_id,
                action = ?entry.action,
                outcome = ?entry.outcome,
                "failed to write audit entry"
            );
        }
    }

    pub fn entries_for(&self, package_id: &str) -> Result<Vec<LogEntry>, StoreError> {
        let prefix = owner_prefix(package_id);
        self.entries
            .scan_prefix(prefix.as_bytes())
            .map(|item| {
                let (_, bytes) = item?;
                decode(&bytes)
            })
            .collect()
    }

    /// Recompute a package's chain and compare it with the stored head.
    ///
    /// The chain is walked from the head back through `prev_hash` links
    /// rather than in key order, since two concurrent appends may commit in
    /// the opposite order to their ids.
    pub fn chain_intact(&self, package_id: &str) -> Result<bool, StoreError> {
        let prefix = owner_prefix(package_id);
        let mut links = HashMap::new();

        for item in self.entries.scan_prefix(prefix.as_bytes()) {
            let (_, bytes) = item?;
            let entry: LogEntry = decode(&bytes)?;
            links.insert(sha256::digest(&bytes.to_vec()), entry.prev_hash);
        }

        let mut cursor = self
            .heads
            .get(package_id.as_bytes())?
            .map(|h| String::from_utf8_lossy(&h).into_owned())
            .unwrap_or_default();
        let mut walked = 0;
        while !cursor.is_empty() {
            let Some(prev) = links.get(&cursor) else {
                tracing::warn!(%package_id, "audit chain link broken");
                return Ok(false);
            };
            walked += 1;
            if walked > links.len() {
                return Ok(false);
            }
            cursor = prev.clone();
        }
        Ok(walked == links.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn chain_links_entries_per_package() {
        let dir = tempdir().unwrap();
        let db = sled::open(dir.path().join("audit.db")).unwrap();
        let log = AuditLog::open(&db).unwrap();
        let now = TimeStamp::new();

        for _ in 0..3 {
            log.append(&LogEntry::new("pkg_a", Action::Verify, ActorType::Staff, Some("s1"), now))
                .unwrap();
        }
        log.append(&LogEntry::new("pkg_b", Action::Generate, ActorType::System, None, now))
            .unwrap();

        let a = log.entries_for("pkg_a").unwrap();
        assert_eq!(a.len(), 3);
        assert!(a[0].prev_hash.is_empty());
        assert!(!a[1].prev_hash.is_empty());
        assert!(log.chain_intact("pkg_a").unwrap());

        let b = log.entries_for("pkg_b").unwrap();
        assert_eq!(b.len(), 1);
        assert!(b[0].prev_hash.is_empty());
    }

    #[test]
    fn edited_entry_breaks_the_chain() {
        let dir = tempdir().unwrap();
        let db = sled::open(dir.path().join("audit.db")).unwrap();
        let log = AuditLog::open(&db).unwrap();
        let now = TimeStamp::new();

        let first = LogEntry::new("pkg_a", Action::Verify, ActorType::Staff, Some("s1"), now)
            .failed(CodeError::InvalidCode);
        log.append(&first).unwrap();
        log.append(&LogEntry::new("pkg_a", Action::Verify, ActorType::Staff, Some("s1"), now))
            .unwrap();

        // rewrite the first entry as a success behind the log's back
        let entries = db.open_tree(ENTRIES_TREE).unwrap();
        let key = owned_key("pkg_a", &first.entry_id);
        let mut forged = log.entries_for("pkg_a").unwrap().remove(0);
        forged.outcome = Outcome::Success;
        forged.reason = None;
        entries.insert(key.as_bytes(), encode(&forged).unwrap()).unwrap();

        assert!(!log.chain_intact("pkg_a").unwrap());
    }

    #[test]
    fn ids_sharing_a_prefix_keep_separate_chains() {
        let dir = tempdir().unwrap();
        let db = sled::open(dir.path().join("audit.db")).unwrap();
        let log = AuditLog::open(&db).unwrap();
        let now = TimeStamp::new();

        log.append(&LogEntry::new("pkg_a", Action::Generate, ActorType::System, None, now))
            .unwrap();
        log.append(&LogEntry::new("pkg_a/x", Action::Verify, ActorType::Customer, Some("x"), now))
            .unwrap();

        assert_eq!(log.entries_for("pkg_a").unwrap().len(), 1);
        assert_eq!(log.entries_for("pkg_a/x").unwrap().len(), 1);
        assert!(log.chain_intact("pkg_a").unwrap());
        assert!(log.chain_intact("pkg_a/x").unwrap());
    }
}
