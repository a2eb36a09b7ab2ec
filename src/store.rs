//! Sled-backed package directory and code store.
//!
//! Every write to a package or shipment row goes through [`mutate`]: read the
//! current bytes, decide on a change, then `compare_and_swap` against the
//! bytes that were read. A lost race re-reads and decides again, so each
//! conditional update ("only if no active code", "only if unused") holds
//! atomically per row without a separate lock.
use chrono::{Duration, Utc};
use subtle::ConstantTimeEq;

use crate::config::CodePolicy;
use crate::error::StoreError;
use crate::lockout::{self, FailureOutcome};
use crate::model::{CodeRecord, CodeState, Package, PackageStatus, Shipment, ShipmentStatus, TimeStamp};
use crate::utils::{owned_key, owner_prefix};

const PACKAGES_TREE: &str = "packages";
const SHIPMENTS_TREE: &str = "shipments";
// "sha256(shipment_id)/<package_id>" -> ()
const SHIPMENT_PACKAGES_TREE: &str = "shipment_packages";
// "sha256(recipient_id)/<package_id>" -> ()
const RECIPIENT_PACKAGES_TREE: &str = "recipient_packages";
// fingerprint -> Reservation
const CODE_INDEX_TREE: &str = "code_index";

pub(crate) fn encode<R: minicbor::Encode<()>>(record: &R) -> Result<Vec<u8>, StoreError> {
    minicbor::to_vec(record).map_err(|e| StoreError::Encode(e.to_string()))
}

pub(crate) fn decode<R>(bytes: &[u8]) -> Result<R, StoreError>
where
    R: for<'b> minicbor::Decode<'b, ()>,
{
    Ok(minicbor::decode(bytes)?)
}

/// What a mutation closure decided to do with the row it was handed.
enum Mutation<T> {
    Write(T),
    Keep(T),
}

/// Conditional single-row update. `None` when the key does not exist.
fn mutate<R, T, F>(tree: &sled::Tree, key: &[u8], mut apply: F) -> Result<Option<T>, StoreError>
where
    R: minicbor::Encode<()> + for<'b> minicbor::Decode<'b, ()>,
    F: FnMut(&mut R) -> Mutation<T>,
{
    loop {
        let Some(current) = tree.get(key)? else {
            return Ok(None);
        };
        let mut record: R = decode(&current)?;

        match apply(&mut record) {
            Mutation::Keep(out) => return Ok(Some(out)),
            Mutation::Write(out) => {
                let next = encode(&record)?;
                match tree.compare_and_swap(key, Some(&current), Some(next))? {
                    Ok(()) => return Ok(Some(out)),
                    Err(_) => {
                        tracing::debug!(key = %String::from_utf8_lossy(key), "row changed underneath, retrying");
                    }
                }
            }
        }
    }
}

#[derive(Debug, minicbor::Encode, minicbor::Decode)]
struct Reservation {
    #[n(0)]
    package_id: String,
    #[n(1)]
    reserved_at: TimeStamp<Utc>,
}

/// Result of the atomic "mark used" update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkUsed {
    Marked(Box<Package>),
    AlreadyUsed,
    Locked,
    Expired,
    /// The code on the row is no longer the one that was checked.
    Superseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    Replaced,
    AlreadyUsed,
}

#[derive(Clone)]
pub struct PackageStore {
    packages: sled::Tree,
    shipments: sled::Tree,
    shipment_packages: sled::Tree,
    recipient_packages: sled::Tree,
    code_index: sled::Tree,
}

impl std::fmt::Debug for PackageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageStore")
            .field("packages", &self.packages.len())
            .field("shipments", &self.shipments.len())
            .finish()
    }
}

impl PackageStore {
    pub fn open(db: &sled::Db) -> Result<Self, StoreError> {
        Ok(Self {
            packages: db.open_tree(PACKAGES_TREE)?,
            shipments: db.open_tree(SHIPMENTS_TREE)?,
            shipment_packages: db.open_tree(SHIPMENT_PACKAGES_TREE)?,
            recipient_packages: db.open_tree(RECIPIENT_PACKAGES_TREE)?,
            code_index: db.open_tree(CODE_INDEX_TREE)?,
        })
    }

    // ========= Directory =========

    pub fn insert_package(&self, package: &Package) -> Result<(), StoreError> {
        self.packages
            .insert(package.package_id.as_bytes(), encode(package)?)?;
        self.recipient_packages.insert(
            owned_key(&package.recipient_id, &package.package_id).as_bytes(),
            &[] as &[u8],
        )?;
        if let Some(shipment_id) = &package.shipment_id {
            self.shipment_packages.insert(
                owned_key(shipment_id, &package.package_id).as_bytes(),
                &[] as &[u8],
            )?;
        }
        Ok(())
    }

    pub fn insert_shipment(&self, shipment: &Shipment) -> Result<(), StoreError> {
        self.shipments
            .insert(shipment.shipment_id.as_bytes(), encode(shipment)?)?;
        Ok(())
    }

    pub fn package(&self, package_id: &str) -> Result<Option<Package>, StoreError> {
        self.packages
            .get(package_id.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn shipment(&self, shipment_id: &str) -> Result<Option<Shipment>, StoreError> {
        self.shipments
            .get(shipment_id.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn packages_in_shipment(&self, shipment_id: &str) -> Result<Vec<Package>, StoreError> {
        self.indexed_packages(&self.shipment_packages, shipment_id, |p| {
            p.shipment_id.as_deref() == Some(shipment_id)
        })
    }

    pub fn packages_for_recipient(&self, recipient_id: &str) -> Result<Vec<Package>, StoreError> {
        self.indexed_packages(&self.recipient_packages, recipient_id, |p| {
            p.recipient_id == recipient_id
        })
    }

    /// Load the packages an index lists under `owner`. Entries left behind
    /// by a package that has since moved owner are skipped.
    fn indexed_packages<F>(
        &self,
        index: &sled::Tree,
        owner: &str,
        belongs: F,
    ) -> Result<Vec<Package>, StoreError>
    where
        F: Fn(&Package) -> bool,
    {
        let prefix = owner_prefix(owner);
        let mut packages = Vec::new();
        for entry in index.scan_prefix(prefix.as_bytes()) {
            let (key, _) = entry?;
            let package_id = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
            match self.package(&package_id)? {
                Some(package) if belongs(&package) => packages.push(package),
                Some(_) => {}
                None => tracing::warn!(%owner, %package_id, "index points at a missing package"),
            }
        }
        Ok(packages)
    }

    /// Move a shipment to `status`, returning the status it had before.
    pub fn transition_shipment(
        &self,
        shipment_id: &str,
        status: ShipmentStatus,
    ) -> Result<Option<ShipmentStatus>, StoreError> {
        mutate(&self.shipments, shipment_id.as_bytes(), |shipment: &mut Shipment| {
            let previous = shipment.status;
            if previous == status {
                return Mutation::Keep(previous);
            }
            shipment.status = status;
            Mutation::Write(previous)
        })
    }

    /// Mark the shipment delivered once every package in it is delivered.
    ///
    /// Safe to call redundantly: returns `true` only to the caller whose
    /// write actually moved the shipment.
    pub fn promote_shipment_if_complete(&self, shipment_id: &str) -> Result<bool, StoreError> {
        let siblings = self.packages_in_shipment(shipment_id)?;
        if siblings.is_empty() || !siblings.iter().all(Package::is_delivered) {
            return Ok(false);
        }

        let promoted = mutate(&self.shipments, shipment_id.as_bytes(), |shipment: &mut Shipment| {
            if shipment.status == ShipmentStatus::Delivered {
                return Mutation::Keep(false);
            }
            shipment.status = ShipmentStatus::Delivered;
            Mutation::Write(true)
        })?;
        Ok(promoted.unwrap_or(false))
    }

    // ========= Code store =========

    /// Write a fresh code unless the package already holds an active one,
    /// has been used, or is delivered.
    pub fn set_code(
        &self,
        package_id: &str,
        record: &CodeRecord,
        now: &TimeStamp<Utc>,
    ) -> Result<bool, StoreError> {
        let written = mutate(&self.packages, package_id.as_bytes(), |package: &mut Package| {
            if package.is_delivered()
                || package.code.used_at.is_some()
                || package.has_active_code(now)
            {
                return Mutation::Keep(false);
            }
            package.code = fresh_state(record);
            Mutation::Write(true)
        })?;
        Ok(written.unwrap_or(false))
    }

    /// Overwrite whatever code the package holds. Used codes stay used.
    pub fn replace_code(
        &self,
        package_id: &str,
        record: &CodeRecord,
    ) -> Result<Option<ReplaceOutcome>, StoreError> {
        mutate(&self.packages, package_id.as_bytes(), |package: &mut Package| {
            if package.is_delivered() || package.code.used_at.is_some() {
                return Mutation::Keep(ReplaceOutcome::AlreadyUsed);
            }
            package.code = fresh_state(record);
            Mutation::Write(ReplaceOutcome::Replaced)
        })
    }

    /// Reset the counter once a lockout has run out. A lock still in force is
    /// left alone.
    pub fn clear_failures(&self, package_id: &str, now: &TimeStamp<Utc>) -> Result<bool, StoreError> {
        let cleared = mutate(&self.packages, package_id.as_bytes(), |package: &mut Package| {
            if lockout::is_locked(package.code.locked_until.as_ref(), now) {
                return Mutation::Keep(false);
            }
            if package.code.failed_attempts == 0 && package.code.locked_until.is_none() {
                return Mutation::Keep(false);
            }
            package.code.failed_attempts = 0;
            package.code.locked_until = None;
            Mutation::Write(true)
        })?;
        Ok(cleared.unwrap_or(false))
    }

    /// Atomically count a failed attempt, locking the package when the
    /// threshold is reached. A package that is already locked is not counted
    /// again.
    pub fn increment_failure(
        &self,
        package_id: &str,
        now: &TimeStamp<Utc>,
        policy: &CodePolicy,
    ) -> Result<Option<FailureOutcome>, StoreError> {
        mutate(&self.packages, package_id.as_bytes(), |package: &mut Package| {
            let code = &mut package.code;
            if lockout::is_locked(code.locked_until.as_ref(), now) {
                return Mutation::Keep(FailureOutcome {
                    failed_attempts: code.failed_attempts,
                    locked_until: code.locked_until,
                    newly_locked: false,
                });
            }
            let outcome =
                lockout::register_failure(code.failed_attempts, code.locked_until.as_ref(), now, policy);
            code.failed_attempts = outcome.failed_attempts;
            code.locked_until = outcome.locked_until;
            Mutation::Write(outcome)
        })
    }

    /// Consume the code and deliver the package, but only if the row still
    /// holds `expected_hash`, unused, unlocked and unexpired.
    pub fn mark_used(
        &self,
        package_id: &str,
        expected_hash: &str,
        actor: &str,
        now: &TimeStamp<Utc>,
    ) -> Result<Option<MarkUsed>, StoreError> {
        mutate(&self.packages, package_id.as_bytes(), |package: &mut Package| {
            let code = &package.code;
            if code.used_at.is_some() || package.status == PackageStatus::Delivered {
                return Mutation::Keep(MarkUsed::AlreadyUsed);
            }
            if lockout::is_locked(code.locked_until.as_ref(), now) {
                return Mutation::Keep(MarkUsed::Locked);
            }
            if code.code_hash.as_deref() != Some(expected_hash) {
                return Mutation::Keep(MarkUsed::Superseded);
            }
            if !code.expires_at.as_ref().is_some_and(|exp| exp > now) {
                return Mutation::Keep(MarkUsed::Expired);
            }

            package.status = PackageStatus::Delivered;
            package.code.used_at = Some(*now);
            package.code.used_by = Some(actor.to_string());
            package.code.failed_attempts = 0;
            package.code.locked_until = None;
            Mutation::Write(MarkUsed::Marked(Box::new(package.clone())))
        })
    }

    /// Claim `fingerprint` for `package_id` in the uniqueness index.
    ///
    /// Returns `false` when another live code already holds the value. An
    /// entry is live while its owner still carries that fingerprint on an
    /// active code, or while the reservation is younger than `grace` (the
    /// owner may not have written its code yet).
    pub fn reserve_fingerprint(
        &self,
        fingerprint: &str,
        package_id: &str,
        now: &TimeStamp<Utc>,
        grace: Duration,
    ) -> Result<bool, StoreError> {
        let key = fingerprint.as_bytes();
        loop {
            let current = self.code_index.get(key)?;
            if let Some(bytes) = &current {
                let held: Reservation = decode(bytes)?;
                if self.reservation_live(&held, fingerprint, now, grace)? {
                    return Ok(false);
                }
            }

            let next = encode(&Reservation {
                package_id: package_id.to_string(),
                reserved_at: *now,
            })?;
            match self.code_index.compare_and_swap(key, current.as_ref(), Some(next))? {
                Ok(()) => return Ok(true),
                Err(_) => tracing::debug!("fingerprint reservation raced, retrying"),
            }
        }
    }

    fn reservation_live(
        &self,
        held: &Reservation,
        fingerprint: &str,
        now: &TimeStamp<Utc>,
        grace: Duration,
    ) -> Result<bool, StoreError> {
        if held.reserved_at.plus(grace) > *now {
            return Ok(true);
        }
        let Some(owner) = self.package(&held.package_id)? else {
            return Ok(false);
        };
        let same_value = owner
            .code
            .fingerprint
            .as_deref()
            .is_some_and(|fp| bool::from(fp.as_bytes().ct_eq(fingerprint.as_bytes())));
        Ok(same_value && owner.has_active_code(now))
    }
}

fn fresh_state(record: &CodeRecord) -> CodeState {
    CodeState {
        code_hash: Some(record.code_hash.clone()),
        fingerprint: Some(record.fingerprint.clone()),
        generated_at: Some(record.generated_at),
        expires_at: Some(record.expires_at),
        used_at: None,
        used_by: None,
        failed_attempts: 0,
        locked_until: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store() -> (tempfile::TempDir, PackageStore) {
        let dir = tempdir().unwrap();
        let db = sled::open(dir.path().join("store.db")).unwrap();
        let store = PackageStore::open(&db).unwrap();
        (dir, store)
    }

    fn record(now: TimeStamp<Utc>, hash: &str, fp: &str) -> CodeRecord {
        CodeRecord {
            code_hash: hash.to_string(),
            fingerprint: fp.to_string(),
            generated_at: now,
            expires_at: now.plus(Duration::days(30)),
        }
    }

    #[test]
    fn set_code_refuses_a_second_active_code() {
        let (_dir, store) = open_store();
        let now = TimeStamp::new_with(2026, 4, 1, 8, 0, 0);
        let pkg = Package::new("TRK-1", "user_a", "VC-001").unwrap();
        store.insert_package(&pkg).unwrap();

        assert!(store.set_code(&pkg.package_id, &record(now, "h1", "f1"), &now).unwrap());
        assert!(!store.set_code(&pkg.package_id, &record(now, "h2", "f2"), &now).unwrap());

        let later = now.plus(Duration::days(31));
        assert!(store.set_code(&pkg.package_id, &record(later, "h3", "f3"), &later).unwrap());
        let stored = store.package(&pkg.package_id).unwrap().unwrap();
        assert_eq!(stored.code.code_hash.as_deref(), Some("h3"));
    }

    #[test]
    fn indexes_list_only_their_owner() {
        let (_dir, store) = open_store();
        let shipment = Shipment::new("REF-1").unwrap();
        let lookalike = format!("{}/x", shipment.shipment_id);

        let mine = Package::new("TRK-1", "user_a", "VC-001")
            .unwrap()
            .set_shipment(&shipment.shipment_id);
        let nested = Package::new("TRK-2", "user_a/x", "VC-002")
            .unwrap()
            .set_shipment(&lookalike);
        store.insert_package(&mine).unwrap();
        store.insert_package(&nested).unwrap();

        let in_shipment = store.packages_in_shipment(&shipment.shipment_id).unwrap();
        assert_eq!(in_shipment.len(), 1);
        assert_eq!(in_shipment[0].package_id, mine.package_id);

        let for_recipient = store.packages_for_recipient("user_a").unwrap();
        assert_eq!(for_recipient.len(), 1);
        assert_eq!(for_recipient[0].package_id, mine.package_id);
        assert!(store.packages_for_recipient("user_b").unwrap().is_empty());
    }

    #[test]
    fn missing_rows_are_reported_as_none() {
        let (_dir, store) = open_store();
        let now = TimeStamp::new();

        assert!(store.package("pkg_nope").unwrap().is_none());
        assert!(!store.set_code("pkg_nope", &record(now, "h", "f"), &now).unwrap());
        assert!(store.mark_used("pkg_nope", "h", "staff", &now).unwrap().is_none());
        assert!(store.transition_shipment("shp_nope", ShipmentStatus::Arrived).unwrap().is_none());
    }

    #[test]
    fn mark_used_is_write_once() {
        let (_dir, store) = open_store();
        let now = TimeStamp::new_with(2026, 4, 1, 8, 0, 0);
        let pkg = Package::new("TRK-2", "user_a", "VC-001").unwrap();
        store.insert_package(&pkg).unwrap();
        store.set_code(&pkg.package_id, &record(now, "h1", "f1"), &now).unwrap();

        let first = store.mark_used(&pkg.package_id, "h1", "staff_1", &now).unwrap();
        assert!(matches!(first, Some(MarkUsed::Marked(_))));

        let second = store.mark_used(&pkg.package_id, "h1", "staff_2", &now).unwrap();
        assert_eq!(second, Some(MarkUsed::AlreadyUsed));

        let stored = store.package(&pkg.package_id).unwrap().unwrap();
        assert_eq!(stored.code.used_by.as_deref(), Some("staff_1"));
        assert_eq!(stored.status, PackageStatus::Delivered);
        assert_eq!(
            store.replace_code(&pkg.package_id, &record(now, "h9", "f9")).unwrap(),
            Some(ReplaceOutcome::AlreadyUsed)
        );
    }

    #[test]
    fn mark_used_rejects_a_superseded_hash() {
        let (_dir, store) = open_store();
        let now = TimeStamp::new_with(2026, 4, 1, 8, 0, 0);
        let pkg = Package::new("TRK-3", "user_a", "VC-001").unwrap();
        store.insert_package(&pkg).unwrap();
        store.set_code(&pkg.package_id, &record(now, "h1", "f1"), &now).unwrap();
        store.replace_code(&pkg.package_id, &record(now, "h2", "f2")).unwrap();

        assert_eq!(
            store.mark_used(&pkg.package_id, "h1", "staff", &now).unwrap(),
            Some(MarkUsed::Superseded)
        );
    }

    #[test]
    fn reservations_block_until_stale() {
        let (_dir, store) = open_store();
        let now = TimeStamp::new_with(2026, 4, 1, 8, 0, 0);
        let grace = Duration::seconds(60);
        let a = Package::new("TRK-A", "user_a", "VC-001").unwrap();
        let b = Package::new("TRK-B", "user_b", "VC-002").unwrap();
        store.insert_package(&a).unwrap();
        store.insert_package(&b).unwrap();

        assert!(store.reserve_fingerprint("fp", &a.package_id, &now, grace).unwrap());
        // a's pending reservation blocks b
        assert!(!store.reserve_fingerprint("fp", &b.package_id, &now, grace).unwrap());

        // a never wrote its code, so after the grace period the slot is free
        let later = now.plus(Duration::seconds(61));
        assert!(store.reserve_fingerprint("fp", &b.package_id, &later, grace).unwrap());

        // once b holds an active code under that fingerprint it stays blocked
        store.set_code(&b.package_id, &record(later, "hb", "fp"), &later).unwrap();
        let much_later = later.plus(Duration::days(1));
        assert!(!store.reserve_fingerprint("fp", &a.package_id, &much_later, grace).unwrap());
    }
}
