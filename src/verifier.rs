//! Counter-side verification of a pickup code.
//!
//! Checks run in a fixed order and stop at the first failure:
//!
//! 1. caller is staff or admin
//! 2. package exists
//! 3. package is not locked out
//! 4. claimed suite matches the package owner
//! 5. a code has been issued
//! 6. the code has not expired
//! 7. the code has not been used
//! 8. the code matches the stored hash
//!
//! Failures at 4 and 8 count towards the lockout threshold. Every attempt
//! writes exactly one audit entry; the attempted code itself is never
//! recorded.
use std::sync::Arc;

use chrono::Utc;

use crate::audit::{Action, AuditLog, LogEntry};
use crate::authority::{Role, actor_type_of};
use crate::clock::Clock;
use crate::code::{CodeHasher, PlainCode};
use crate::config::CodePolicy;
use crate::error::CodeError;
use crate::lockout;
use crate::model::{Package, PackageStatus, TimeStamp};
use crate::store::{MarkUsed, PackageStore};
use crate::utils::normalise_suite;

/// What the counter is shown about a released package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageInfo {
    pub package_id: String,
    pub tracking_number: String,
    pub shipment_id: Option<String>,
    pub suite: String,
    pub status: PackageStatus,
    pub delivered_at: Option<TimeStamp<Utc>>,
}

impl From<&Package> for PackageInfo {
    fn from(package: &Package) -> Self {
        Self {
            package_id: package.package_id.clone(),
            tracking_number: package.tracking_number.clone(),
            shipment_id: package.shipment_id.clone(),
            suite: package.suite.clone(),
            status: package.status,
            delivered_at: package.code.used_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    pub verified: bool,
    pub reason: Option<CodeError>,
    /// Only present on success.
    pub package: Option<PackageInfo>,
    /// This verification completed the shipment and promoted it to delivered.
    pub shipment_delivered: bool,
}

impl VerificationResult {
    fn verified(package: PackageInfo, shipment_delivered: bool) -> Self {
        Self {
            verified: true,
            reason: None,
            package: Some(package),
            shipment_delivered,
        }
    }
    fn rejected(reason: CodeError) -> Self {
        Self {
            verified: false,
            reason: Some(reason),
            package: None,
            shipment_delivered: false,
        }
    }
}

pub struct Verifier {
    store: PackageStore,
    audit: AuditLog,
    hasher: Arc<CodeHasher>,
    policy: CodePolicy,
    clock: Arc<dyn Clock>,
}

impl Verifier {
    pub fn new(
        store: PackageStore,
        audit: AuditLog,
        hasher: Arc<CodeHasher>,
        policy: &CodePolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            audit,
            hasher,
            policy: policy.clone(),
            clock,
        }
    }

    pub fn verify(
        &self,
        package_id: &str,
        claimed_suite: &str,
        candidate: &str,
        staff_id: &str,
        role: Option<Role>,
        source_ip: Option<&str>,
    ) -> VerificationResult {
        let now = self.clock.now();
        let mut entry = LogEntry::new(
            package_id,
            Action::Verify,
            actor_type_of(role),
            Some(staff_id),
            now,
        )
        .set_source_ip(source_ip);

        match self.check(package_id, claimed_suite, candidate, staff_id, role, &now, &mut entry) {
            Ok(package) => {
                self.audit.record(entry);
                tracing::info!(%package_id, %staff_id, "package released against pickup code");

                let shipment_delivered = package
                    .shipment_id
                    .as_deref()
                    .is_some_and(|shipment_id| self.cascade(shipment_id));
                VerificationResult::verified(PackageInfo::from(&package), shipment_delivered)
            }
            Err(reason) => {
                tracing::debug!(%package_id, %staff_id, reason = reason.as_str(), "pickup code rejected");
                self.audit.record(entry.failed(reason));
                VerificationResult::rejected(reason)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn check(
        &self,
        package_id: &str,
        claimed_suite: &str,
        candidate: &str,
        staff_id: &str,
        role: Option<Role>,
        now: &TimeStamp<Utc>,
        entry: &mut LogEntry,
    ) -> Result<Package, CodeError> {
        if !role.is_some_and(|r| r.can_verify()) {
            return Err(CodeError::PermissionDenied);
        }

        let package = self.store.package(package_id)?.ok_or(CodeError::NotFound)?;
        entry.shipment_id = package.shipment_id.clone();

        let locked_until = package.code.locked_until.as_ref();
        if lockout::is_locked(locked_until, now) {
            if let Some(until) = locked_until {
                entry.note("locked_until", until);
            }
            return Err(CodeError::Locked);
        }
        if lockout::lock_elapsed(locked_until, now) {
            self.store.clear_failures(package_id, now)?;
        }

        if normalise_suite(claimed_suite) != normalise_suite(&package.suite) {
            return Err(self.counted_failure(package_id, now, entry, CodeError::IdentityMismatch));
        }

        let Some(expected_hash) = package.code.code_hash.as_deref() else {
            return Err(CodeError::NoCodeIssued);
        };
        if !package.code.expires_at.as_ref().is_some_and(|exp| exp > now) {
            return Err(CodeError::Expired);
        }
        if package.code.used_at.is_some() {
            return Err(CodeError::AlreadyUsed);
        }

        let matches = candidate
            .parse::<PlainCode>()
            .is_ok_and(|code| self.hasher.verify(&code, expected_hash));
        if !matches {
            entry.note("code_match", false);
            return Err(self.counted_failure(package_id, now, entry, CodeError::InvalidCode));
        }

        match self.store.mark_used(package_id, expected_hash, staff_id, now)? {
            Some(MarkUsed::Marked(package)) => Ok(*package),
            Some(MarkUsed::AlreadyUsed) => Err(CodeError::AlreadyUsed),
            Some(MarkUsed::Locked) => Err(CodeError::Locked),
            Some(MarkUsed::Expired) => Err(CodeError::Expired),
            // regenerated between the hash check and the write
            Some(MarkUsed::Superseded) => Err(CodeError::InvalidCode),
            None => Err(CodeError::NotFound),
        }
    }

    /// Count a failure against the package and return the reason to report.
    fn counted_failure(
        &self,
        package_id: &str,
        now: &TimeStamp<Utc>,
        entry: &mut LogEntry,
        reason: CodeError,
    ) -> CodeError {
        match self.store.increment_failure(package_id, now, &self.policy) {
            Ok(Some(outcome)) => {
                entry.note("failed_attempts", outcome.failed_attempts);
                if let Some(until) = outcome.locked_until {
                    entry.note("locked_until", until);
                }
                if outcome.newly_locked {
                    tracing::warn!(
                        %package_id,
                        failed_attempts = outcome.failed_attempts,
                        "package locked after repeated failed pickup attempts"
                    );
                } else if lockout::is_locked(outcome.locked_until.as_ref(), now) {
                    // another attempt locked the row after it was read
                    return CodeError::Locked;
                }
                reason
            }
            Ok(None) => CodeError::NotFound,
            Err(e) => e.into(),
        }
    }

    fn cascade(&self, shipment_id: &str) -> bool {
        match self.store.promote_shipment_if_complete(shipment_id) {
            Ok(promoted) => {
                if promoted {
                    tracing::info!(%shipment_id, "all packages collected, shipment delivered");
                }
                promoted
            }
            Err(e) => {
                // the package itself stays delivered; the next release in the
                // shipment retries the promotion
                tracing::error!(%shipment_id, error = %e, "failed to evaluate shipment delivery");
                false
            }
        }
    }
}
