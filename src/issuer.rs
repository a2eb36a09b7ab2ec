//! Code issuance: batch issuance on shipment arrival and administrative
//! regeneration.
use std::sync::Arc;

use chrono::{Duration, Utc};
use rayon::prelude::*;

use crate::audit::{Action, ActorType, AuditLog, LogEntry, Outcome};
use crate::authority::{Role, actor_type_of};
use crate::clock::Clock;
use crate::code::{CodeGenerator, CodeHasher, PlainCode};
use crate::config::CodePolicy;
use crate::error::CodeError;
use crate::model::{CodeRecord, Package, TimeStamp};
use crate::store::{PackageStore, ReplaceOutcome};

/// A plaintext code on its way to the notification dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCode {
    pub package_id: String,
    pub recipient_id: String,
    pub code: PlainCode,
    pub expires_at: TimeStamp<Utc>,
}

#[derive(Debug, Default)]
pub struct BatchResult {
    pub generated: usize,
    pub failed: usize,
    /// Packages another issuer got to first.
    pub skipped: usize,
    pub codes: Vec<IssuedCode>,
}

enum Issue {
    Issued(IssuedCode),
    Skipped,
    Failed(CodeError),
}

pub struct CodeIssuer {
    store: PackageStore,
    audit: AuditLog,
    hasher: Arc<CodeHasher>,
    generator: CodeGenerator,
    policy: CodePolicy,
    clock: Arc<dyn Clock>,
    pool: rayon::ThreadPool,
}

impl CodeIssuer {
    pub fn new(
        store: PackageStore,
        audit: AuditLog,
        hasher: Arc<CodeHasher>,
        policy: &CodePolicy,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(policy.batch_parallelism)
            .thread_name(|i| format!("code-issuer-{i}"))
            .build()?;

        Ok(Self {
            store,
            audit,
            hasher,
            generator: CodeGenerator::new(policy),
            policy: policy.clone(),
            clock,
            pool,
        })
    }

    /// Issue a code to every undelivered package of the shipment that does not
    /// already hold an active one.
    ///
    /// Per-package failures are audited and counted; they never abort the
    /// rest of the batch.
    pub fn issue_for_shipment(
        &self,
        shipment_id: &str,
        expiry_window: Option<Duration>,
    ) -> Result<BatchResult, CodeError> {
        if self.store.shipment(shipment_id)?.is_none() {
            return Err(CodeError::NotFound);
        }
        let now = self.clock.now();
        let ttl = expiry_window.unwrap_or_else(|| self.policy.code_ttl());

        let candidates: Vec<Package> = self
            .store
            .packages_in_shipment(shipment_id)?
            .into_iter()
            .filter(|p| !p.is_delivered() && !p.has_active_code(&now))
            .collect();

        let issues: Vec<Issue> = self.pool.install(|| {
            candidates
                .par_iter()
                .map(|package| self.issue_one(package, ttl, &now))
                .collect()
        });

        let mut result = BatchResult::default();
        for issue in issues {
            match issue {
                Issue::Issued(code) => {
                    result.generated += 1;
                    result.codes.push(code);
                }
                Issue::Skipped => result.skipped += 1,
                Issue::Failed(_) => result.failed += 1,
            }
        }

        tracing::info!(
            %shipment_id,
            generated = result.generated,
            failed = result.failed,
            skipped = result.skipped,
            "issued pickup codes for shipment"
        );
        Ok(result)
    }

    fn issue_one(&self, package: &Package, ttl: Duration, now: &TimeStamp<Utc>) -> Issue {
        let entry = LogEntry::new(&package.package_id, Action::Generate, ActorType::System, None, *now)
            .set_shipment(package.shipment_id.as_deref());

        let outcome = self.draw(&package.package_id, now, ttl).and_then(|(code, record)| {
            let written = self.store.set_code(&package.package_id, &record, now)?;
            Ok(written.then(|| IssuedCode {
                package_id: package.package_id.clone(),
                recipient_id: package.recipient_id.clone(),
                code,
                expires_at: record.expires_at,
            }))
        });

        match outcome {
            Ok(Some(issued)) => {
                let mut entry = entry;
                entry.note("expires_at", issued.expires_at);
                self.audit.record(entry);
                Issue::Issued(issued)
            }
            Ok(None) => {
                tracing::debug!(package_id = %package.package_id, "package already holds an active code");
                let mut entry = entry;
                entry.outcome = Outcome::Failure;
                entry.note("skipped", "active code already issued");
                self.audit.record(entry);
                Issue::Skipped
            }
            Err(reason) => {
                tracing::warn!(package_id = %package.package_id, reason = reason.as_str(), "code issuance failed");
                self.audit.record(entry.failed(reason));
                Issue::Failed(reason)
            }
        }
    }

    /// Invalidate whatever code the package holds and issue a new one.
    pub fn regenerate(
        &self,
        package_id: &str,
        admin_id: &str,
        role: Option<Role>,
        expiry_window: Option<Duration>,
    ) -> Result<IssuedCode, CodeError> {
        let now = self.clock.now();
        let entry = LogEntry::new(
            package_id,
            Action::Regenerate,
            actor_type_of(role),
            Some(admin_id),
            now,
        );

        let package = match self.regenerate_checks(package_id, role) {
            Ok(package) => package,
            Err(reason) => {
                self.audit.record(entry.failed(reason));
                return Err(reason);
            }
        };
        let mut entry = entry.set_shipment(package.shipment_id.as_deref());
        let ttl = expiry_window.unwrap_or_else(|| self.policy.code_ttl());

        let outcome = self.draw(package_id, &now, ttl).and_then(|(code, record)| {
            match self.store.replace_code(package_id, &record)? {
                Some(ReplaceOutcome::Replaced) => Ok(IssuedCode {
                    package_id: package.package_id.clone(),
                    recipient_id: package.recipient_id.clone(),
                    code,
                    expires_at: record.expires_at,
                }),
                Some(ReplaceOutcome::AlreadyUsed) => Err(CodeError::AlreadyUsed),
                None => Err(CodeError::NotFound),
            }
        });

        match outcome {
            Ok(issued) => {
                entry.note("expires_at", issued.expires_at);
                self.audit.record(entry);
                tracing::info!(%package_id, %admin_id, "pickup code regenerated");
                Ok(issued)
            }
            Err(reason) => {
                self.audit.record(entry.failed(reason));
                Err(reason)
            }
        }
    }

    fn regenerate_checks(&self, package_id: &str, role: Option<Role>) -> Result<Package, CodeError> {
        if !role.is_some_and(|r| r.can_administer()) {
            return Err(CodeError::PermissionDenied);
        }
        let package = self.store.package(package_id)?.ok_or(CodeError::NotFound)?;
        if package.is_delivered() || package.code.used_at.is_some() {
            return Err(CodeError::AlreadyUsed);
        }
        Ok(package)
    }

    /// Draw an unused code, claim it in the uniqueness index and hash it.
    fn draw(
        &self,
        package_id: &str,
        now: &TimeStamp<Utc>,
        ttl: Duration,
    ) -> Result<(PlainCode, CodeRecord), CodeError> {
        let grace = self.policy.reservation_grace();
        let code = self.generator.generate(|candidate| {
            let fingerprint = self.hasher.fingerprint(candidate);
            let reserved = self
                .store
                .reserve_fingerprint(&fingerprint, package_id, now, grace)?;
            Ok(!reserved)
        })?;

        let record = CodeRecord {
            code_hash: self.hasher.hash(&code)?,
            fingerprint: self.hasher.fingerprint(&code),
            generated_at: *now,
            expires_at: now.plus(ttl),
        };
        Ok((code, record))
    }
}
