//! Service layer API for pickup code operations
use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::audit::{AuditLog, LogEntry};
use crate::authority::AuthorityResolver;
use crate::clock::{Clock, SystemClock};
use crate::code::CodeHasher;
use crate::config::CodePolicy;
use crate::error::CodeError;
use crate::issuer::{BatchResult, CodeIssuer, IssuedCode};
use crate::lockout;
use crate::model::{ShipmentStatus, TimeStamp};
use crate::notify::{CodeNotice, NotificationDispatcher};
use crate::store::PackageStore;
use crate::verifier::{VerificationResult, Verifier};

/// A recipient's view of one of their live codes. The code itself is never
/// stored and so never shown here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveCode {
    pub package_id: String,
    pub tracking_number: String,
    pub shipment_id: Option<String>,
    pub generated_at: Option<TimeStamp<Utc>>,
    pub expires_at: Option<TimeStamp<Utc>>,
    pub locked: bool,
}

pub struct PickupCodeService {
    store: PackageStore,
    audit: AuditLog,
    issuer: CodeIssuer,
    verifier: Verifier,
    authority: Arc<dyn AuthorityResolver>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    clock: Arc<dyn Clock>,
}

impl PickupCodeService {
    pub fn open(
        instance: Arc<sled::Db>,
        policy: CodePolicy,
        authority: Arc<dyn AuthorityResolver>,
        dispatcher: Arc<dyn NotificationDispatcher>,
    ) -> anyhow::Result<Self> {
        Self::open_with_clock(instance, policy, authority, dispatcher, Arc::new(SystemClock))
    }

    pub fn open_with_clock(
        instance: Arc<sled::Db>,
        policy: CodePolicy,
        authority: Arc<dyn AuthorityResolver>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        policy.validate()?;
        let store = PackageStore::open(&instance)?;
        let audit = AuditLog::open(&instance)?;
        let hasher = Arc::new(CodeHasher::new(&policy)?);

        let issuer = CodeIssuer::new(
            store.clone(),
            audit.clone(),
            hasher.clone(),
            &policy,
            clock.clone(),
        )?;
        let verifier = Verifier::new(store.clone(), audit.clone(), hasher, &policy, clock.clone());

        Ok(Self {
            store,
            audit,
            issuer,
            verifier,
            authority,
            dispatcher,
            clock,
        })
    }

    /// Directory access for the surrounding application.
    pub fn store(&self) -> &PackageStore {
        &self.store
    }

    /// Record a shipment status change. Moving into `Arrived` from any other
    /// status issues codes; re-saving `Arrived` does not.
    ///
    /// `Delivered` is refused: a shipment only becomes delivered when its
    /// last package is released.
    pub fn update_shipment_status(
        &self,
        shipment_id: &str,
        status: ShipmentStatus,
    ) -> Result<Option<BatchResult>, CodeError> {
        if status == ShipmentStatus::Delivered {
            tracing::warn!(%shipment_id, "refusing to mark a shipment delivered directly");
            return Err(CodeError::PermissionDenied);
        }
        let previous = self
            .store
            .transition_shipment(shipment_id, status)?
            .ok_or(CodeError::NotFound)?;

        if status == ShipmentStatus::Arrived && previous != ShipmentStatus::Arrived {
            tracing::info!(%shipment_id, ?previous, "shipment arrived, issuing pickup codes");
            return self.issue_codes_for_shipment(shipment_id, None).map(Some);
        }
        Ok(None)
    }

    /// Issue codes for every eligible package of the shipment and hand the
    /// plaintext codes to the dispatcher.
    pub fn issue_codes_for_shipment(
        &self,
        shipment_id: &str,
        expiry_window: Option<Duration>,
    ) -> Result<BatchResult, CodeError> {
        let batch = self.issuer.issue_for_shipment(shipment_id, expiry_window)?;
        for issued in &batch.codes {
            self.dispatch(issued);
        }
        Ok(batch)
    }

    pub fn verify_code(
        &self,
        package_id: &str,
        suite: &str,
        code: &str,
        staff_id: &str,
        source_ip: Option<&str>,
    ) -> VerificationResult {
        let role = self.authority.role_of(staff_id);
        self.verifier
            .verify(package_id, suite, code, staff_id, role, source_ip)
    }

    /// Replace a lost or compromised code. Admin only.
    pub fn regenerate_code(
        &self,
        package_id: &str,
        admin_id: &str,
        expiry_window: Option<Duration>,
    ) -> Result<IssuedCode, CodeError> {
        let role = self.authority.role_of(admin_id);
        let issued = self
            .issuer
            .regenerate(package_id, admin_id, role, expiry_window)?;
        self.dispatch(&issued);
        Ok(issued)
    }

    /// Live codes held by `recipient_id`. Customers may only ask about
    /// themselves; staff and admins may ask about anyone.
    pub fn active_codes_for_recipient(
        &self,
        requester_id: &str,
        recipient_id: &str,
    ) -> Result<Vec<ActiveCode>, CodeError> {
        let privileged = self
            .authority
            .role_of(requester_id)
            .is_some_and(|r| r.can_verify());
        if requester_id != recipient_id && !privileged {
            return Err(CodeError::PermissionDenied);
        }

        let now = self.clock.now();
        let codes = self
            .store
            .packages_for_recipient(recipient_id)?
            .into_iter()
            .filter(|p| p.has_active_code(&now))
            .map(|p| ActiveCode {
                locked: lockout::is_locked(p.code.locked_until.as_ref(), &now),
                package_id: p.package_id,
                tracking_number: p.tracking_number,
                shipment_id: p.shipment_id,
                generated_at: p.code.generated_at,
                expires_at: p.code.expires_at,
            })
            .collect();
        Ok(codes)
    }

    /// Full audit history of a package. Admin only.
    pub fn verification_log(
        &self,
        package_id: &str,
        admin_id: &str,
    ) -> Result<Vec<LogEntry>, CodeError> {
        self.require_admin(admin_id)?;
        Ok(self.audit.entries_for(package_id)?)
    }

    /// Recompute the package's audit hash chain. Admin only.
    pub fn audit_chain_intact(&self, package_id: &str, admin_id: &str) -> Result<bool, CodeError> {
        self.require_admin(admin_id)?;
        Ok(self.audit.chain_intact(package_id)?)
    }

    fn require_admin(&self, actor_id: &str) -> Result<(), CodeError> {
        match self.authority.role_of(actor_id) {
            Some(role) if role.can_administer() => Ok(()),
            _ => Err(CodeError::PermissionDenied),
        }
    }

    fn dispatch(&self, issued: &IssuedCode) {
        let notice = CodeNotice {
            recipient_id: issued.recipient_id.clone(),
            package_id: issued.package_id.clone(),
            code: issued.code.clone(),
            expires_at: issued.expires_at,
        };
        if let Err(e) = self.dispatcher.dispatch(&notice) {
            tracing::error!(
                package_id = %issued.package_id,
                recipient_id = %issued.recipient_id,
                error = %e,
                "failed to hand pickup code to dispatcher"
            );
        }
    }
}
