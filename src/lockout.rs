//! Pure lockout rules over a package's failure counter.
use chrono::Utc;

use crate::config::CodePolicy;
use crate::model::TimeStamp;

/// Counter state after a failure has been recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    pub failed_attempts: u32,
    pub locked_until: Option<TimeStamp<Utc>>,
    /// True when this failure is the one that tripped the lock.
    pub newly_locked: bool,
}

pub fn is_locked(locked_until: Option<&TimeStamp<Utc>>, now: &TimeStamp<Utc>) -> bool {
    locked_until.is_some_and(|until| until > now)
}

/// A lock was set and its window has passed.
pub fn lock_elapsed(locked_until: Option<&TimeStamp<Utc>>, now: &TimeStamp<Utc>) -> bool {
    locked_until.is_some_and(|until| until <= now)
}

/// Count one more failure on top of `failed_attempts`.
///
/// A lock whose window already elapsed restarts the count from zero, so a
/// recipient gets a fresh set of attempts after waiting out a lockout.
/// Callers must not call this while [`is_locked`] holds.
pub fn register_failure(
    failed_attempts: u32,
    locked_until: Option<&TimeStamp<Utc>>,
    now: &TimeStamp<Utc>,
    policy: &CodePolicy,
) -> FailureOutcome {
    let base = if lock_elapsed(locked_until, now) {
        0
    } else {
        failed_attempts
    };
    let failed_attempts = base.saturating_add(1);

    if failed_attempts >= policy.lockout_threshold {
        FailureOutcome {
            failed_attempts,
            locked_until: Some(now.plus(policy.lockout_duration())),
            newly_locked: true,
        }
    } else {
        FailureOutcome {
            failed_attempts,
            locked_until: None,
            newly_locked: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn fifth_failure_locks_for_the_window() {
        let policy = CodePolicy::default();
        let now = TimeStamp::new_with(2026, 5, 1, 9, 0, 0);

        let fourth = register_failure(3, None, &now, &policy);
        assert_eq!(fourth.failed_attempts, 4);
        assert!(fourth.locked_until.is_none());

        let fifth = register_failure(4, None, &now, &policy);
        assert_eq!(fifth.failed_attempts, 5);
        assert!(fifth.newly_locked);
        assert_eq!(fifth.locked_until, Some(now.plus(Duration::minutes(30))));
        assert!(is_locked(fifth.locked_until.as_ref(), &now));
    }

    #[test]
    fn elapsed_lock_restarts_the_count() {
        let policy = CodePolicy::default();
        let now = TimeStamp::new_with(2026, 5, 1, 9, 0, 0);
        let old_lock = now.plus(Duration::minutes(-1));

        assert!(!is_locked(Some(&old_lock), &now));
        assert!(lock_elapsed(Some(&old_lock), &now));

        let next = register_failure(5, Some(&old_lock), &now, &policy);
        assert_eq!(next.failed_attempts, 1);
        assert!(next.locked_until.is_none());
    }

    #[test]
    fn lock_boundary_is_exclusive() {
        let now = TimeStamp::new_with(2026, 5, 1, 9, 0, 0);
        assert!(!is_locked(Some(&now), &now));
        assert!(lock_elapsed(Some(&now), &now));
        assert!(!is_locked(None, &now));
        assert!(!lock_elapsed(None, &now));
    }
}
