//! The single time source used for every expiry and lockout comparison.
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::model::TimeStamp;

pub trait Clock: Send + Sync {
    fn now(&self) -> TimeStamp<Utc>;
}

/// Server wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> TimeStamp<Utc> {
        TimeStamp::new()
    }
}

/// A clock that only moves when told to. Lets lockout and expiry windows be
/// exercised without sleeping.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: TimeStamp<Utc>) -> Self {
        Self {
            now: Mutex::new(start.to_datetime_utc()),
        }
    }
    pub fn advance(&self, span: Duration) {
        let mut now = self.now.lock();
        *now += span;
    }
    pub fn set(&self, at: TimeStamp<Utc>) {
        *self.now.lock() = at.to_datetime_utc();
    }
}

impl Clock for ManualClock {
    fn now(&self) -> TimeStamp<Utc> {
        (*self.now.lock()).into()
    }
}
