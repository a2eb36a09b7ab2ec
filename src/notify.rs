//! Hand-off of freshly issued plaintext codes to the outside world.
use chrono::Utc;
use parking_lot::Mutex;

use crate::code::PlainCode;
use crate::model::TimeStamp;

/// The only place a plaintext code leaves the crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeNotice {
    pub recipient_id: String,
    pub package_id: String,
    pub code: PlainCode,
    pub expires_at: TimeStamp<Utc>,
}

pub trait NotificationDispatcher: Send + Sync {
    fn dispatch(&self, notice: &CodeNotice) -> anyhow::Result<()>;
}

/// Keeps every notice in memory.
#[derive(Debug, Default)]
pub struct MemoryDispatcher {
    sent: Mutex<Vec<CodeNotice>>,
}

impl MemoryDispatcher {
    pub fn new() -> Self {
        Self::default()
    }
    /// Drain the notices collected so far.
    pub fn take(&self) -> Vec<CodeNotice> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl NotificationDispatcher for MemoryDispatcher {
    fn dispatch(&self, notice: &CodeNotice) -> anyhow::Result<()> {
        self.sent.lock().push(notice.clone());
        Ok(())
    }
}
