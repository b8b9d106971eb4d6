//! Single-slot mailbox: a post overwrites, a take clears.

use parking_lot::Mutex;
use tokio::sync::Notify;

pub struct Mailbox<T> {
    slot: Mutex<Option<T>>,
    notify: Notify,
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Store `value`, returning the unread value it replaced.
    pub fn post(&self, value: T) -> Option<T> {
        let replaced = self.slot.lock().replace(value);
        self.notify.notify_one();
        replaced
    }

    pub fn take(&self) -> Option<T> {
        self.slot.lock().take()
    }

    pub fn is_pending(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Wait until something is posted. The value stays in the slot.
    pub async fn wait(&self) {
        if self.is_pending() {
            return;
        }
        self.notify.notified().await;
    }
}

/// One-off mesh message posted from the admin API.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredMessage {
    pub title: String,
    pub message: String,
}
