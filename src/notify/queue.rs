//! Per-service retry queue holding the latest undelivered state.

use super::{Channel, Notification, PendingSet};

/// Entries beyond this evict the oldest.
pub const MAX_QUEUE_ENTRIES: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedNotification {
    pub service_id: String,
    pub notification: Notification,
    pub pending: PendingSet,
    /// Monotonic ms of the last enqueue or retry.
    pub last_retry: u64,
    /// Bumped whenever the content is replaced.
    pub generation: u64,
}

/// The queue. Always holds at most one entry per service, and only entries
/// with something pending.
#[derive(Debug, Default)]
pub struct RetryQueue {
    entries: Vec<QueuedNotification>,
    next_generation: u64,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, service_id: &str) -> Option<&QueuedNotification> {
        self.entries.iter().find(|e| e.service_id == service_id)
    }

    /// Entries in insertion order.
    pub fn entries(&self) -> &[QueuedNotification] {
        &self.entries
    }

    pub fn count_pending(&self, channel: Channel) -> usize {
        self.entries.iter().filter(|e| e.pending.get(channel)).count()
    }

    /// Queue `notification` for the channels in `failed`. An existing entry for
    /// the service takes the new content and the union of both flag sets.
    pub fn enqueue(&mut self, service_id: &str, notification: Notification, failed: PendingSet, now_ms: u64) {
        self.next_generation += 1;
        let generation = self.next_generation;

        if let Some(entry) = self.entries.iter_mut().find(|e| e.service_id == service_id) {
            entry.notification = notification;
            entry.pending = entry.pending.union(failed);
            entry.last_retry = now_ms;
            entry.generation = generation;
            self.entries.retain(|e| e.pending.any());
            return;
        }

        if !failed.any() {
            return;
        }

        if self.entries.len() >= MAX_QUEUE_ENTRIES {
            let dropped = self.entries.remove(0);
            tracing::warn!(
                "Notification queue full, dropping oldest entry for {}",
                dropped.service_id
            );
        }

        self.entries.push(QueuedNotification {
            service_id: service_id.to_string(),
            notification,
            pending: failed,
            last_retry: now_ms,
            generation,
        });
    }

    /// Record a delivery on `channel` of content `generation`. Deliveries of
    /// superseded content leave the flag set. Drops the entry once nothing is
    /// pending.
    pub fn mark_delivered(&mut self, service_id: &str, generation: u64, channel: Channel) {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.service_id == service_id && e.generation == generation)
        {
            entry.pending.set(channel, false);
        }
        self.entries.retain(|e| e.pending.any());
    }

    /// Snapshot of entries owing any of `channels`.
    pub fn pending_for(&self, channels: &[Channel]) -> Vec<QueuedNotification> {
        self.entries
            .iter()
            .filter(|e| channels.iter().any(|c| e.pending.get(*c)))
            .cloned()
            .collect()
    }

    /// Like [`RetryQueue::pending_for`], but only entries whose last attempt
    /// is at least `min_age_ms` old.
    pub fn due_for(&self, channels: &[Channel], now_ms: u64, min_age_ms: u64) -> Vec<QueuedNotification> {
        self.entries
            .iter()
            .filter(|e| channels.iter().any(|c| e.pending.get(*c)))
            .filter(|e| now_ms.saturating_sub(e.last_retry) >= min_age_ms)
            .cloned()
            .collect()
    }

    pub fn touch(&mut self, service_id: &str, now_ms: u64) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.service_id == service_id) {
            entry.last_retry = now_ms;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(title: &str, is_up: bool) -> Notification {
        Notification {
            title: title.to_string(),
            message: String::new(),
            tags: String::new(),
            is_up,
        }
    }

    fn assert_invariant(queue: &RetryQueue) {
        for entry in queue.entries() {
            assert!(entry.pending.any());
        }
    }

    #[test]
    fn test_requeue_keeps_one_entry_and_unions_flags() {
        let mut queue = RetryQueue::new();
        queue.enqueue("a", note("down", false), PendingSet::default().with(Channel::Ntfy), 0);
        queue.enqueue("a", note("up", true), PendingSet::default().with(Channel::Smtp), 10);

        assert_eq!(queue.len(), 1);
        let entry = queue.get("a").unwrap();
        assert_eq!(entry.notification.title, "up");
        assert!(entry.notification.is_up);
        assert!(entry.pending.ntfy && entry.pending.smtp);
        assert!(!entry.pending.discord && !entry.pending.mesh);
        assert_invariant(&queue);
    }

    #[test]
    fn test_entry_removed_when_all_delivered() {
        let mut queue = RetryQueue::new();
        let pending = PendingSet::default().with(Channel::Ntfy).with(Channel::Mesh);
        queue.enqueue("a", note("down", false), pending, 0);
        let generation = queue.get("a").unwrap().generation;

        queue.mark_delivered("a", generation, Channel::Ntfy);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.count_pending(Channel::Mesh), 1);
        queue.mark_delivered("a", generation, Channel::Mesh);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_stale_delivery_does_not_clear() {
        let mut queue = RetryQueue::new();
        queue.enqueue("a", note("down", false), PendingSet::default().with(Channel::Discord), 0);
        let stale = queue.get("a").unwrap().generation;
        queue.enqueue("a", note("up", true), PendingSet::default(), 5);

        queue.mark_delivered("a", stale, Channel::Discord);
        assert!(queue.get("a").unwrap().pending.discord);
    }

    #[test]
    fn test_nothing_failed_creates_nothing() {
        let mut queue = RetryQueue::new();
        queue.enqueue("a", note("down", false), PendingSet::default(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let mut queue = RetryQueue::new();
        let pending = PendingSet::default().with(Channel::Ntfy);
        for i in 0..MAX_QUEUE_ENTRIES + 1 {
            queue.enqueue(&format!("s{}", i), note("down", false), pending, i as u64);
        }
        assert_eq!(queue.len(), MAX_QUEUE_ENTRIES);
        assert!(queue.get("s0").is_none());
        assert!(queue.get(&format!("s{}", MAX_QUEUE_ENTRIES)).is_some());
        assert_invariant(&queue);
    }

    #[test]
    fn test_pending_for_filters_channels() {
        let mut queue = RetryQueue::new();
        queue.enqueue("a", note("a", false), PendingSet::default().with(Channel::Mesh), 0);
        queue.enqueue("b", note("b", false), PendingSet::default().with(Channel::Smtp), 0);
        let internet = queue.pending_for(&Channel::INTERNET);
        assert_eq!(internet.len(), 1);
        assert_eq!(internet[0].service_id, "b");
        assert_eq!(queue.pending_for(&[Channel::Mesh])[0].service_id, "a");
    }

    #[test]
    fn test_due_for_waits_out_cadence_from_last_attempt() {
        let mut queue = RetryQueue::new();
        queue.enqueue("a", note("a", false), PendingSet::default().with(Channel::Ntfy), 29_900);
        assert!(queue.due_for(&Channel::INTERNET, 30_000, 30_000).is_empty());
        assert_eq!(queue.due_for(&Channel::INTERNET, 59_900, 30_000).len(), 1);

        queue.touch("a", 59_900);
        assert!(queue.due_for(&Channel::INTERNET, 60_000, 30_000).is_empty());
        assert_eq!(queue.due_for(&Channel::INTERNET, 89_900, 30_000).len(), 1);
    }
}
