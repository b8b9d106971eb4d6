//! Edge fanout with a retry queue.
//!
//! Internet sinks are tried inline when Wi-Fi is up and queued otherwise.
//! The mesh sink is tried inline on dual-radio boards; on single-radio boards
//! it is always queued and flushed as one batch by the main loop, so that a
//! burst of edges costs a single Wi-Fi outage.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{Channel, MeshNotifier, Notification, Notifier, NotifyError, PendingSet, RetryQueue};
use crate::config::RadioMode;
use crate::radio::RadioArbiter;

/// Minimum gap between attempts at one queued internet delivery.
pub const INTERNET_RETRY_INTERVAL: Duration = Duration::from_secs(30);
/// Minimum gap between mesh sessions opened for queued entries.
pub const MESH_RETRY_INTERVAL: Duration = Duration::from_secs(600);

pub struct Fanout {
    sinks: Vec<Arc<dyn Notifier>>,
    mesh: Option<Arc<MeshNotifier>>,
    arbiter: Arc<RadioArbiter>,
    queue: Mutex<RetryQueue>,
    mesh_flush_requested: AtomicBool,
}

impl Fanout {
    /// `sinks` are the configured internet sinks; `mesh` the configured mesh sink.
    pub fn new(sinks: Vec<Arc<dyn Notifier>>, mesh: Option<Arc<MeshNotifier>>, arbiter: Arc<RadioArbiter>) -> Self {
        Self {
            sinks,
            mesh,
            arbiter,
            queue: Mutex::new(RetryQueue::new()),
            mesh_flush_requested: AtomicBool::new(false),
        }
    }

    pub fn mesh(&self) -> Option<&Arc<MeshNotifier>> {
        self.mesh.as_ref()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn mesh_pending(&self) -> usize {
        self.queue.lock().count_pending(Channel::Mesh)
    }

    pub fn pending_for(&self, service_id: &str) -> Option<PendingSet> {
        self.queue.lock().get(service_id).map(|e| e.pending)
    }

    /// True once, after an edge queued a mesh send that should go out soon.
    pub fn take_mesh_flush_request(&self) -> bool {
        self.mesh_flush_requested.swap(false, Ordering::SeqCst)
    }

    /// Deliver an edge notification for `service_id` to every sink.
    pub async fn dispatch(&self, service_id: &str, notification: Notification, now_ms: u64) {
        if self.sinks.is_empty() && self.mesh.is_none() {
            return;
        }

        let mut failed = PendingSet::default();
        let mut delivered = Vec::new();

        if self.arbiter.wifi_connected().await {
            for sink in &self.sinks {
                match sink.send(&notification).await {
                    Ok(()) => delivered.push(sink.channel()),
                    Err(e) => {
                        tracing::warn!("{} notification failed, queueing: {}", sink.channel(), e);
                        failed.set(sink.channel(), true);
                    }
                }
            }
        } else if !self.sinks.is_empty() {
            tracing::info!("Wi-Fi offline: queueing internet notifications");
            for sink in &self.sinks {
                failed.set(sink.channel(), true);
            }
        }

        if let Some(mesh) = &self.mesh {
            match self.arbiter.mode() {
                RadioMode::Dual => match mesh.send(&notification).await {
                    Ok(()) => delivered.push(Channel::Mesh),
                    Err(e) => {
                        tracing::warn!("mesh notification failed, queueing: {}", e);
                        failed.set(Channel::Mesh, true);
                    }
                },
                RadioMode::Single => {
                    failed.set(Channel::Mesh, true);
                    self.mesh_flush_requested.store(true, Ordering::SeqCst);
                }
            }
        }

        let mut queue = self.queue.lock();
        queue.enqueue(service_id, notification, failed, now_ms);
        if let Some(generation) = queue.get(service_id).map(|e| e.generation) {
            for channel in delivered {
                queue.mark_delivered(service_id, generation, channel);
            }
        }
    }

    /// Retry queued internet deliveries whose last attempt is at least
    /// [`INTERNET_RETRY_INTERVAL`] old. Returns how many succeeded.
    pub async fn retry_internet(&self, now_ms: u64) -> usize {
        let min_age = INTERNET_RETRY_INTERVAL.as_millis() as u64;
        let entries = self.queue.lock().due_for(&Channel::INTERNET, now_ms, min_age);
        if entries.is_empty() || !self.arbiter.wifi_connected().await {
            return 0;
        }

        let mut delivered = 0;
        for entry in entries {
            for sink in self.sinks.iter().filter(|s| entry.pending.get(s.channel())) {
                match sink.send(&entry.notification).await {
                    Ok(()) => {
                        delivered += 1;
                        self.queue
                            .lock()
                            .mark_delivered(&entry.service_id, entry.generation, sink.channel());
                    }
                    Err(e) => tracing::warn!("{} retry for {} failed: {}", sink.channel(), entry.service_id, e),
                }
            }
            self.queue.lock().touch(&entry.service_id, now_ms);
        }
        if delivered > 0 {
            tracing::info!("Retried {} queued notification(s)", delivered);
        }
        delivered
    }

    /// Once any mesh-pending entry has waited [`MESH_RETRY_INTERVAL`] since
    /// its last attempt, send every mesh-pending entry in one session.
    /// Returns how many succeeded.
    pub async fn retry_mesh(&self, now_ms: u64) -> usize {
        let min_age = MESH_RETRY_INTERVAL.as_millis() as u64;
        if self.queue.lock().due_for(&[Channel::Mesh], now_ms, min_age).is_empty() {
            return 0;
        }
        self.flush_mesh(now_ms).await
    }

    /// Send every mesh-pending entry in one session now, regardless of
    /// cadence. Returns how many succeeded.
    pub async fn flush_mesh(&self, now_ms: u64) -> usize {
        let Some(mesh) = &self.mesh else {
            return 0;
        };
        let entries = self.queue.lock().pending_for(&[Channel::Mesh]);
        if entries.is_empty() {
            return 0;
        }

        let messages: Vec<Notification> = entries.iter().map(|e| e.notification.clone()).collect();
        let results = match mesh.send_batch(&messages).await {
            Ok(results) => results,
            Err(e) => {
                tracing::warn!("Mesh retry failed, {} message(s) stay queued: {}", entries.len(), e);
                let mut queue = self.queue.lock();
                for entry in &entries {
                    queue.touch(&entry.service_id, now_ms);
                }
                return 0;
            }
        };

        let mut queue = self.queue.lock();
        let mut delivered = 0;
        for (entry, result) in entries.iter().zip(results) {
            if result.is_ok() {
                delivered += 1;
                queue.mark_delivered(&entry.service_id, entry.generation, Channel::Mesh);
            }
            queue.touch(&entry.service_id, now_ms);
        }
        delivered
    }

    /// One-off mesh message outside the queue.
    pub async fn send_mesh_direct(&self, notification: &Notification) -> Result<(), NotifyError> {
        match &self.mesh {
            Some(mesh) => mesh.send(notification).await,
            None => {
                tracing::debug!("Mesh not configured, dropping '{}'", notification.title);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::StaticLink;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Records deliveries; fails while `failing` is set.
    struct FakeSink {
        channel: Channel,
        failing: AtomicBool,
        attempts: AtomicUsize,
        sent: Mutex<Vec<Notification>>,
    }

    impl FakeSink {
        fn new(channel: Channel) -> Arc<Self> {
            Arc::new(Self {
                channel,
                failing: AtomicBool::new(false),
                attempts: AtomicUsize::new(0),
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Notifier for FakeSink {
        fn channel(&self) -> Channel {
            self.channel
        }

        async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(NotifyError::Status(503));
            }
            self.sent.lock().push(notification.clone());
            Ok(())
        }
    }

    fn setup() -> (Fanout, Arc<FakeSink>, Arc<FakeSink>, Arc<StaticLink>) {
        let link = Arc::new(StaticLink::online());
        let arbiter = RadioArbiter::new(RadioMode::Single, link.clone());
        let ntfy = FakeSink::new(Channel::Ntfy);
        let discord = FakeSink::new(Channel::Discord);
        let sinks: Vec<Arc<dyn Notifier>> = vec![ntfy.clone(), discord.clone()];
        (Fanout::new(sinks, None, arbiter), ntfy, discord, link)
    }

    fn down() -> Notification {
        Notification::custom("Service DOWN: nas", "offline")
    }

    fn up() -> Notification {
        Notification::custom("Service UP: nas", "back")
    }

    #[tokio::test]
    async fn test_inline_delivery_leaves_no_entry() {
        let (fanout, ntfy, discord, _) = setup();
        fanout.dispatch("nas", down(), 0).await;
        assert_eq!(fanout.queue_depth(), 0);
        assert_eq!(ntfy.sent.lock().len(), 1);
        assert_eq!(discord.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_sink_is_queued_and_retried() {
        let (fanout, ntfy, discord, _) = setup();
        discord.failing.store(true, Ordering::SeqCst);
        fanout.dispatch("nas", down(), 0).await;

        let pending = fanout.pending_for("nas").unwrap();
        assert!(pending.discord && !pending.ntfy);

        assert_eq!(fanout.retry_internet(30_000).await, 0);
        discord.failing.store(false, Ordering::SeqCst);
        assert_eq!(fanout.retry_internet(60_000).await, 1);
        assert_eq!(fanout.queue_depth(), 0);
        assert_eq!(ntfy.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_flap_while_offline_delivers_latest_once() {
        let (fanout, ntfy, discord, link) = setup();
        link.set_online(false);
        fanout.dispatch("nas", down(), 0).await;
        fanout.dispatch("nas", up(), 10_000).await;
        assert_eq!(fanout.queue_depth(), 1);

        // Still offline at the first retry tick.
        assert_eq!(fanout.retry_internet(30_000).await, 0);

        link.set_online(true);
        fanout.retry_internet(60_000).await;
        assert_eq!(fanout.queue_depth(), 0);
        for sink in [&ntfy, &discord] {
            let sent = sink.sent.lock();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].title, "Service UP: nas");
        }
    }

    #[tokio::test]
    async fn test_inline_success_clears_older_pending() {
        let (fanout, ntfy, _, _) = setup();
        ntfy.failing.store(true, Ordering::SeqCst);
        fanout.dispatch("nas", down(), 0).await;
        ntfy.failing.store(false, Ordering::SeqCst);
        fanout.dispatch("nas", up(), 5_000).await;
        assert_eq!(fanout.queue_depth(), 0);
        assert_eq!(ntfy.sent.lock().last().map(|n| n.title.clone()), Some("Service UP: nas".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_radio_defers_mesh_to_one_batch() {
        use crate::config::{MeshConfig, MeshTransportKind};
        use crate::meshcore::codes::*;
        use crate::meshcore::test_utils::{channel_info_frame, ScriptedTransport};
        use crate::meshcore::ByteTransport;
        use crate::notify::TransportFactory;

        let arbiter = RadioArbiter::new(RadioMode::Single, Arc::new(StaticLink::online()));
        let sessions = Arc::new(AtomicUsize::new(0));
        let counter = sessions.clone();
        let factory: TransportFactory = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let transport = ScriptedTransport::new();
            transport.handle().set_responder(|frame: &[u8]| match frame[0] {
                CMD_DEVICE_QUERY => vec![vec![RESP_OK]],
                CMD_APP_START => vec![vec![RESP_SELF_INFO]],
                CMD_GET_CHANNEL => vec![channel_info_frame(0, "alerts")],
                _ => vec![vec![RESP_OK]],
            });
            Ok(Box::new(transport) as Box<dyn ByteTransport>)
        });
        let config = MeshConfig {
            transport: MeshTransportKind::Lora,
            channel: "alerts".into(),
            ..Default::default()
        };
        let mesh = Arc::new(MeshNotifier::new(config, factory, arbiter.clone()));
        let fanout = Fanout::new(Vec::new(), Some(mesh), arbiter);

        fanout.dispatch("a", down(), 0).await;
        fanout.dispatch("b", down(), 0).await;
        assert_eq!(fanout.mesh_pending(), 2);
        assert_eq!(sessions.load(Ordering::SeqCst), 0);
        assert!(fanout.take_mesh_flush_request());
        assert!(!fanout.take_mesh_flush_request());

        // The cadence tick alone does not open a session for fresh entries.
        assert_eq!(fanout.retry_mesh(1_000).await, 0);
        assert_eq!(sessions.load(Ordering::SeqCst), 0);

        assert_eq!(fanout.flush_mesh(1_000).await, 2);
        assert_eq!(fanout.queue_depth(), 0);
        assert_eq!(sessions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_waits_full_interval_after_last_attempt() {
        let (fanout, _, discord, _) = setup();
        discord.failing.store(true, Ordering::SeqCst);
        fanout.dispatch("nas", down(), 29_900).await;
        assert_eq!(discord.attempts.load(Ordering::SeqCst), 1);

        assert_eq!(fanout.retry_internet(30_000).await, 0);
        assert_eq!(discord.attempts.load(Ordering::SeqCst), 1);

        assert_eq!(fanout.retry_internet(59_900).await, 0);
        assert_eq!(discord.attempts.load(Ordering::SeqCst), 2);

        discord.failing.store(false, Ordering::SeqCst);
        assert_eq!(fanout.retry_internet(60_000).await, 0);
        assert_eq!(fanout.retry_internet(89_900).await, 1);
        assert_eq!(fanout.queue_depth(), 0);
    }

    #[tokio::test]
    async fn test_no_sinks_no_queue() {
        let arbiter = RadioArbiter::new(RadioMode::Single, Arc::new(StaticLink::online()));
        let fanout = Fanout::new(Vec::new(), None, arbiter);
        fanout.dispatch("nas", down(), 0).await;
        assert_eq!(fanout.queue_depth(), 0);
        assert!(!fanout.take_mesh_flush_request());
    }
}
