//! Monitor engine: walks the service table, applies hysteresis and hands
//! edges to the notification fanout.
//!
//! Everything that sends notifications runs on this one loop: service
//! checks, push edges forwarded from the admin API, queue retries and the
//! deferred mesh message.

mod hysteresis;

pub use hysteresis::*;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

use crate::clock::MonotonicClock;
use crate::notify::{Fanout, Notification};
use crate::probe;
use crate::radio::{DeferredMessage, Mailbox, RadioArbiter};
use crate::status::{LedState, StatusLed};
use crate::store::{Service, Store};

/// How often the service table is walked.
pub const WALK_INTERVAL: Duration = Duration::from_secs(5);
/// How often the retry queue is polled. Each entry still waits out its
/// channel's cadence from its own last attempt.
pub const RETRY_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// An edge produced outside the loop by a push heartbeat.
#[derive(Debug, Clone)]
pub struct PushEdge {
    pub service_id: String,
    pub transition: Transition,
}

/// The monitor engine.
pub struct Monitor {
    store: Arc<Store>,
    fanout: Arc<Fanout>,
    arbiter: Arc<RadioArbiter>,
    mailbox: Arc<Mailbox<DeferredMessage>>,
    led: Arc<StatusLed>,
    clock: MonotonicClock,
}

impl Monitor {
    pub fn new(
        store: Arc<Store>,
        fanout: Arc<Fanout>,
        arbiter: Arc<RadioArbiter>,
        mailbox: Arc<Mailbox<DeferredMessage>>,
        led: Arc<StatusLed>,
        clock: MonotonicClock,
    ) -> Self {
        Self {
            store,
            fanout,
            arbiter,
            mailbox,
            led,
            clock,
        }
    }

    /// Run until the process exits.
    pub async fn run(self, mut push_rx: mpsc::Receiver<PushEdge>) {
        let mut walk = interval(WALK_INTERVAL);
        walk.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut retry = interval(RETRY_POLL_INTERVAL);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!("Monitor started with {} service(s)", self.store.len());

        loop {
            tokio::select! {
                _ = walk.tick() => self.walk().await,
                _ = retry.tick() => {
                    self.fanout.retry_internet(self.clock.now_ms()).await;
                    self.fanout.retry_mesh(self.clock.now_ms()).await;
                }
                Some(edge) = push_rx.recv() => self.on_push_edge(edge).await,
                _ = self.mailbox.wait(), if !self.arbiter.ble_op_in_progress() => {
                    self.flush_deferred().await;
                }
            }

            self.flush_requested_mesh().await;
        }
    }

    /// Check every due service once.
    pub async fn walk(&self) {
        let wifi = self.arbiter.wifi_connected().await;

        if self.arbiter.monitoring_paused() {
            tracing::debug!("Monitoring paused, skipping walk");
        } else if !wifi {
            tracing::debug!("Wi-Fi down, skipping walk");
        } else {
            for service in self.store.take_due(self.clock.now_ms()) {
                self.check(service).await;
            }
        }

        self.refresh_led(wifi);
    }

    async fn check(&self, service: Service) {
        let last_push = self
            .store
            .get(&service.id)
            .and_then(|entry| entry.runtime.last_push);
        let result = probe::run_check(&service, last_push, self.clock.now_ms())
            .await
            .map_err(|e| e.to_string());
        if let Err(e) = &result {
            tracing::debug!("Check '{}' failed: {}", service.name, e);
        }

        let now = self.clock.now_ms();
        let edge = self
            .store
            .update_runtime(&service.id, |svc, rt| {
                apply_check(svc, rt, result, now).map(|t| (t, svc.clone(), rt.clone()))
            })
            .flatten();

        if let Some((transition, service, runtime)) = edge {
            let counter = match transition {
                Transition::Up { .. } => runtime.consecutive_passes,
                _ => runtime.consecutive_fails,
            };
            self.on_transition(&service, transition, &runtime.last_error, counter)
                .await;
        }
    }

    async fn on_push_edge(&self, edge: PushEdge) {
        if let Some(entry) = self.store.get(&edge.service_id) {
            self.on_transition(&entry.service, edge.transition, "", 1).await;
        }
    }

    async fn on_transition(&self, service: &Service, transition: Transition, last_error: &str, counter: u32) {
        let now = self.clock.now_ms();
        match transition {
            Transition::Up { announce } => {
                tracing::info!("Service '{}' is now UP (after {} consecutive passes)", service.name, counter);
                if announce {
                    self.fanout
                        .dispatch(&service.id, Notification::online(service), now)
                        .await;
                } else {
                    tracing::debug!("First Up for '{}' since boot, not announced", service.name);
                }
            }
            Transition::Down => {
                tracing::warn!("Service '{}' is now DOWN (after {} consecutive fails)", service.name, counter);
                self.fanout
                    .dispatch(&service.id, Notification::offline(service, last_error), now)
                    .await;
            }
            Transition::Rearm => {
                tracing::warn!("Service '{}' still DOWN, re-alerting", service.name);
                self.fanout
                    .dispatch(&service.id, Notification::offline(service, last_error), now)
                    .await;
            }
        }
    }

    /// Single-radio boards send an edge's mesh message as soon as the
    /// step that queued it is done, batched with anything else pending.
    async fn flush_requested_mesh(&self) {
        if self.fanout.take_mesh_flush_request() {
            self.fanout.flush_mesh(self.clock.now_ms()).await;
        }
    }

    async fn flush_deferred(&self) {
        if let Some(message) = self.mailbox.take() {
            tracing::info!("Sending deferred mesh message '{}'", message.title);
            let notification = Notification::custom(message.title, message.message);
            if let Err(e) = self.fanout.send_mesh_direct(&notification).await {
                tracing::warn!("Deferred mesh message failed: {}", e);
            }
        }
    }

    fn refresh_led(&self, wifi: bool) {
        let state = LedState::evaluate(
            false,
            wifi,
            self.arbiter.ble_op_in_progress(),
            &self.store.list(),
            self.clock.now_ms(),
        );
        self.led.set(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MeshConfig, MeshTransportKind, RadioMode};
    use crate::meshcore::codes::*;
    use crate::meshcore::test_utils::{channel_info_frame, ScriptHandle, ScriptedTransport};
    use crate::meshcore::ByteTransport;
    use crate::notify::{Channel, MeshNotifier, Notifier, NotifyError, TransportFactory};
    use crate::radio::StaticLink;
    use crate::store::{CodeOrName, ServiceInput};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl Notifier for Recorder {
        fn channel(&self) -> Channel {
            Channel::Ntfy
        }

        async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
            self.sent.lock().push(notification.clone());
            Ok(())
        }
    }

    struct Harness {
        _dir: TempDir,
        store: Arc<Store>,
        link: Arc<StaticLink>,
        arbiter: Arc<RadioArbiter>,
        recorder: Arc<Recorder>,
        led: Arc<StatusLed>,
        fanout: Arc<Fanout>,
        mailbox: Arc<Mailbox<DeferredMessage>>,
        /// One handle per mesh session opened.
        sessions: Arc<Mutex<Vec<ScriptHandle>>>,
        monitor: Monitor,
    }

    fn companion(sessions: Arc<Mutex<Vec<ScriptHandle>>>) -> TransportFactory {
        Arc::new(move || {
            let transport = ScriptedTransport::new();
            let handle = transport.handle();
            handle.set_responder(|frame: &[u8]| match frame[0] {
                CMD_DEVICE_QUERY => vec![vec![RESP_DEVICE_INFO, 3]],
                CMD_APP_START => vec![vec![RESP_SELF_INFO]],
                CMD_GET_CHANNEL if frame[1] == 0 => vec![channel_info_frame(0, "alerts")],
                CMD_SEND_CHANNEL_TXT_MSG => vec![vec![RESP_SENT, 0, 0, 0, 0]],
                _ => vec![vec![RESP_ERR]],
            });
            sessions.lock().push(handle);
            Ok(Box::new(transport) as Box<dyn ByteTransport>)
        })
    }

    fn build(with_mesh: bool) -> Harness {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::open(dir.path().join("services.json")).unwrap());
        let link = Arc::new(StaticLink::online());
        let arbiter = RadioArbiter::new(RadioMode::Single, link.clone());
        let recorder = Arc::new(Recorder::default());
        let sinks: Vec<Arc<dyn Notifier>> = vec![recorder.clone()];
        let sessions = Arc::new(Mutex::new(Vec::new()));
        let mesh = with_mesh.then(|| {
            let config = MeshConfig {
                transport: MeshTransportKind::Ble,
                channel: "alerts".into(),
                ..Default::default()
            };
            Arc::new(MeshNotifier::new(config, companion(sessions.clone()), arbiter.clone()))
        });
        let fanout = Arc::new(Fanout::new(sinks, mesh, arbiter.clone()));
        let mailbox = Arc::new(Mailbox::new());
        let led = Arc::new(StatusLed::default());
        let monitor = Monitor::new(
            store.clone(),
            fanout.clone(),
            arbiter.clone(),
            mailbox.clone(),
            led.clone(),
            MonotonicClock::new(),
        );
        Harness {
            _dir: dir,
            store,
            link,
            arbiter,
            recorder,
            led,
            fanout,
            mailbox,
            sessions,
            monitor,
        }
    }

    fn harness() -> Harness {
        build(false)
    }

    fn channel_sends(sessions: &Mutex<Vec<ScriptHandle>>) -> usize {
        sessions
            .lock()
            .iter()
            .flat_map(|h| h.sent())
            .filter(|f| f[0] == CMD_SEND_CHANNEL_TXT_MSG)
            .count()
    }

    fn push_input() -> ServiceInput {
        ServiceInput {
            name: Some("backup".into()),
            kind: Some(CodeOrName::Name("push".into())),
            check_interval: Some(60),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_heartbeat_expires_after_grace() {
        let h = harness();
        let svc = h.store.add(push_input()).unwrap();

        let edge = h
            .store
            .update_runtime(&svc.id, |_, rt| mark_push_received(rt, 0))
            .flatten();
        assert_eq!(edge, Some(Transition::Up { announce: false }));

        tokio::time::advance(Duration::from_secs(60)).await;
        h.monitor.walk().await;
        assert!(h.store.get(&svc.id).unwrap().runtime.is_up);

        tokio::time::advance(Duration::from_secs(6)).await;
        h.monitor.walk().await;
        let entry = h.store.get(&svc.id).unwrap();
        assert!(!entry.runtime.is_up);
        assert!(!entry.runtime.last_error.is_empty());

        let sent = h.recorder.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].title, "Service DOWN: backup");
        assert_eq!(h.led.get(), LedState::AnyActiveDown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_walk_skipped_while_offline_or_paused() {
        let h = harness();
        let svc = h.store.add(push_input()).unwrap();

        h.link.set_online(false);
        h.monitor.walk().await;
        assert_eq!(h.store.get(&svc.id).unwrap().runtime.last_check, None);
        assert_eq!(h.led.get(), LedState::NoWifi);

        h.link.set_online(true);
        let lease = h.arbiter.acquire_mesh().await;
        h.monitor.walk().await;
        assert_eq!(h.store.get(&svc.id).unwrap().runtime.last_check, None);
        lease.release().await;

        h.monitor.walk().await;
        assert!(h.store.get(&svc.id).unwrap().runtime.last_check.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_edge_is_announced_after_first_up() {
        let h = harness();
        let svc = h.store.add(push_input()).unwrap();
        h.store.update_runtime(&svc.id, |_, rt| {
            rt.has_been_up = true;
        });

        h.monitor
            .on_push_edge(PushEdge {
                service_id: svc.id.clone(),
                transition: Transition::Up { announce: true },
            })
            .await;
        let sent = h.recorder.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].title, "Service UP: backup");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_message_waits_for_radio_lease() {
        let h = build(true);
        let lease = h.arbiter.acquire_mesh().await;
        h.mailbox.post(DeferredMessage {
            title: "Hello".into(),
            message: "from the admin page".into(),
        });

        let (_push_tx, push_rx) = mpsc::channel(1);
        let task = tokio::spawn(h.monitor.run(push_rx));

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(h.sessions.lock().is_empty());
        assert!(h.mailbox.is_pending());

        lease.release().await;
        // Next loop wake-up plus the send confirmation window.
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(h.sessions.lock().len(), 1);
        assert_eq!(channel_sends(&h.sessions), 1);
        assert!(!h.mailbox.is_pending());
        assert!(!h.arbiter.ble_op_in_progress());
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_radio_mesh_flushed_right_after_walk() {
        let h = build(true);
        let svc = h.store.add(push_input()).unwrap();
        h.store.update_runtime(&svc.id, |_, rt| mark_push_received(rt, 0));

        let (_push_tx, push_rx) = mpsc::channel(1);
        let task = tokio::spawn(h.monitor.run(push_rx));

        // Heartbeat expires at 65 s; the mesh cadence alone would wait 10 min.
        tokio::time::sleep(Duration::from_secs(100)).await;

        assert_eq!(h.recorder.sent.lock().len(), 1);
        assert_eq!(h.sessions.lock().len(), 1);
        assert_eq!(channel_sends(&h.sessions), 1);
        assert_eq!(h.fanout.mesh_pending(), 0);
        assert!(!h.fanout.take_mesh_flush_request());
        task.abort();
    }
}
