//! The relay task: the single owner of the history window, the connection
//! registry and the durable store.
//!
//! Connection tasks never touch shared state. They push [`RelayEvent`]s
//! into one channel and the relay applies them strictly in arrival order:
//! register and replay on connect, stamp/archive/fan-out on each inbound
//! frame, unregister on disconnect, and a final snapshot on shutdown.

use chrono::Utc;
use scale_core::{ClientId, Envelope, HistoryBuffer, Reading, DEFAULT_CAPACITY, DEFAULT_REPLAY_LIMIT};
use scale_store::{HistoryStore, StoreError};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::registry::{ConnectionRegistry, Frame};

/// Default number of appends between snapshots.
pub const DEFAULT_FLUSH_EVERY: usize = 10;

/// Everything the relay reacts to.
#[derive(Debug)]
pub enum RelayEvent {
    Connected {
        client_id: ClientId,
        sender: mpsc::Sender<Frame>,
    },
    Inbound {
        client_id: ClientId,
        frame: Frame,
    },
    Disconnected {
        client_id: ClientId,
    },
    Stats {
        reply: oneshot::Sender<RelayStats>,
    },
}

/// An inbound frame, classified once.
#[derive(Debug)]
pub enum Inbound {
    /// A JSON object: archived and re-broadcast inside a `weight` envelope.
    Reading(Reading),
    /// Anything else: relayed byte-for-byte, never archived.
    Raw(Frame),
}

impl Inbound {
    pub fn classify(frame: Frame) -> Self {
        match Reading::decode(frame.as_bytes()) {
            Ok(reading) => Inbound::Reading(reading),
            Err(e) => {
                debug!(error = %e, bytes = frame.len(), "undecodable payload, relaying raw");
                Inbound::Raw(frame)
            }
        }
    }
}

/// Snapshot cadence: one save per `every` appended readings.
///
/// Counts appends rather than checking whether the buffer length is a
/// multiple of `every`; a full buffer never changes length, which would
/// otherwise mean a save on every single reading.
#[derive(Clone, Debug)]
pub struct FlushPolicy {
    every: usize,
    pending: usize,
}

impl FlushPolicy {
    pub fn new(every: usize) -> Self {
        Self {
            every: every.max(1),
            pending: 0,
        }
    }

    /// Record one append; true when a snapshot is due.
    pub fn record_append(&mut self) -> bool {
        self.pending += 1;
        if self.pending >= self.every {
            self.pending = 0;
            true
        } else {
            false
        }
    }
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_FLUSH_EVERY)
    }
}

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub history_capacity: usize,
    pub replay_limit: usize,
    pub flush_every: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_CAPACITY,
            replay_limit: DEFAULT_REPLAY_LIMIT,
            flush_every: DEFAULT_FLUSH_EVERY,
        }
    }
}

/// Counters reported by `/health`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub connections: usize,
    pub open_connections: usize,
    pub history: usize,
    pub readings: u64,
    pub raw_relayed: u64,
    pub saves: u64,
    pub save_failures: u64,
}

pub struct Relay<S> {
    history: HistoryBuffer,
    registry: ConnectionRegistry,
    store: S,
    flush: FlushPolicy,
    replay_limit: usize,
    stats: RelayStats,
}

impl<S: HistoryStore> Relay<S> {
    pub fn new(store: S, history: HistoryBuffer, config: &RelayConfig) -> Self {
        Self {
            history,
            registry: ConnectionRegistry::new(),
            store,
            flush: FlushPolicy::new(config.flush_every),
            replay_limit: config.replay_limit,
            stats: RelayStats::default(),
        }
    }

    /// Seed the history from the store. An unreadable snapshot is logged
    /// and the relay starts empty.
    pub fn load(store: S, config: &RelayConfig) -> Self {
        let samples = match store.load() {
            Ok(samples) => samples,
            Err(e) => {
                warn!(error = %e, "could not load history, starting empty");
                Vec::new()
            }
        };
        let history = HistoryBuffer::from_samples(samples, config.history_capacity);
        info!(samples = history.len(), "history ready");
        Self::new(store, history, config)
    }

    /// Process events until `shutdown` fires, then write a final snapshot.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<RelayEvent>,
        shutdown: CancellationToken,
    ) -> RelayStats {
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
            }
        }

        match self.save_snapshot() {
            Ok(()) => info!(samples = self.history.len(), "history saved on shutdown"),
            Err(e) => error!(error = %e, "final history save failed"),
        }
        self.stats()
    }

    pub fn handle(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Connected { client_id, sender } => self.on_connect(client_id, sender),
            RelayEvent::Inbound { client_id, frame } => self.on_frame(&client_id, frame),
            RelayEvent::Disconnected { client_id } => self.on_disconnect(&client_id),
            RelayEvent::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    /// Register the client and replay recent history to it alone.
    pub fn on_connect(&mut self, client_id: ClientId, sender: mpsc::Sender<Frame>) {
        self.registry.register(client_id.clone(), sender);

        if !self.history.is_empty() {
            let recent = self.history.recent(self.replay_limit);
            match Envelope::History(&recent).to_json() {
                Ok(json) => {
                    if let Err(e) = self.registry.send_to(&client_id, json.into()) {
                        warn!(client_id = %client_id, error = %e, "history replay not delivered");
                    }
                }
                Err(e) => error!(error = %e, "failed to serialize history"),
            }
        }

        self.registry.mark_open(&client_id);
        info!(
            client_id = %client_id,
            connections = self.registry.count(),
            "client connected"
        );
    }

    pub fn on_frame(&mut self, client_id: &ClientId, frame: Frame) {
        let received_at = Utc::now();

        match Inbound::classify(frame) {
            Inbound::Reading(mut reading) => {
                let sample = reading.stamp(received_at);
                debug!(client_id = %client_id, timestamp = sample.timestamp, "reading received");
                self.history.append(sample);
                self.stats.readings += 1;

                if self.flush.record_append() {
                    if let Err(e) = self.save_snapshot() {
                        error!(error = %e, "history save failed, continuing");
                    }
                }

                let json = match Envelope::Weight(reading.fields()).to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        error!(error = %e, "failed to serialize reading");
                        return;
                    }
                };
                let report = self.registry.broadcast(&json.into(), None);
                debug!(delivered = report.delivered, failed = report.failed, "reading broadcast");
            }
            Inbound::Raw(frame) => {
                self.stats.raw_relayed += 1;
                let report = self.registry.broadcast(&frame, None);
                debug!(
                    client_id = %client_id,
                    delivered = report.delivered,
                    "raw payload relayed"
                );
            }
        }
    }

    pub fn on_disconnect(&mut self, client_id: &ClientId) {
        if self.registry.unregister(client_id) {
            info!(
                client_id = %client_id,
                connections = self.registry.count(),
                "client disconnected"
            );
        }
    }

    /// Write the whole window to the store.
    pub fn save_snapshot(&mut self) -> Result<(), StoreError> {
        match self.store.save(self.history.as_slice()) {
            Ok(()) => {
                self.stats.saves += 1;
                Ok(())
            }
            Err(e) => {
                self.stats.save_failures += 1;
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            connections: self.registry.count(),
            open_connections: self.registry.open_count(),
            history: self.history.len(),
            ..self.stats
        }
    }

    pub fn history(&self) -> &HistoryBuffer {
        &self.history
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }
}

/// Ask a running relay for its counters. `None` once the relay has stopped.
pub async fn request_stats(events: &mpsc::Sender<RelayEvent>) -> Option<RelayStats> {
    let (reply, rx) = oneshot::channel();
    events.send(RelayEvent::Stats { reply }).await.ok()?;
    rx.await.ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use bytes::Bytes;
    use scale_core::Sample;
    use scale_store::{JsonFileStore, MemoryStore};
    use serde_json::{json, Value};

    fn relay(store: Arc<MemoryStore>) -> Relay<Arc<MemoryStore>> {
        Relay::load(store, &RelayConfig::default())
    }

    fn connect<S: HistoryStore>(relay: &mut Relay<S>) -> (ClientId, mpsc::Receiver<Frame>) {
        let id = ClientId::new();
        let (tx, rx) = mpsc::channel(256);
        relay.on_connect(id.clone(), tx);
        (id, rx)
    }

    fn send<S: HistoryStore>(relay: &mut Relay<S>, from: &ClientId, payload: &str) {
        relay.on_frame(from, payload.to_string().into());
    }

    fn next_json(rx: &mut mpsc::Receiver<Frame>) -> Value {
        let frame = rx.try_recv().expect("expected a frame");
        serde_json::from_slice(frame.as_bytes()).unwrap()
    }

    fn seeded(n: i64) -> Vec<Sample> {
        (0..n).map(|i| Sample::new(json!(i), i, Utc::now())).collect()
    }

    #[test]
    fn flush_policy_fires_every_n() {
        let mut policy = FlushPolicy::new(3);
        let fired: Vec<bool> = (0..7).map(|_| policy.record_append()).collect();
        assert_eq!(fired, vec![false, false, true, false, false, true, false]);
    }

    #[test]
    fn classify_splits_objects_from_everything_else() {
        assert!(matches!(
            Inbound::classify(r#"{"weight": 1}"#.to_string().into()),
            Inbound::Reading(_)
        ));
        assert!(matches!(
            Inbound::classify("plain text".to_string().into()),
            Inbound::Raw(_)
        ));
        assert!(matches!(
            Inbound::classify(Frame::Binary(Bytes::from_static(&[0xde, 0xad]))),
            Inbound::Raw(_)
        ));
    }

    #[test]
    fn no_history_message_when_empty() {
        let mut relay = relay(Arc::new(MemoryStore::new()));
        let (_id, mut rx) = connect(&mut relay);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn history_replay_sends_all_when_short() {
        let store = Arc::new(MemoryStore::with_snapshot(seeded(7)));
        let mut relay = relay(store);
        let (_id, mut rx) = connect(&mut relay);

        let msg = next_json(&mut rx);
        assert_eq!(msg["type"], "history");
        let data = msg["data"].as_array().unwrap();
        assert_eq!(data.len(), 7);
        assert_eq!(data[0]["timestamp"], 0);
        assert_eq!(data[6]["timestamp"], 6);
    }

    #[test]
    fn history_replay_sends_last_hundred() {
        let store = Arc::new(MemoryStore::with_snapshot(seeded(250)));
        let mut relay = relay(store);
        let (_id, mut rx) = connect(&mut relay);

        let msg = next_json(&mut rx);
        let data = msg["data"].as_array().unwrap();
        assert_eq!(data.len(), 100);
        assert_eq!(data[0]["timestamp"], 150);
        assert_eq!(data[99]["timestamp"], 249);
    }

    #[test]
    fn history_replay_goes_to_new_client_only() {
        let store = Arc::new(MemoryStore::with_snapshot(seeded(3)));
        let mut relay = relay(store);
        let (_a, mut rx_a) = connect(&mut relay);
        assert_eq!(next_json(&mut rx_a)["type"], "history");

        let (_b, mut rx_b) = connect(&mut relay);
        assert_eq!(next_json(&mut rx_b)["type"], "history");
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn reading_is_echoed_to_everyone_including_sender() {
        let mut relay = relay(Arc::new(MemoryStore::new()));
        let (a, mut rx_a) = connect(&mut relay);
        let (_b, mut rx_b) = connect(&mut relay);

        send(&mut relay, &a, r#"{"weight": 81.2, "timestamp": 1000, "scale": "dock-3"}"#);

        let expected = json!({
            "type": "weight",
            "data": { "weight": 81.2, "timestamp": 1000, "scale": "dock-3" }
        });
        assert_eq!(next_json(&mut rx_a), expected);
        assert_eq!(next_json(&mut rx_b), expected);
        assert_eq!(relay.history().len(), 1);
    }

    #[test]
    fn undecodable_payload_is_relayed_verbatim() {
        let mut relay = relay(Arc::new(MemoryStore::new()));
        let (a, mut rx_a) = connect(&mut relay);
        let (_b, mut rx_b) = connect(&mut relay);

        send(&mut relay, &a, "tare pressed {");

        for rx in [&mut rx_a, &mut rx_b] {
            match rx.try_recv().unwrap() {
                Frame::Text(text) => assert_eq!(text.as_str(), "tare pressed {"),
                other => panic!("expected text, got {other:?}"),
            }
        }
        assert!(relay.history().is_empty());
        assert_eq!(relay.stats().raw_relayed, 1);
    }

    #[test]
    fn binary_garbage_stays_binary() {
        let mut relay = relay(Arc::new(MemoryStore::new()));
        let (a, _rx_a) = connect(&mut relay);
        let (_b, mut rx_b) = connect(&mut relay);

        let payload = Bytes::from_static(&[0x00, 0x9f, 0x92, 0x96]);
        relay.on_frame(&a, Frame::Binary(payload.clone()));

        match rx_b.try_recv().unwrap() {
            Frame::Binary(bytes) => assert_eq!(bytes, payload),
            other => panic!("expected binary, got {other:?}"),
        }
        assert!(relay.history().is_empty());
    }

    #[test]
    fn json_array_is_not_a_reading() {
        let mut relay = relay(Arc::new(MemoryStore::new()));
        let (a, mut rx_a) = connect(&mut relay);
        send(&mut relay, &a, "[1,2,3]");
        assert_eq!(rx_a.try_recv().unwrap().as_bytes(), b"[1,2,3]");
        assert!(relay.history().is_empty());
    }

    #[test]
    fn missing_timestamp_is_assigned_at_receipt() {
        let mut relay = relay(Arc::new(MemoryStore::new()));
        let (a, mut rx_a) = connect(&mut relay);

        let before = Utc::now().timestamp_millis();
        send(&mut relay, &a, r#"{"weight": 5}"#);
        let after = Utc::now().timestamp_millis();

        let msg = next_json(&mut rx_a);
        let assigned = msg["data"]["timestamp"].as_i64().unwrap();
        assert!((before..=after).contains(&assigned));

        let stored = relay.history().recent(1);
        assert_eq!(stored[0].timestamp, assigned);
    }

    #[test]
    fn ten_readings_from_empty_flush_once() {
        let store = Arc::new(MemoryStore::new());
        let mut relay = relay(Arc::clone(&store));
        let (a, _rx) = connect(&mut relay);

        for i in 0..9 {
            send(&mut relay, &a, &format!(r#"{{"weight": {i}}}"#));
        }
        assert_eq!(store.saves(), 0);

        send(&mut relay, &a, r#"{"weight": 9}"#);
        assert_eq!(store.saves(), 1);
        assert_eq!(store.snapshot().len(), 10);
    }

    #[test]
    fn raw_payloads_do_not_count_toward_flush() {
        let store = Arc::new(MemoryStore::new());
        let mut relay = relay(Arc::clone(&store));
        let (a, _rx) = connect(&mut relay);

        for _ in 0..20 {
            send(&mut relay, &a, "noise");
        }
        assert_eq!(store.saves(), 0);
    }

    #[test]
    fn full_buffer_still_flushes_on_cadence() {
        let store = Arc::new(MemoryStore::new());
        let config = RelayConfig {
            history_capacity: 5,
            flush_every: 4,
            ..Default::default()
        };
        let mut relay = Relay::load(Arc::clone(&store), &config);
        let (a, _rx) = connect(&mut relay);

        for i in 0..12 {
            send(&mut relay, &a, &format!(r#"{{"weight": {i}, "timestamp": {i}}}"#));
        }
        assert_eq!(relay.history().len(), 5);
        assert_eq!(store.saves(), 3);
        let timestamps: Vec<i64> = store.snapshot().iter().map(|s| s.timestamp).collect();
        assert_eq!(timestamps, vec![7, 8, 9, 10, 11]);
    }

    #[test]
    fn save_failure_does_not_stop_broadcast() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();
        let store = JsonFileStore::new(blocker.join("history.json"));

        let config = RelayConfig {
            flush_every: 1,
            ..Default::default()
        };
        let mut relay = Relay::load(store, &config);
        let (a, mut rx_a) = connect(&mut relay);

        send(&mut relay, &a, r#"{"weight": 1}"#);
        assert_eq!(next_json(&mut rx_a)["type"], "weight");
        assert_eq!(relay.stats().save_failures, 1);
        assert_eq!(relay.history().len(), 1);
    }

    #[test]
    fn corrupt_store_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(&path, "]]] garbage").unwrap();

        let relay = Relay::load(JsonFileStore::new(&path), &RelayConfig::default());
        assert!(relay.history().is_empty());
    }

    #[test]
    fn disconnect_unregisters() {
        let mut relay = relay(Arc::new(MemoryStore::new()));
        let (a, _rx_a) = connect(&mut relay);
        let (b, mut rx_b) = connect(&mut relay);
        assert_eq!(relay.stats().connections, 2);

        relay.on_disconnect(&a);
        assert_eq!(relay.stats().connections, 1);

        send(&mut relay, &b, r#"{"weight": 2}"#);
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn dropped_client_does_not_break_fan_out() {
        let mut relay = relay(Arc::new(MemoryStore::new()));
        let (a, rx_a) = connect(&mut relay);
        let (_b, mut rx_b) = connect(&mut relay);
        drop(rx_a);

        send(&mut relay, &a, r#"{"weight": 3}"#);
        assert_eq!(next_json(&mut rx_b)["data"]["weight"], 3);
    }

    #[tokio::test]
    async fn run_answers_stats_and_flushes_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let relay = relay(Arc::clone(&store));
        let (events_tx, events_rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(relay.run(events_rx, shutdown.clone()));

        let client_id = ClientId::new();
        let (tx, mut rx) = mpsc::channel(16);
        events_tx
            .send(RelayEvent::Connected { client_id: client_id.clone(), sender: tx })
            .await
            .unwrap();
        events_tx
            .send(RelayEvent::Inbound {
                client_id,
                frame: r#"{"weight": 70}"#.to_string().into(),
            })
            .await
            .unwrap();

        let stats = request_stats(&events_tx).await.unwrap();
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.history, 1);
        assert_eq!(stats.readings, 1);
        assert!(rx.recv().await.is_some());
        assert_eq!(store.saves(), 0);

        shutdown.cancel();
        let final_stats = task.await.unwrap();
        assert_eq!(final_stats.saves, 1);
        assert_eq!(store.saves(), 1);
        assert_eq!(store.snapshot().len(), 1);

        assert!(request_stats(&events_tx).await.is_none());
    }
}
