//! Correlated request/response tracking
//!
//! Every outbound request that expects a reply (text ack, traceroute,
//! position exchange, telemetry, admin) is tracked here by its packet id.
//! Routing acks and replies resolve entries; a sweeper fails whatever is
//! left past its deadline. For text messages the tracker also owns the
//! message row's delivery-state progression.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, warn};

use meshmonitor_store::{DeliveryState, Store};

use crate::error::Result;

/// What kind of reply an entry is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    TextMessage,
    Traceroute,
    PositionExchange,
    TelemetryRequest,
    Admin,
}

/// One in-flight request.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub kind: RequestKind,
    pub destination: u32,
    /// Broadcasts never get an end-to-end ack; they settle at delivered.
    pub is_broadcast: bool,
    pub minted_at: Instant,
    pub deadline: Instant,
    /// Radio echoed the packet back (delivered locally).
    pub delivered: bool,
}

/// Default ack window for direct text messages.
pub const DEFAULT_ACK_WINDOW_SECS: u64 = 30;

/// Window for traceroute / position / telemetry replies.
pub const DEFAULT_REPLY_WINDOW_SECS: u64 = 120;

const SWEEP_INTERVAL_MS: u64 = 1000;

/// Pending-send table keyed by locally minted packet id.
pub struct RequestTracker {
    store: Arc<Store>,
    pending: Mutex<HashMap<u32, PendingRequest>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RequestTracker {
    pub fn new(store: Arc<Store>) -> Arc<Self> {
        Arc::new(RequestTracker {
            store,
            pending: Mutex::new(HashMap::new()),
            sweeper: Mutex::new(None),
        })
    }

    /// Mint a fresh 31-bit packet id (non-zero; zero means "unset" on the
    /// wire).
    pub fn mint_packet_id() -> u32 {
        loop {
            let id = rand::random::<u32>() & 0x7FFF_FFFF;
            if id != 0 {
                return id;
            }
        }
    }

    /// Spawn the timeout sweeper.
    pub async fn start(self: &Arc<Self>) {
        let tracker = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(SWEEP_INTERVAL_MS));
            loop {
                ticker.tick().await;
                tracker.sweep_expired().await;
            }
        });
        *self.sweeper.lock().await = Some(handle);
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.sweeper.lock().await.take() {
            handle.abort();
        }
    }

    /// Register an in-flight request.
    pub async fn track(
        &self,
        request_id: u32,
        kind: RequestKind,
        destination: u32,
        timeout: Duration,
    ) {
        let is_broadcast = destination == meshmonitor_proto::BROADCAST_NUM;
        let now = Instant::now();
        let entry = PendingRequest {
            kind,
            destination,
            is_broadcast,
            minted_at: now,
            deadline: now + timeout,
            delivered: false,
        };
        self.pending.lock().await.insert(request_id, entry);
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn get(&self, request_id: u32) -> Option<PendingRequest> {
        self.pending.lock().await.get(&request_id).cloned()
    }

    /// The radio echoed a tracked packet back: the local radio transmitted
    /// it. Text messages move to `delivered`; broadcasts are done at that
    /// point (no end-to-end ack will ever come).
    pub async fn note_radio_echo(&self, packet_id: u32) -> Result<()> {
        let mut pending = self.pending.lock().await;
        let Some(entry) = pending.get_mut(&packet_id) else {
            return Ok(());
        };

        if entry.kind == RequestKind::TextMessage && !entry.delivered {
            entry.delivered = true;
            self.store
                .set_message_delivery_state(packet_id, DeliveryState::Delivered)
                .await?;
            debug!("Message {:#010x} delivered (radio echo)", packet_id);
        }
        if entry.is_broadcast {
            pending.remove(&packet_id);
        }
        Ok(())
    }

    /// A routing-app ack arrived for a tracked request. `error_reason`
    /// `None` confirms; anything else fails. Repeated acks for the same id
    /// are no-ops once the entry is resolved.
    pub async fn resolve_ack(&self, request_id: u32, error_reason: Option<&str>) -> Result<()> {
        let entry = self.pending.lock().await.remove(&request_id);
        let Some(entry) = entry else {
            return Ok(());
        };

        match error_reason {
            None => {
                if entry.kind == RequestKind::TextMessage && !entry.is_broadcast {
                    self.store
                        .set_message_delivery_state(request_id, DeliveryState::Confirmed)
                        .await?;
                    debug!("Message {:#010x} confirmed", request_id);
                }
            }
            Some(reason) => {
                warn!(
                    "Request {:#010x} failed with routing error {}",
                    request_id, reason
                );
                match entry.kind {
                    RequestKind::TextMessage => {
                        self.store
                            .set_message_delivery_state(request_id, DeliveryState::Failed)
                            .await?;
                    }
                    RequestKind::Traceroute => {
                        // No path: record the attempt with both routes absent.
                        self.store
                            .append_traceroute(
                                0,
                                entry.destination,
                                None,
                                None,
                                None,
                                None,
                                chrono::Utc::now().timestamp(),
                            )
                            .await?;
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// A typed reply (traceroute result, position, telemetry) arrived.
    pub async fn resolve_reply(&self, request_id: u32) -> Option<PendingRequest> {
        self.pending.lock().await.remove(&request_id)
    }

    /// Fail everything past its deadline.
    async fn sweep_expired(&self) {
        let now = Instant::now();
        let expired: Vec<(u32, PendingRequest)> = {
            let mut pending = self.pending.lock().await;
            let ids: Vec<u32> = pending
                .iter()
                .filter(|(_, e)| e.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|e| (id, e)))
                .collect()
        };

        for (id, entry) in expired {
            match entry.kind {
                RequestKind::TextMessage => {
                    if entry.is_broadcast {
                        // Broadcasts stay at delivered; the window lapsing
                        // is not a failure.
                        debug!("Broadcast {:#010x} settled without ack", id);
                        continue;
                    }
                    warn!("Message {:#010x} timed out waiting for ack", id);
                    if let Err(e) = self
                        .store
                        .set_message_delivery_state(id, DeliveryState::Failed)
                        .await
                    {
                        warn!("Failed to record message timeout: {}", e);
                    }
                }
                RequestKind::Traceroute => {
                    warn!("Traceroute {:#010x} timed out", id);
                    if let Err(e) = self
                        .store
                        .append_traceroute(
                            0,
                            entry.destination,
                            None,
                            None,
                            None,
                            None,
                            chrono::Utc::now().timestamp(),
                        )
                        .await
                    {
                        warn!("Failed to record traceroute timeout: {}", e);
                    }
                }
                other => {
                    debug!("Request {:#010x} ({:?}) timed out", id, other);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshmonitor_store::Message;

    async fn test_store() -> (Arc<Store>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        (Arc::new(store), dir)
    }

    async fn seed_local_message(store: &Store, id: u32, to: u32, channel: i32) {
        let message = Message {
            id,
            from_node_num: 0x10,
            to_node_num: to,
            from_node_id: meshmonitor_proto::node_id_from_num(0x10),
            to_node_id: meshmonitor_proto::node_id_from_num(to),
            channel,
            text: "test".to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            portnum: 1,
            reply_id: None,
            emoji: false,
            hop_start: None,
            hop_limit: None,
            via_mqtt: false,
            delivery_state: Some(DeliveryState::Pending),
            ack_failed: false,
            request_id: Some(id),
            is_local: true,
            created_at: chrono::Utc::now().timestamp(),
        };
        store.upsert_message(&message).await.unwrap();
    }

    #[tokio::test]
    async fn test_dm_echo_then_ack_confirms() {
        let (store, _dir) = test_store().await;
        seed_local_message(&store, 5000, 0xabcd0001, -1).await;

        let tracker = RequestTracker::new(Arc::clone(&store));
        tracker
            .track(
                5000,
                RequestKind::TextMessage,
                0xabcd0001,
                Duration::from_secs(30),
            )
            .await;

        tracker.note_radio_echo(5000).await.unwrap();
        let stored = store.get_message(5000).await.unwrap().unwrap();
        assert_eq!(stored.delivery_state, Some(DeliveryState::Delivered));

        tracker.resolve_ack(5000, None).await.unwrap();
        let stored = store.get_message(5000).await.unwrap().unwrap();
        assert_eq!(stored.delivery_state, Some(DeliveryState::Confirmed));
        assert_eq!(tracker.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_routing_error_fails_message() {
        let (store, _dir) = test_store().await;
        seed_local_message(&store, 5001, 0xabcd0001, -1).await;

        let tracker = RequestTracker::new(Arc::clone(&store));
        tracker
            .track(
                5001,
                RequestKind::TextMessage,
                0xabcd0001,
                Duration::from_secs(30),
            )
            .await;

        tracker.note_radio_echo(5001).await.unwrap();
        tracker.resolve_ack(5001, Some("TIMEOUT")).await.unwrap();

        let stored = store.get_message(5001).await.unwrap().unwrap();
        assert_eq!(stored.delivery_state, Some(DeliveryState::Failed));
        assert!(stored.ack_failed);
    }

    #[tokio::test]
    async fn test_broadcast_settles_at_delivered() {
        let (store, _dir) = test_store().await;
        seed_local_message(&store, 1000, meshmonitor_proto::BROADCAST_NUM, 0).await;

        let tracker = RequestTracker::new(Arc::clone(&store));
        tracker
            .track(
                1000,
                RequestKind::TextMessage,
                meshmonitor_proto::BROADCAST_NUM,
                Duration::from_secs(30),
            )
            .await;

        tracker.note_radio_echo(1000).await.unwrap();

        // Entry gone: no ack is expected for a broadcast.
        assert_eq!(tracker.pending_count().await, 0);
        let stored = store.get_message(1000).await.unwrap().unwrap();
        assert_eq!(stored.delivery_state, Some(DeliveryState::Delivered));
    }

    #[tokio::test]
    async fn test_timeout_fails_dm() {
        let (store, _dir) = test_store().await;
        seed_local_message(&store, 5002, 0xabcd0001, -1).await;

        let tracker = RequestTracker::new(Arc::clone(&store));
        tracker
            .track(
                5002,
                RequestKind::TextMessage,
                0xabcd0001,
                Duration::from_millis(10),
            )
            .await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        tracker.sweep_expired().await;

        let stored = store.get_message(5002).await.unwrap().unwrap();
        assert_eq!(stored.delivery_state, Some(DeliveryState::Failed));
        assert_eq!(tracker.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_traceroute_timeout_records_failed_route() {
        let (store, _dir) = test_store().await;

        let tracker = RequestTracker::new(Arc::clone(&store));
        tracker
            .track(
                7000,
                RequestKind::Traceroute,
                0xabcd0001,
                Duration::from_millis(10),
            )
            .await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        tracker.sweep_expired().await;

        let records = store.recent_traceroutes(10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_failed());
    }

    #[tokio::test]
    async fn test_duplicate_ack_is_noop() {
        let (store, _dir) = test_store().await;
        seed_local_message(&store, 5003, 0xabcd0001, -1).await;

        let tracker = RequestTracker::new(Arc::clone(&store));
        tracker
            .track(
                5003,
                RequestKind::TextMessage,
                0xabcd0001,
                Duration::from_secs(30),
            )
            .await;

        tracker.resolve_ack(5003, None).await.unwrap();
        // A second, contradictory ack must not move the state back.
        tracker.resolve_ack(5003, Some("TIMEOUT")).await.unwrap();

        let stored = store.get_message(5003).await.unwrap().unwrap();
        assert_eq!(stored.delivery_state, Some(DeliveryState::Confirmed));
    }

    #[test]
    fn test_minted_ids_are_nonzero() {
        for _ in 0..100 {
            let id = RequestTracker::mint_packet_id();
            assert_ne!(id, 0);
            assert_eq!(id & 0x8000_0000, 0);
        }
    }
}
