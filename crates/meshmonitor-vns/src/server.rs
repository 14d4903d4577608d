//! Virtual Node Server
//!
//! Impersonates the physical radio on a TCP port so any number of native
//! client apps can attach to one device. Each client gets its own framing
//! decoder, writer task, and config replay; outbound traffic from all
//! clients funnels through one bounded queue so the radio is never
//! overrun.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};
use tracing::{debug, info, warn};

use meshmonitor_device::{DeviceSession, Fanout, PacketOrigin, PacketRouter};
use meshmonitor_proto::framing::{encode_frame, FrameDecoder};
use meshmonitor_proto::mesh::{decode_to_radio, to_radio, FromRadio, MeshPacket, ToRadio};
use meshmonitor_proto::Message as _;
use meshmonitor_store::Store;

use crate::client::{prepare_forward, substitute_zero_from, ClientHandle};
use crate::error::Result;
use crate::filter::{self, FilterVerdict, MirrorOp};
use crate::replay;

/// Outbound queue bound; beyond this, the newest entry is dropped.
pub const OUTBOUND_QUEUE_DEPTH: usize = 100;

/// Pause between sends to the radio to avoid overrunning it.
const INTER_SEND_PAUSE_MS: u64 = 10;

const SWEEP_INTERVAL_SECS: u64 = 60;
const READ_BUF_LEN: usize = 4096;

/// Virtual node server configuration.
#[derive(Debug, Clone)]
pub struct VnsConfig {
    pub listen_port: u16,
    /// Operator override disabling the admin filter.
    pub allow_admin_commands: bool,
    /// Age window for the NodeInfo replay set.
    pub max_node_age_hours: u32,
    /// Clients idle longer than this are disconnected.
    pub idle_timeout_secs: u64,
}

impl Default for VnsConfig {
    fn default() -> Self {
        VnsConfig {
            listen_port: 4403,
            allow_admin_commands: false,
            max_node_age_hours: 24,
            idle_timeout_secs: 300,
        }
    }
}

/// The virtual node server.
pub struct VirtualNodeServer {
    config: VnsConfig,
    store: Arc<Store>,
    session: Arc<DeviceSession>,
    router: Arc<PacketRouter>,
    clients: RwLock<HashMap<String, Arc<ClientHandle>>>,
    client_seq: AtomicU64,
    outbound_tx: mpsc::Sender<Vec<u8>>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl VirtualNodeServer {
    pub fn new(
        config: VnsConfig,
        store: Arc<Store>,
        session: Arc<DeviceSession>,
        router: Arc<PacketRouter>,
    ) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        Arc::new(VirtualNodeServer {
            config,
            store,
            session,
            router,
            clients: RwLock::new(HashMap::new()),
            client_seq: AtomicU64::new(0),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Bind the listener and spawn the accept loop, outbound processor and
    /// inactivity sweeper. Returns the bound address.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.listen_port)).await?;
        let addr = listener.local_addr()?;
        info!("Virtual node server listening on {}", addr);

        let mut tasks = self.tasks.lock().await;

        let server = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&server);
                        tokio::spawn(async move {
                            server.run_client(stream, peer).await;
                        });
                    }
                    Err(e) => {
                        warn!("VNS accept failed: {}", e);
                        sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }));

        let server = Arc::clone(self);
        let mut outbound_rx = self
            .outbound_rx
            .lock()
            .await
            .take()
            .expect("outbound processor started twice");
        tasks.push(tokio::spawn(async move {
            while let Some(payload) = outbound_rx.recv().await {
                if let Err(e) = server.session.send_raw(&payload).await {
                    warn!("Forward to radio failed: {}", e);
                }
                sleep(Duration::from_millis(INTER_SEND_PAUSE_MS)).await;
            }
        }));

        let server = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            server.run_sweeper().await;
        }));

        Ok(addr)
    }

    pub async fn stop(&self) {
        for client in self.clients.read().await.values() {
            client.request_shutdown();
        }
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Queue one encoded ToRadio payload toward the radio. Returns false
    /// when the queue is full and the payload was dropped.
    pub fn enqueue_outbound(&self, payload: Vec<u8>) -> bool {
        match self.outbound_tx.try_send(payload) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("VNS outbound queue full; dropping newest packet");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    async fn run_sweeper(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
        let idle_limit = Duration::from_secs(self.config.idle_timeout_secs);
        loop {
            ticker.tick().await;
            let clients: Vec<Arc<ClientHandle>> =
                self.clients.read().await.values().cloned().collect();
            for client in clients {
                if client.idle_for().await > idle_limit {
                    info!("Disconnecting idle client {}", client.id);
                    client.request_shutdown();
                }
            }
        }
    }

    /// One client's whole lifetime: register, read loop, cleanup.
    async fn run_client(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let id = format!("vn-{}", self.client_seq.fetch_add(1, Ordering::SeqCst) + 1);
        info!("Client {} connected from {}", id, peer);

        if let Err(e) = self
            .store
            .audit_log(&id, "client_connected", None, None, Some(&peer.ip().to_string()))
            .await
        {
            warn!("Audit write failed: {}", e);
        }

        let (handle, mut writer_rx) = ClientHandle::new(id.clone(), peer);
        let handle = Arc::new(handle);
        self.clients
            .write()
            .await
            .insert(id.clone(), Arc::clone(&handle));

        let (mut read_half, mut write_half) = stream.into_split();

        let writer_id = id.clone();
        let writer = tokio::spawn(async move {
            while let Some(frame) = writer_rx.recv().await {
                if let Err(e) = write_half.write_all(&frame).await {
                    debug!("Write to client {} failed: {}", writer_id, e);
                    break;
                }
            }
        });

        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; READ_BUF_LEN];

        loop {
            tokio::select! {
                read = read_half.read(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        handle.touch().await;
                        decoder.feed(&buf[..n]);
                        let mut disconnect = false;
                        for payload in decoder.take() {
                            match decode_to_radio(&payload) {
                                Ok(msg) => {
                                    if self.dispatch(&handle, &payload, msg).await {
                                        disconnect = true;
                                        break;
                                    }
                                }
                                Err(e) => {
                                    debug!("Client {} sent undecodable payload: {}", id, e);
                                }
                            }
                        }
                        if disconnect {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("Read from client {} failed: {}", id, e);
                        break;
                    }
                },
                _ = handle.shutdown_requested() => break,
            }
        }

        self.clients.write().await.remove(&id);
        writer.abort();
        info!("Client {} disconnected", id);
        if let Err(e) = self
            .store
            .audit_log(&id, "client_disconnected", None, None, Some(&peer.ip().to_string()))
            .await
        {
            warn!("Audit write failed: {}", e);
        }
    }

    /// Handle one decoded ToRadio from a client. Returns true when the
    /// client asked to disconnect.
    async fn dispatch(&self, client: &Arc<ClientHandle>, raw: &[u8], msg: ToRadio) -> bool {
        match msg.payload_variant {
            Some(to_radio::PayloadVariant::WantConfigId(want_id)) => {
                self.replay_config(client, want_id).await;
            }
            Some(to_radio::PayloadVariant::Heartbeat(_)) => {
                // Absorbed: keep-alives are between the client and us.
            }
            Some(to_radio::PayloadVariant::Disconnect(_)) => {
                return true;
            }
            Some(to_radio::PayloadVariant::Packet(packet)) => {
                self.handle_client_packet(client, packet).await;
            }
            None => {
                // A ToRadio variant this mirror does not model; pass it on
                // untouched.
                self.enqueue_outbound(raw.to_vec());
            }
        }
        false
    }

    async fn replay_config(&self, client: &Arc<ClientHandle>, want_id: u32) {
        debug!("Config replay for {} (id {})", client.id, want_id);

        let local_node_num = self
            .router
            .local_node_num()
            .await
            .or(self.session.my_node_num().await)
            .unwrap_or(0);
        let cached = self.session.cached_init_config().await;

        let frames = match replay::build_replay(
            &self.store,
            local_node_num,
            self.session.reboot_count().await,
            &cached,
            self.config.max_node_age_hours,
            want_id,
        )
        .await
        {
            Ok(frames) => frames,
            Err(e) => {
                warn!("Replay build for {} failed: {}", client.id, e);
                return;
            }
        };

        for payload in frames {
            let frame = match encode_frame(&payload) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Replay record too large, skipping: {}", e);
                    continue;
                }
            };
            if !client.send_frame(frame) {
                // Client went away mid-replay; abort cleanly.
                debug!("Client {} dropped during replay", client.id);
                return;
            }
        }
    }

    async fn handle_client_packet(&self, client: &Arc<ClientHandle>, packet: MeshPacket) {
        match filter::evaluate(&packet, self.config.allow_admin_commands) {
            FilterVerdict::Drop { reason, subcommand } => {
                let details = serde_json::json!({
                    "portnum": packet.decoded().map(|d| d.portnum),
                    "subcommand": subcommand,
                });
                let target = meshmonitor_proto::node_id_from_num(packet.to);
                if let Err(e) = self
                    .store
                    .audit_log(
                        &client.id,
                        reason,
                        Some(&target),
                        Some(&details.to_string()),
                        Some(&client.addr.ip().to_string()),
                    )
                    .await
                {
                    warn!("Audit write failed: {}", e);
                }
                debug!(
                    "Dropped {} packet from {} ({})",
                    reason, client.id, target
                );
                return;
            }
            FilterVerdict::ForwardWithMirror(MirrorOp::SetFavorite { node_num, favorite }) => {
                if let Err(e) = self.store.set_favorite(node_num, favorite).await {
                    warn!("Favorite mirror failed: {}", e);
                }
            }
            FilterVerdict::Forward => {}
        }

        // Local echo so the UI sees the message immediately, before the
        // radio round-trip.
        let mut echo = packet.clone();
        if let Some(local) = self
            .router
            .local_node_num()
            .await
            .or(self.session.my_node_num().await)
        {
            substitute_zero_from(&mut echo, local);
        }
        let echo_frame = FromRadio::from_packet(echo);
        let echo_raw = echo_frame.encode_to_vec();
        if let Err(e) = self
            .router
            .handle_from_radio(&echo_frame, &echo_raw, PacketOrigin::LocalEcho)
            .await
        {
            warn!("Local echo for {} failed: {}", client.id, e);
        }

        let forward = prepare_forward(&packet);
        self.enqueue_outbound(ToRadio::from_packet(forward).encode_to_vec());
    }
}

/// Broadcast fan-in: every genuine FromRadio off the radio is framed once
/// and offered to every connected client. A dead client is skipped; the
/// fan-out never fails as a whole.
#[async_trait]
impl Fanout for VirtualNodeServer {
    async fn broadcast(&self, raw: &[u8]) {
        let frame = match encode_frame(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Unframeable broadcast payload: {}", e);
                return;
            }
        };

        let clients: Vec<Arc<ClientHandle>> =
            self.clients.read().await.values().cloned().collect();
        for client in clients {
            if !client.send_frame(frame.clone()) {
                debug!("Broadcast to {} failed; client gone", client.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshmonitor_device::{RequestTracker, SessionConfig};
    use meshmonitor_proto::mesh::{from_radio, MyNodeInfo};
    use meshmonitor_store::{DeliveryState, NodePatch};
    use tokio::time::timeout;

    struct Harness {
        server: Arc<VirtualNodeServer>,
        store: Arc<Store>,
        router: Arc<PacketRouter>,
        _dir: tempfile::TempDir,
    }

    async fn harness(config: VnsConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).await.unwrap());
        let tracker = RequestTracker::new(Arc::clone(&store));
        let (session, _events) = DeviceSession::new(SessionConfig::default());
        let router = PacketRouter::new(Arc::clone(&store), tracker, Arc::clone(&session));
        let server = VirtualNodeServer::new(config, Arc::clone(&store), session, Arc::clone(&router));
        Harness {
            server,
            store,
            router,
            _dir: dir,
        }
    }

    async fn set_local(router: &Arc<PacketRouter>, num: u32) {
        let frame = FromRadio::from_my_info(MyNodeInfo {
            my_node_num: num,
            ..Default::default()
        });
        router
            .handle_from_radio(&frame, &frame.encode_to_vec(), PacketOrigin::Radio)
            .await
            .unwrap();
    }

    /// Read framed payloads from the stream until config-complete arrives.
    async fn read_replay(stream: &mut TcpStream) -> Vec<FromRadio> {
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; 4096];
        let mut frames = Vec::new();

        loop {
            let n = timeout(Duration::from_secs(5), stream.read(&mut buf))
                .await
                .expect("replay timed out")
                .unwrap();
            assert!(n > 0, "stream closed mid-replay");
            decoder.feed(&buf[..n]);
            for payload in decoder.take() {
                let frame = meshmonitor_proto::decode_from_radio(&payload).unwrap();
                let done = matches!(
                    frame.payload_variant,
                    Some(from_radio::PayloadVariant::ConfigCompleteId(_))
                );
                frames.push(frame);
                if done {
                    return frames;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_client_config_replay() {
        let config = VnsConfig {
            listen_port: 0,
            ..Default::default()
        };
        let h = harness(config).await;
        set_local(&h.router, 0x10).await;

        let mut patch = NodePatch::new(0x20);
        patch.long_name = Some("Valley".to_string());
        patch.last_heard = Some(chrono::Utc::now().timestamp());
        h.store.upsert_node(&patch).await.unwrap();

        let addr = h.server.start().await.unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();
        let want = ToRadio::want_config(77).encode_to_vec();
        stream.write_all(&encode_frame(&want).unwrap()).await.unwrap();

        let frames = read_replay(&mut stream).await;

        match &frames[0].payload_variant {
            Some(from_radio::PayloadVariant::MyInfo(info)) => {
                assert_eq!(info.my_node_num, 0x10)
            }
            other => panic!("expected my_info first, got {:?}", other),
        }
        assert!(frames.iter().any(|f| matches!(
            &f.payload_variant,
            Some(from_radio::PayloadVariant::NodeInfo(info)) if info.num == 0x20
        )));
        match &frames.last().unwrap().payload_variant {
            Some(from_radio::PayloadVariant::ConfigCompleteId(id)) => assert_eq!(*id, 77),
            other => panic!("expected config_complete last, got {:?}", other),
        }

        h.server.stop().await;
    }

    #[tokio::test]
    async fn test_client_text_packet_echoes_locally() {
        let config = VnsConfig {
            listen_port: 0,
            ..Default::default()
        };
        let h = harness(config).await;
        set_local(&h.router, 0x10).await;
        let addr = h.server.start().await.unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();

        // Native-client quirk: from = 0, the radio fills it in (S1).
        let packet = MeshPacket::text_message(0, 0xFFFF_FFFF, 0, 1000, "hi", 0, false);
        let msg = ToRadio::from_packet(packet).encode_to_vec();
        stream.write_all(&encode_frame(&msg).unwrap()).await.unwrap();

        // Wait for the echo to land in the store.
        let message = timeout(Duration::from_secs(5), async {
            loop {
                if let Some(m) = h.store.get_message(1000).await.unwrap() {
                    return m;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("local echo never stored");

        assert_eq!(message.from_node_id, "!00000010");
        assert_eq!(message.delivery_state, Some(DeliveryState::Pending));
        assert_eq!(message.request_id, Some(1000));
        assert_eq!(message.channel, 0);
        assert!(message.is_local);

        h.server.stop().await;
    }

    #[tokio::test]
    async fn test_admin_set_owner_dropped_and_audited() {
        let config = VnsConfig {
            listen_port: 0,
            ..Default::default()
        };
        let h = harness(config).await;
        set_local(&h.router, 0x10).await;
        let addr = h.server.start().await.unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();

        let owner = meshmonitor_proto::mesh::User {
            long_name: "pwned".to_string(),
            ..Default::default()
        };
        let admin = meshmonitor_proto::admin::AdminMessage::set_owner(owner, &[]);
        let packet = MeshPacket::admin(0x10, 0xabcd0001, 500, admin.encode_to_vec());
        let msg = ToRadio::from_packet(packet).encode_to_vec();
        stream.write_all(&encode_frame(&msg).unwrap()).await.unwrap();

        let entry = timeout(Duration::from_secs(5), async {
            loop {
                let entries = h.store.recent_audit(10).await.unwrap();
                if let Some(e) = entries.iter().find(|e| e.action == "admin_denied") {
                    return e.clone();
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("denial never audited");

        assert_eq!(entry.resource.as_deref(), Some("!abcd0001"));
        assert!(entry.details.as_deref().unwrap().contains("setOwner"));

        // The dropped packet never produced a message or echo.
        assert!(h.store.get_message(500).await.unwrap().is_none());

        h.server.stop().await;
    }

    #[tokio::test]
    async fn test_outbound_queue_drops_newest_on_overflow() {
        let config = VnsConfig {
            listen_port: 0,
            ..Default::default()
        };
        let h = harness(config).await;
        // Processor not started: the queue fills.

        for _ in 0..OUTBOUND_QUEUE_DEPTH {
            assert!(h.server.enqueue_outbound(vec![1]));
        }
        assert!(!h.server.enqueue_outbound(vec![2]));
    }
}
