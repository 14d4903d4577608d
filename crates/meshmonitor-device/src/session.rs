//! Device session: the single owner of the physical-radio stream
//!
//! The supervisor task drives the lifecycle (connect → configure → operate
//! → reconnect with backoff). One writer task is the only thing that
//! touches the outbound stream, which makes the egress byte order the
//! serialization point for the whole process. Ingress is decoded here and
//! handed to the packet router as [`SessionEvent`]s.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Instant};
use tracing::{debug, info, warn};

use meshmonitor_proto::framing::{encode_frame, FrameDecoder};
use meshmonitor_proto::mesh::{decode_from_radio, from_radio, ToRadio};
use meshmonitor_proto::Message as _;

use crate::error::{DeviceError, Result};
use crate::events::{CachedConfigRecord, ConfigRecordKind, SessionEvent, SessionState};

/// Want-config id requesting every config section.
pub const WANT_CONFIG_ALL: u32 = 0xFFFF_FFFF;

const CONNECT_TIMEOUT_SECS: u64 = 10;
const REBOOT_WAIT_SECS: u64 = 30;
const MAX_BACKOFF_SECS: u64 = 60;
const EGRESS_QUEUE_DEPTH: usize = 64;
const READ_BUF_LEN: usize = 4096;

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub radio_host: String,
    pub radio_port: u16,
    /// No ingress for this long while Connected flips the session to
    /// NodeOffline (the TCP stream stays up).
    pub unresponsive_after_secs: u64,
    /// Cadence of the offline probe / keep-alive heartbeat.
    pub probe_interval_secs: u64,
    /// A flapping link re-signals "node offline" at warn level at most
    /// once per this window; transitions inside it log at debug only.
    pub offline_signal_cooldown_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            radio_host: "127.0.0.1".to_string(),
            radio_port: 4403,
            unresponsive_after_secs: 30 * 60,
            probe_interval_secs: 60,
            offline_signal_cooldown_secs: 6 * 3600,
        }
    }
}

/// The physical-radio session.
pub struct DeviceSession {
    config: SessionConfig,
    state_tx: watch::Sender<SessionState>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,

    egress_tx: RwLock<Option<mpsc::Sender<Vec<u8>>>>,
    my_node_num: RwLock<Option<u32>>,
    session_passkey: RwLock<Vec<u8>>,
    firmware_version: RwLock<Option<String>>,
    reboot_count: RwLock<Option<u32>>,
    cached_config: RwLock<Vec<CachedConfigRecord>>,
    last_rx: RwLock<Instant>,
    last_offline_signal: RwLock<Option<Instant>>,

    decode_failures: AtomicU64,
    closed: AtomicBool,
    user_disconnected: AtomicBool,
    reboot_wait: AtomicBool,

    /// Wakes the supervisor out of the user-disconnected parking state.
    resume: Notify,
    /// Tears down the current connection without closing the session.
    conn_abort: Notify,

    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DeviceSession {
    /// Create a session; the returned receiver carries every ingress event.
    pub fn new(config: SessionConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let session = Arc::new(DeviceSession {
            config,
            state_tx,
            event_tx,
            egress_tx: RwLock::new(None),
            my_node_num: RwLock::new(None),
            session_passkey: RwLock::new(Vec::new()),
            firmware_version: RwLock::new(None),
            reboot_count: RwLock::new(None),
            cached_config: RwLock::new(Vec::new()),
            last_rx: RwLock::new(Instant::now()),
            last_offline_signal: RwLock::new(None),
            decode_failures: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            user_disconnected: AtomicBool::new(false),
            reboot_wait: AtomicBool::new(false),
            resume: Notify::new(),
            conn_abort: Notify::new(),
            tasks: Mutex::new(Vec::new()),
        });

        (session, event_rx)
    }

    /// Spawn the supervisor and offline-probe tasks.
    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;

        let session = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            session.run_supervisor().await;
        }));

        let session = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            session.run_probe().await;
        }));
    }

    // === Observability ===

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub async fn my_node_num(&self) -> Option<u32> {
        *self.my_node_num.read().await
    }

    pub async fn my_node_id(&self) -> Option<String> {
        self.my_node_num
            .read()
            .await
            .map(meshmonitor_proto::node_id_from_num)
    }

    pub async fn firmware_version(&self) -> Option<String> {
        self.firmware_version.read().await.clone()
    }

    pub async fn reboot_count(&self) -> Option<u32> {
        *self.reboot_count.read().await
    }

    pub async fn session_passkey(&self) -> Vec<u8> {
        self.session_passkey.read().await.clone()
    }

    /// Cache the opaque admin passkey from a session-key config response.
    pub async fn set_session_passkey(&self, passkey: Vec<u8>) {
        if !passkey.is_empty() {
            *self.session_passkey.write().await = passkey;
        }
    }

    /// The init-config records collected during the last Configuring phase,
    /// in arrival order. Read-only outside that phase.
    pub async fn cached_init_config(&self) -> Vec<CachedConfigRecord> {
        self.cached_config.read().await.clone()
    }

    pub fn decode_failure_count(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }

    // === Egress ===

    /// Enqueue an already-encoded ToRadio payload.
    ///
    /// This is the raw path used by the virtual node server; no admin
    /// filtering happens here (that is the caller's job). The payload is
    /// framed and handed to the single writer.
    pub async fn send_raw(&self, payload: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DeviceError::Closed);
        }
        let frame = encode_frame(payload)?;
        let guard = self.egress_tx.read().await;
        let tx = guard.as_ref().ok_or(DeviceError::NotConnected)?;
        tx.send(frame).await.map_err(|_| DeviceError::Closed)
    }

    /// Encode and enqueue a ToRadio message.
    pub async fn send_to_radio(&self, msg: &ToRadio) -> Result<()> {
        self.send_raw(&msg.encode_to_vec()).await
    }

    // === Lifecycle commands ===

    /// Re-run the config download on the live connection (NodeDB re-sync).
    pub async fn request_config_sync(&self) -> Result<()> {
        self.begin_configuring().await
    }

    /// Operator-requested disconnect; no reconnect until [`Self::reconnect`].
    pub fn user_disconnect(&self) {
        self.user_disconnected.store(true, Ordering::SeqCst);
        self.set_state(SessionState::UserDisconnected);
        self.conn_abort.notify_waiters();
    }

    /// Resume after a user disconnect.
    pub fn reconnect(&self) {
        self.user_disconnected.store(false, Ordering::SeqCst);
        // notify_one stores a permit, so the wakeup is not lost when the
        // supervisor has not parked yet.
        self.resume.notify_one();
    }

    /// A reboot admin command was acknowledged: drop the stream, wait out
    /// the restart, then reconnect and reconfigure.
    pub fn expect_reboot(&self) {
        self.reboot_wait.store(true, Ordering::SeqCst);
        self.set_state(SessionState::Rebooting);
        self.conn_abort.notify_waiters();
    }

    /// Idempotent shutdown; queued writes fail with `Closed`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.conn_abort.notify_waiters();
        self.resume.notify_one();
        *self.egress_tx.write().await = None;

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        self.set_state(SessionState::Disconnected);
    }

    // === Internals ===

    fn set_state(&self, state: SessionState) {
        let changed = self.state_tx.send_modify_if_changed(state);
        if changed {
            debug!("Session state -> {}", state);
            let _ = self.event_tx.send(SessionEvent::StateChanged(state));
        }
    }

    async fn begin_configuring(&self) -> Result<()> {
        self.cached_config.write().await.clear();
        self.set_state(SessionState::Configuring);
        self.send_to_radio(&ToRadio::want_config(WANT_CONFIG_ALL))
            .await
    }

    async fn run_supervisor(self: Arc<Self>) {
        let mut backoff = 1u64;

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            if self.user_disconnected.load(Ordering::SeqCst) {
                self.resume.notified().await;
                continue;
            }
            if self.reboot_wait.swap(false, Ordering::SeqCst) {
                info!("Waiting {}s for radio reboot", REBOOT_WAIT_SECS);
                sleep(Duration::from_secs(REBOOT_WAIT_SECS)).await;
            }

            self.set_state(SessionState::Connecting);
            let addr = format!("{}:{}", self.config.radio_host, self.config.radio_port);

            match timeout(
                Duration::from_secs(CONNECT_TIMEOUT_SECS),
                TcpStream::connect(&addr),
            )
            .await
            {
                Ok(Ok(stream)) => {
                    info!("Connected to radio at {}", addr);
                    backoff = 1;
                    self.serve_connection(stream).await;
                    if !self.closed.load(Ordering::SeqCst)
                        && !self.user_disconnected.load(Ordering::SeqCst)
                        && !self.reboot_wait.load(Ordering::SeqCst)
                    {
                        self.set_state(SessionState::Disconnected);
                    }
                }
                Ok(Err(e)) => {
                    warn!("Radio connect to {} failed: {}", addr, e);
                    self.set_state(SessionState::Disconnected);
                    sleep(Duration::from_secs(backoff)).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
                }
                Err(_) => {
                    warn!("Radio connect to {} timed out", addr);
                    self.set_state(SessionState::Disconnected);
                    sleep(Duration::from_secs(backoff)).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
                }
            }
        }
    }

    /// Run one connection to completion: writer task + inline read loop.
    async fn serve_connection(&self, stream: TcpStream) {
        let (mut read_half, mut write_half) = stream.into_split();

        let (egress_tx, mut egress_rx) = mpsc::channel::<Vec<u8>>(EGRESS_QUEUE_DEPTH);
        *self.egress_tx.write().await = Some(egress_tx);

        let writer = tokio::spawn(async move {
            while let Some(frame) = egress_rx.recv().await {
                if let Err(e) = write_half.write_all(&frame).await {
                    debug!("Radio write failed: {}", e);
                    break;
                }
            }
        });

        *self.last_rx.write().await = Instant::now();
        if let Err(e) = self.begin_configuring().await {
            warn!("Failed to start config download: {}", e);
        }

        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; READ_BUF_LEN];

        loop {
            tokio::select! {
                read = read_half.read(&mut buf) => match read {
                    Ok(0) => {
                        debug!("Radio closed the stream");
                        break;
                    }
                    Ok(n) => {
                        decoder.feed(&buf[..n]);
                        for payload in decoder.take() {
                            match decode_from_radio(&payload) {
                                Ok(frame) => self.handle_ingress(frame, payload).await,
                                Err(e) => {
                                    self.decode_failures.fetch_add(1, Ordering::Relaxed);
                                    debug!("Dropping undecodable payload: {}", e);
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Radio read failed: {}", e);
                        break;
                    }
                },
                _ = self.conn_abort.notified() => {
                    debug!("Connection teardown requested");
                    break;
                }
            }
        }

        // Dropping the sender stops the writer once its queue drains.
        *self.egress_tx.write().await = None;
        let _ = writer.await;
    }

    async fn handle_ingress(&self, frame: meshmonitor_proto::FromRadio, raw: Vec<u8>) {
        *self.last_rx.write().await = Instant::now();

        if self.state() == SessionState::NodeOffline {
            info!("Radio ingress resumed; node responsive again");
            self.set_state(SessionState::Connected);
        }

        match &frame.payload_variant {
            Some(from_radio::PayloadVariant::MyInfo(my_info)) => {
                *self.my_node_num.write().await = Some(my_info.my_node_num);
                *self.reboot_count.write().await = Some(my_info.reboot_count);
            }
            Some(from_radio::PayloadVariant::Metadata(metadata)) => {
                if !metadata.firmware_version.is_empty() {
                    *self.firmware_version.write().await =
                        Some(metadata.firmware_version.clone());
                }
            }
            _ => {}
        }

        if self.state() == SessionState::Configuring {
            let kind = ConfigRecordKind::of(&frame);
            if kind == ConfigRecordKind::ConfigComplete {
                let count = self.cached_config.read().await.len();
                info!("Config download complete ({} records cached)", count);
                self.set_state(SessionState::Connected);
            } else {
                self.cached_config.write().await.push(CachedConfigRecord {
                    kind,
                    raw: raw.clone(),
                });
            }
        }

        let _ = self.event_tx.send(SessionEvent::FromRadio { frame, raw });
    }

    /// Offline probe and keep-alive heartbeat.
    async fn run_probe(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(self.config.probe_interval_secs.max(1)));
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if self.closed.load(Ordering::SeqCst) {
                return;
            }

            let idle = self.last_rx.read().await.elapsed();
            if self.state() == SessionState::Connected
                && idle > Duration::from_secs(self.config.unresponsive_after_secs)
            {
                let cooldown = Duration::from_secs(self.config.offline_signal_cooldown_secs);
                let mut last_signal = self.last_offline_signal.write().await;
                if offline_signal_due(*last_signal, cooldown) {
                    warn!(
                        "No radio ingress for {}s; marking node offline",
                        idle.as_secs()
                    );
                    *last_signal = Some(Instant::now());
                } else {
                    debug!(
                        "No radio ingress for {}s; node offline again within cooldown",
                        idle.as_secs()
                    );
                }
                self.set_state(SessionState::NodeOffline);
            }

            if self.state().is_connected() {
                let heartbeat = ToRadio {
                    payload_variant: Some(
                        meshmonitor_proto::mesh::to_radio::PayloadVariant::Heartbeat(
                            meshmonitor_proto::mesh::Heartbeat {},
                        ),
                    ),
                };
                if let Err(e) = self.send_to_radio(&heartbeat).await {
                    debug!("Heartbeat not sent: {}", e);
                }
            }
        }
    }
}

/// The state transition itself always happens; only the warn-level signal
/// is rate-limited across a flapping link.
fn offline_signal_due(last_signal: Option<Instant>, cooldown: Duration) -> bool {
    match last_signal {
        Some(at) => at.elapsed() >= cooldown,
        None => true,
    }
}

/// watch::Sender has no conditional send; this keeps state transitions
/// single-sourced without waking watchers on no-ops.
trait SendIfChanged {
    fn send_modify_if_changed(&self, state: SessionState) -> bool;
}

impl SendIfChanged for watch::Sender<SessionState> {
    fn send_modify_if_changed(&self, state: SessionState) -> bool {
        let mut changed = false;
        self.send_if_modified(|current| {
            if *current != state {
                *current = state;
                changed = true;
                true
            } else {
                false
            }
        });
        changed
    }
}
