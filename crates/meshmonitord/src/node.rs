use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use meshmonitor_device::{
    DeviceSession, PacketRouter, RequestTracker, SessionConfig, SessionEvent, SessionState,
};
use meshmonitor_proto::admin::AdminMessage;
use meshmonitor_store::Store;
use meshmonitor_vns::{VirtualNodeServer, VnsConfig};

use crate::api::{ApiServer, ApiState};
use crate::automations::AutomationEngine;
use crate::config::Config;
use crate::outbox::Outbox;

/// Main monitor orchestrator
pub struct Monitor {
    config: Config,
    store: Arc<Store>,
    session: Arc<DeviceSession>,
    tracker: Arc<RequestTracker>,
    router: Arc<PacketRouter>,
    vns: Option<Arc<VirtualNodeServer>>,
    api_server: Option<ApiServer>,
    automations: Arc<AutomationEngine>,
    outbox: Arc<Outbox>,
    event_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    background_tasks: Vec<JoinHandle<()>>,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl Monitor {
    pub async fn new(config: Config) -> Result<Self> {
        info!("Initializing monitor components...");

        // Storage
        let store = Arc::new(Store::open(&config.data_directory).await?);
        info!("✓ Store initialized");

        // Device session
        let session_config = SessionConfig {
            radio_host: config.radio.host.clone(),
            radio_port: config.radio.port,
            unresponsive_after_secs: u64::from(config.nodes.inactive_node_threshold_hours)
                * 3600,
            probe_interval_secs: u64::from(config.nodes.inactive_node_check_interval_minutes)
                .max(1)
                * 60,
            offline_signal_cooldown_secs: u64::from(config.nodes.inactive_node_cooldown_hours)
                * 3600,
        };
        let (session, event_rx) = DeviceSession::new(session_config);
        info!(
            "✓ Device session initialized (radio {}:{})",
            config.radio.host, config.radio.port
        );

        // Request tracker + packet router
        let tracker = RequestTracker::new(Arc::clone(&store));
        let router = PacketRouter::new(
            Arc::clone(&store),
            Arc::clone(&tracker),
            Arc::clone(&session),
        );
        info!("✓ Packet router initialized");

        // Shared outbound send path
        let outbox = Outbox::new(
            Arc::clone(&store),
            Arc::clone(&session),
            Arc::clone(&router),
            Arc::clone(&tracker),
        );

        // Automations
        let automations = AutomationEngine::new(
            Arc::clone(&store),
            Arc::clone(&outbox),
            config.traceroute.clone(),
        );
        router.set_hooks(automations.clone()).await;
        info!("✓ Automations initialized");

        // Virtual node server
        let vns = if config.vns.enabled {
            let vns_config = VnsConfig {
                listen_port: config.vns.listen_port,
                allow_admin_commands: config.vns.allow_admin_commands,
                max_node_age_hours: config.nodes.max_node_age_hours,
                idle_timeout_secs: config.vns.idle_timeout_secs,
            };
            let server = VirtualNodeServer::new(
                vns_config,
                Arc::clone(&store),
                Arc::clone(&session),
                Arc::clone(&router),
            );
            router.set_fanout(server.clone()).await;
            info!(
                "✓ Virtual node server initialized (port {}, admin commands {})",
                config.vns.listen_port,
                if config.vns.allow_admin_commands {
                    "allowed"
                } else {
                    "filtered"
                }
            );
            Some(server)
        } else {
            info!("Virtual node server disabled");
            None
        };

        // API server
        let api_server = if config.api.enabled {
            let state = Arc::new(ApiState {
                config: config.clone(),
                store: Arc::clone(&store),
                session: Arc::clone(&session),
                router: Arc::clone(&router),
                outbox: Arc::clone(&outbox),
                vns: vns.clone(),
            });
            let server = ApiServer::new(config.api.clone(), state);
            info!(
                "✓ API server initialized on {}:{}",
                config.api.bind, config.api.port
            );
            Some(server)
        } else {
            info!("API server disabled");
            None
        };

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        Ok(Self {
            config,
            store,
            session,
            tracker,
            router,
            vns,
            api_server,
            automations,
            outbox,
            event_rx: Some(event_rx),
            background_tasks: Vec::new(),
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub async fn run(&mut self) -> Result<()> {
        info!("Starting MeshMonitor services...");

        // Event pump: the single consumer of session ingress, which makes
        // router dispatch (and therefore VNS broadcast) strictly ordered.
        let router = Arc::clone(&self.router);
        let outbox = Arc::clone(&self.outbox);
        let mut event_rx = self
            .event_rx
            .take()
            .expect("run() called twice");
        self.background_tasks.push(tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                if matches!(event, SessionEvent::StateChanged(SessionState::Connected)) {
                    // Newer firmware wants the session passkey on admin
                    // commands; fetch one after every (re)configure.
                    if let Err(e) = outbox
                        .send_admin_to_self(AdminMessage::get_session_key())
                        .await
                    {
                        warn!("Session key request failed: {}", e);
                    }
                }
                router.handle_event(event).await;
            }
        }));

        self.tracker.start().await;
        self.session.start().await;
        info!("✓ Device session running");

        if let Some(vns) = &self.vns {
            vns.start().await?;
            info!("✓ Virtual node server running");
        }

        if let Some(api_server) = &self.api_server {
            let server_handle = api_server.start().await?;
            info!("✓ API server running");

            tokio::spawn(async move {
                if let Err(e) = server_handle.await {
                    error!("API server error: {}", e);
                }
            });
        }

        self.automations.start().await;
        info!("✓ Automations running");

        self.start_retention_task();

        info!("═══════════════════════════════════════════════");
        info!("  MeshMonitor is now running");
        info!("═══════════════════════════════════════════════");
        if self.config.api.enabled {
            info!(
                "  API: http://{}:{}",
                self.config.api.bind, self.config.api.port
            );
        }
        if self.config.vns.enabled {
            info!("  Virtual node port: {}", self.config.vns.listen_port);
        }
        info!("  Radio: {}:{}", self.config.radio.host, self.config.radio.port);
        info!("  Data Dir: {}", self.config.data_directory.display());
        info!("═══════════════════════════════════════════════");

        self.wait_for_shutdown().await;

        info!("Shutting down MeshMonitor...");
        self.shutdown().await?;

        Ok(())
    }

    fn start_retention_task(&mut self) {
        let store = Arc::clone(&self.store);
        let retention = self.config.retention.clone();
        self.background_tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3600));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store
                    .prune_telemetry(
                        retention.favorite_telemetry_hours,
                        retention.telemetry_hours,
                    )
                    .await
                {
                    Ok(0) => {}
                    Ok(n) => info!("Pruned {} telemetry samples", n),
                    Err(e) => warn!("Telemetry pruning failed: {}", e),
                }
                if let Err(e) = store.prune_raw_packets(retention.raw_packets_keep).await {
                    warn!("Raw packet pruning failed: {}", e);
                }
            }
        }));
    }

    async fn wait_for_shutdown(&mut self) {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C signal");
            }
            _ = self.shutdown_rx.recv() => {
                info!("Received shutdown signal");
            }
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        info!("Stopping automations...");
        self.automations.stop().await;

        if let Some(vns) = &self.vns {
            info!("Stopping virtual node server...");
            vns.stop().await;
        }

        info!("Stopping device session...");
        self.session.close().await;
        self.tracker.stop().await;

        for task in self.background_tasks.drain(..) {
            task.abort();
        }

        info!("Closing store...");
        self.store.close().await;

        info!("Shutdown complete");
        Ok(())
    }

    pub fn shutdown_handle(&self) -> mpsc::Sender<()> {
        self.shutdown_tx.clone()
    }
}
