//! Outbound send paths shared by the HTTP API and the automations
//!
//! Everything that leaves for the mesh from this process goes through
//! here: mint a packet id, run the local echo through the router (so the
//! UI sees the pending message instantly), register the pending request,
//! then hand the packet to the session writer.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};

use meshmonitor_device::tracker::{DEFAULT_ACK_WINDOW_SECS, DEFAULT_REPLY_WINDOW_SECS};
use meshmonitor_device::{
    DeviceSession, PacketOrigin, PacketRouter, RequestKind, RequestTracker,
};
use meshmonitor_proto::admin::AdminMessage;
use meshmonitor_proto::mesh::{FromRadio, MeshPacket, Position, ToRadio};
use meshmonitor_proto::types::degrees_to_i;
use meshmonitor_proto::{Message as _, BROADCAST_NUM};
use meshmonitor_store::Store;

const ACK_WINDOW: Duration = Duration::from_secs(DEFAULT_ACK_WINDOW_SECS);
const REPLY_WINDOW: Duration = Duration::from_secs(DEFAULT_REPLY_WINDOW_SECS);

/// Shared sender for locally originated traffic.
pub struct Outbox {
    store: Arc<Store>,
    session: Arc<DeviceSession>,
    router: Arc<PacketRouter>,
    tracker: Arc<RequestTracker>,
}

impl Outbox {
    pub fn new(
        store: Arc<Store>,
        session: Arc<DeviceSession>,
        router: Arc<PacketRouter>,
        tracker: Arc<RequestTracker>,
    ) -> Arc<Self> {
        Arc::new(Outbox {
            store,
            session,
            router,
            tracker,
        })
    }

    async fn local_node_num(&self) -> Result<u32> {
        match self.router.local_node_num().await {
            Some(num) => Ok(num),
            None => self
                .session
                .my_node_num()
                .await
                .ok_or_else(|| anyhow!("Local node not known yet")),
        }
    }

    /// Send a text message or reaction. Returns the minted request id.
    pub async fn send_text(
        &self,
        text: &str,
        channel: Option<u32>,
        destination: Option<u32>,
        reply_id: Option<u32>,
        emoji: bool,
    ) -> Result<u32> {
        let local = self.local_node_num().await?;
        let id = RequestTracker::mint_packet_id();

        let (to, channel) = match destination {
            Some(dest) if dest != BROADCAST_NUM => (dest, 0),
            _ => (BROADCAST_NUM, channel.unwrap_or(0)),
        };

        let packet = MeshPacket::text_message(
            local,
            to,
            channel,
            id,
            text,
            reply_id.unwrap_or(0),
            emoji,
        );

        // Local echo stores the pending message and registers the ack
        // tracking; the enqueue races the radio echo safely because the
        // message upsert is idempotent.
        let echo = FromRadio::from_packet(packet.clone());
        self.router
            .handle_from_radio(&echo, &echo.encode_to_vec(), PacketOrigin::LocalEcho)
            .await?;

        self.session
            .send_to_radio(&ToRadio::from_packet(packet))
            .await?;
        Ok(id)
    }

    /// Issue a traceroute toward `destination`.
    pub async fn send_traceroute(&self, destination: u32) -> Result<u32> {
        let local = self.local_node_num().await?;
        let id = RequestTracker::mint_packet_id();

        self.tracker
            .track(id, RequestKind::Traceroute, destination, REPLY_WINDOW)
            .await;
        let packet = MeshPacket::traceroute_request(local, destination, 0, id);
        self.session
            .send_to_radio(&ToRadio::from_packet(packet))
            .await?;
        Ok(id)
    }

    /// Position exchange: send our stored fix with want-response set.
    pub async fn send_position_request(&self, destination: u32) -> Result<u32> {
        let local = self.local_node_num().await?;
        let id = RequestTracker::mint_packet_id();

        let own = match self.store.get_node(local).await? {
            Some(node) => Position {
                latitude_i: node.latitude.map(degrees_to_i),
                longitude_i: node.longitude.map(degrees_to_i),
                altitude: node.altitude,
                time: node.position_time.unwrap_or(0) as u32,
                ..Default::default()
            },
            None => Position::default(),
        };

        self.tracker
            .track(id, RequestKind::PositionExchange, destination, REPLY_WINDOW)
            .await;
        let packet = MeshPacket::position_request(local, destination, 0, id, own);
        self.session
            .send_to_radio(&ToRadio::from_packet(packet))
            .await?;
        Ok(id)
    }

    /// Ask a node for a fresh telemetry sample.
    pub async fn send_telemetry_request(&self, destination: u32) -> Result<u32> {
        let local = self.local_node_num().await?;
        let id = RequestTracker::mint_packet_id();

        self.tracker
            .track(id, RequestKind::TelemetryRequest, destination, REPLY_WINDOW)
            .await;
        let packet = MeshPacket::telemetry_request(local, destination, 0, id);
        self.session
            .send_to_radio(&ToRadio::from_packet(packet))
            .await?;
        Ok(id)
    }

    /// Send an admin command with the cached session passkey attached.
    pub async fn send_admin(
        &self,
        destination: u32,
        mut admin: AdminMessage,
    ) -> Result<u32> {
        let local = self.local_node_num().await?;
        let id = RequestTracker::mint_packet_id();

        if admin.session_passkey.is_empty() {
            admin.session_passkey = self.session.session_passkey().await;
        }

        self.tracker
            .track(id, RequestKind::Admin, destination, ACK_WINDOW)
            .await;
        let packet = MeshPacket::admin(local, destination, id, admin.encode_to_vec());
        self.session
            .send_to_radio(&ToRadio::from_packet(packet))
            .await?;
        Ok(id)
    }

    /// Admin command addressed to the local radio itself.
    pub async fn send_admin_to_self(&self, admin: AdminMessage) -> Result<u32> {
        let local = self.local_node_num().await?;
        self.send_admin(local, admin).await
    }
}
