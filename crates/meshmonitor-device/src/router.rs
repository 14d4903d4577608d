//! Packet router: per-port dispatch of decoded radio traffic
//!
//! Every FromRadio flows through here exactly once, whether it came off
//! the radio stream or is a synthetic local echo of an outbound send. The
//! router persists what it learns, resolves in-flight requests, and offers
//! genuine radio traffic to the virtual-node fan-out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use meshmonitor_proto::admin::{admin_message, decode_admin};
use meshmonitor_proto::channel::{Channel as ProtoChannel, ChannelRole};
use meshmonitor_proto::mesh::{
    from_radio, routing, Data, FromRadio, MeshPacket, NeighborInfo, Paxcount, Position, Routing,
    RouteDiscovery, RoutingError, User,
};
use meshmonitor_proto::portnum::{normalize, PortNum};
use meshmonitor_proto::telemetry::{telemetry, Telemetry};
use meshmonitor_proto::types::{i_to_degrees, traceroute_snr_db, DM_CHANNEL};
use meshmonitor_proto::{node_id_from_num, Message as _, BROADCAST_NUM};
use meshmonitor_store::{Channel, Message, Node, NodePatch, Store, TelemetryKind};

use crate::error::Result;
use crate::events::SessionEvent;
use crate::session::DeviceSession;
use crate::tracker::{RequestKind, RequestTracker, DEFAULT_ACK_WINDOW_SECS};
use meshmonitor_store::DeliveryState;

/// Where a FromRadio entered the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOrigin {
    /// Decoded off the physical radio stream.
    Radio,
    /// Synthesized locally to echo an outbound send; never rebroadcast.
    LocalEcho,
}

/// Fan-out seam implemented by the virtual node server.
#[async_trait]
pub trait Fanout: Send + Sync {
    /// Offer one raw FromRadio payload to every connected client.
    async fn broadcast(&self, raw: &[u8]);
}

/// Automation seam; implementations live outside the device engine.
#[async_trait]
pub trait AutomationHooks: Send + Sync {
    /// A new inbound text message was stored.
    async fn on_text_message(&self, message: &Message);
    /// A node row changed through an ingress event.
    async fn on_node_seen(&self, node: &Node);
}

/// Router statistics
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct RouterStats {
    pub packets: u64,
    pub text_messages: u64,
    pub positions: u64,
    pub node_infos: u64,
    pub routing_acks: u64,
    pub telemetry_samples: u64,
    pub traceroutes: u64,
    pub admin_responses: u64,
    pub unknown_ports: u64,
    pub encrypted_dropped: u64,
    pub broadcasts: u64,
}

/// Per-port dispatcher for decoded FromRadio traffic.
pub struct PacketRouter {
    store: Arc<Store>,
    tracker: Arc<RequestTracker>,
    session: Arc<DeviceSession>,
    fanout: RwLock<Option<Arc<dyn Fanout>>>,
    hooks: RwLock<Option<Arc<dyn AutomationHooks>>>,
    local_node: RwLock<Option<u32>>,
    stats: RwLock<RouterStats>,
    ack_window: Duration,
}

impl PacketRouter {
    pub fn new(
        store: Arc<Store>,
        tracker: Arc<RequestTracker>,
        session: Arc<DeviceSession>,
    ) -> Arc<Self> {
        Arc::new(PacketRouter {
            store,
            tracker,
            session,
            fanout: RwLock::new(None),
            hooks: RwLock::new(None),
            local_node: RwLock::new(None),
            stats: RwLock::new(RouterStats::default()),
            ack_window: Duration::from_secs(DEFAULT_ACK_WINDOW_SECS),
        })
    }

    pub async fn set_fanout(&self, fanout: Arc<dyn Fanout>) {
        *self.fanout.write().await = Some(fanout);
    }

    pub async fn set_hooks(&self, hooks: Arc<dyn AutomationHooks>) {
        *self.hooks.write().await = Some(hooks);
    }

    pub async fn stats(&self) -> RouterStats {
        self.stats.read().await.clone()
    }

    pub async fn local_node_num(&self) -> Option<u32> {
        *self.local_node.read().await
    }

    /// Drive the router from the session event stream.
    pub async fn handle_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::FromRadio { frame, raw } => {
                if let Err(e) = self.handle_from_radio(&frame, &raw, PacketOrigin::Radio).await {
                    warn!("Packet dispatch failed: {}", e);
                }
            }
            SessionEvent::StateChanged(state) => {
                debug!("Router observed session state {}", state);
            }
        }
    }

    /// Dispatch one FromRadio. Radio-originated frames are offered to the
    /// fan-out after local processing; local echoes never are.
    pub async fn handle_from_radio(
        &self,
        frame: &FromRadio,
        raw: &[u8],
        origin: PacketOrigin,
    ) -> Result<()> {
        let result = self.process(frame, origin).await;

        // Fan-out happens for every successfully decoded radio frame even
        // when local processing hit a store error; clients are served
        // independently of our bookkeeping.
        if origin == PacketOrigin::Radio {
            let fanout = self.fanout.read().await.clone();
            if let Some(fanout) = fanout {
                fanout.broadcast(raw).await;
                self.stats.write().await.broadcasts += 1;
            }
        }
        result
    }

    async fn process(&self, frame: &FromRadio, origin: PacketOrigin) -> Result<()> {
        match &frame.payload_variant {
            Some(from_radio::PayloadVariant::Packet(packet)) => {
                self.handle_packet(packet, origin).await?;
            }
            Some(from_radio::PayloadVariant::MyInfo(my_info)) => {
                *self.local_node.write().await = Some(my_info.my_node_num);
                let mut patch = NodePatch::new(my_info.my_node_num);
                patch.reboot_count = Some(my_info.reboot_count as i32);
                self.store.upsert_node(&patch).await?;
            }
            Some(from_radio::PayloadVariant::NodeInfo(node_info)) => {
                self.apply_node_info(node_info).await?;
            }
            Some(from_radio::PayloadVariant::Channel(channel)) => {
                self.apply_channel(channel).await?;
            }
            Some(from_radio::PayloadVariant::Metadata(metadata)) => {
                if let Some(local) = self.local_node_num().await {
                    let mut patch = NodePatch::new(local);
                    if !metadata.firmware_version.is_empty() {
                        patch.firmware_version = Some(metadata.firmware_version.clone());
                    }
                    patch.hw_model = Some(metadata.hw_model);
                    patch.role = Some(metadata.role);
                    self.store.upsert_node(&patch).await?;
                }
            }
            Some(from_radio::PayloadVariant::QueueStatus(status)) => {
                debug!(
                    "Radio queue: {}/{} free (res {})",
                    status.free, status.maxlen, status.res
                );
            }
            Some(from_radio::PayloadVariant::LogRecord(record)) => {
                debug!("Radio log [{}]: {}", record.source, record.message);
            }
            _ => {}
        }
        Ok(())
    }

    async fn handle_packet(&self, packet: &MeshPacket, origin: PacketOrigin) -> Result<()> {
        self.stats.write().await.packets += 1;

        let Some(data) = packet.decoded() else {
            // Channel-encrypted payload the radio did not decrypt for us.
            self.stats.write().await.encrypted_dropped += 1;
            return Ok(());
        };

        let local = self.local_node_num().await;
        let from_local = local.is_some() && Some(packet.from) == local;

        // A local echo only exists to surface the outbound message right
        // away; request/reply payloads on other ports must not be mistaken
        // for results.
        if origin == PacketOrigin::LocalEcho {
            if normalize(data.portnum) == PortNum::TextMessageApp as i32 {
                self.handle_text(packet, data, origin, from_local).await?;
            }
            return Ok(());
        }

        // Link bookkeeping for the sender, on any genuine ingress.
        if !from_local && packet.from != BROADCAST_NUM {
            self.touch_sender(packet).await?;
        }

        match normalize(data.portnum) {
            p if p == PortNum::TextMessageApp as i32 => {
                self.handle_text(packet, data, origin, from_local).await?;
            }
            p if p == PortNum::PositionApp as i32 => {
                self.handle_position(packet, data).await?;
            }
            p if p == PortNum::NodeinfoApp as i32 => {
                self.handle_nodeinfo(packet, data).await?;
            }
            p if p == PortNum::RoutingApp as i32 => {
                self.handle_routing(data).await?;
            }
            p if p == PortNum::AdminApp as i32 => {
                self.handle_admin(data).await?;
            }
            p if p == PortNum::PaxcounterApp as i32 => {
                self.handle_paxcounter(packet, data).await?;
            }
            p if p == PortNum::TelemetryApp as i32 => {
                self.handle_telemetry(packet, data).await?;
            }
            p if p == PortNum::TracerouteApp as i32 => {
                self.handle_traceroute(packet, data).await?;
            }
            p if p == PortNum::NeighborinfoApp as i32 => {
                self.handle_neighborinfo(data).await?;
            }
            _ => {
                self.stats.write().await.unknown_ports += 1;
                self.store
                    .store_raw_packet(
                        packet.from,
                        packet.to,
                        data.portnum,
                        &data.payload,
                        packet_time(packet),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn handle_text(
        &self,
        packet: &MeshPacket,
        data: &Data,
        origin: PacketOrigin,
        from_local: bool,
    ) -> Result<()> {
        self.stats.write().await.text_messages += 1;

        let is_broadcast = packet.to == BROADCAST_NUM;
        let channel = if is_broadcast {
            packet.channel as i32
        } else {
            DM_CHANNEL
        };
        let text = String::from_utf8_lossy(&data.payload).to_string();
        let is_local = from_local || origin == PacketOrigin::LocalEcho;

        if origin == PacketOrigin::Radio && from_local {
            // The radio transmitting our own packet back is the delivery
            // signal for the pending send.
            self.tracker.note_radio_echo(packet.id).await?;
        }

        let message = Message {
            id: packet.id,
            from_node_num: packet.from,
            to_node_num: packet.to,
            from_node_id: node_id_from_num(packet.from),
            to_node_id: node_id_from_num(packet.to),
            channel,
            text,
            timestamp: packet_time(packet),
            portnum: PortNum::TextMessageApp as i32,
            reply_id: (data.reply_id != 0).then_some(data.reply_id),
            emoji: data.emoji != 0,
            hop_start: Some(packet.hop_start as i32),
            hop_limit: Some(packet.hop_limit as i32),
            via_mqtt: packet.via_mqtt,
            delivery_state: (origin == PacketOrigin::LocalEcho).then_some(DeliveryState::Pending),
            ack_failed: false,
            request_id: is_local.then_some(packet.id),
            is_local,
            created_at: chrono::Utc::now().timestamp(),
        };
        self.store.upsert_message(&message).await?;

        if origin == PacketOrigin::LocalEcho && packet.want_ack {
            self.tracker
                .track(packet.id, RequestKind::TextMessage, packet.to, self.ack_window)
                .await;
        }

        if origin == PacketOrigin::Radio && !from_local {
            let hooks = self.hooks.read().await.clone();
            if let Some(hooks) = hooks {
                hooks.on_text_message(&message).await;
            }
        }
        Ok(())
    }

    async fn handle_position(&self, packet: &MeshPacket, data: &Data) -> Result<()> {
        self.stats.write().await.positions += 1;

        let position = meshmonitor_proto::decode_payload::<Position>(&data.payload)?;
        let mut patch = NodePatch::new(packet.from);
        patch.latitude = position.latitude_i.map(i_to_degrees);
        patch.longitude = position.longitude_i.map(i_to_degrees);
        patch.altitude = position.altitude;
        if position.time != 0 {
            patch.position_time = Some(i64::from(position.time));
        }
        self.store.upsert_node(&patch).await?;

        if data.request_id != 0 {
            self.tracker.resolve_reply(data.request_id).await;
        }
        Ok(())
    }

    async fn handle_nodeinfo(&self, packet: &MeshPacket, data: &Data) -> Result<()> {
        self.stats.write().await.node_infos += 1;

        let user = meshmonitor_proto::decode_payload::<User>(&data.payload)?;
        let mut patch = NodePatch::new(packet.from);
        apply_user(&mut patch, &user);
        self.store.upsert_node(&patch).await?;
        self.notify_node_seen(packet.from).await;
        Ok(())
    }

    async fn handle_routing(&self, data: &Data) -> Result<()> {
        self.stats.write().await.routing_acks += 1;

        if data.request_id == 0 {
            return Ok(());
        }
        let routing = meshmonitor_proto::decode_payload::<Routing>(&data.payload)?;
        match routing.variant {
            Some(routing::Variant::ErrorReason(reason)) => {
                let error = RoutingError::try_from(reason).unwrap_or(RoutingError::MaxRetransmit);
                if error == RoutingError::None {
                    self.tracker.resolve_ack(data.request_id, None).await?;
                } else {
                    self.tracker
                        .resolve_ack(data.request_id, Some(error.name()))
                        .await?;
                }
            }
            // Route request/reply traffic on the routing port carries no
            // ack semantics for us.
            _ => {}
        }
        Ok(())
    }

    async fn handle_admin(&self, data: &Data) -> Result<()> {
        self.stats.write().await.admin_responses += 1;

        let Ok(admin) = decode_admin(&data.payload) else {
            debug!("Undecodable admin payload, ignoring");
            return Ok(());
        };

        // Session passkeys ride on any admin response.
        if !admin.session_passkey.is_empty() {
            self.session
                .set_session_passkey(admin.session_passkey.clone())
                .await;
        }

        match admin.payload_variant {
            // Mirror device-side favorite/ignore changes into the store,
            // regardless of who issued the command.
            Some(admin_message::PayloadVariant::SetFavoriteNode(n)) => {
                self.store.set_favorite(n, true).await?;
            }
            Some(admin_message::PayloadVariant::RemoveFavoriteNode(n)) => {
                self.store.set_favorite(n, false).await?;
            }
            Some(admin_message::PayloadVariant::SetIgnoredNode(n)) => {
                self.store.set_ignored(n, true).await?;
            }
            Some(admin_message::PayloadVariant::RemoveIgnoredNode(n)) => {
                self.store.set_ignored(n, false).await?;
            }
            Some(admin_message::PayloadVariant::GetChannelResponse(channel)) => {
                self.apply_channel(&channel).await?;
            }
            Some(admin_message::PayloadVariant::GetOwnerResponse(user)) => {
                if let Some(local) = self.local_node_num().await {
                    let mut patch = NodePatch::new(local);
                    apply_user(&mut patch, &user);
                    self.store.upsert_node(&patch).await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn handle_paxcounter(&self, packet: &MeshPacket, data: &Data) -> Result<()> {
        let pax = meshmonitor_proto::decode_payload::<Paxcount>(&data.payload)?;
        let metrics = serde_json::json!({
            "wifi": pax.wifi,
            "ble": pax.ble,
            "uptime": pax.uptime,
        });
        self.store
            .append_telemetry(
                packet.from,
                packet_time(packet),
                TelemetryKind::Pax,
                &metrics.to_string(),
            )
            .await?;
        Ok(())
    }

    async fn handle_telemetry(&self, packet: &MeshPacket, data: &Data) -> Result<()> {
        self.stats.write().await.telemetry_samples += 1;

        let sample = meshmonitor_proto::decode_payload::<Telemetry>(&data.payload)?;
        let timestamp = if sample.time != 0 {
            i64::from(sample.time)
        } else {
            packet_time(packet)
        };

        match &sample.variant {
            Some(telemetry::Variant::DeviceMetrics(metrics)) => {
                let json = serde_json::json!({
                    "battery_level": metrics.battery_level,
                    "voltage": metrics.voltage,
                    "channel_utilization": metrics.channel_utilization,
                    "air_util_tx": metrics.air_util_tx,
                    "uptime_seconds": metrics.uptime_seconds,
                });
                self.store
                    .append_telemetry(packet.from, timestamp, TelemetryKind::Device, &json.to_string())
                    .await?;

                // Latest device metrics also live on the node row.
                let mut patch = NodePatch::new(packet.from);
                patch.battery_level = metrics.battery_level.map(|v| v as i32);
                patch.voltage = metrics.voltage.map(f64::from);
                patch.channel_utilization = metrics.channel_utilization.map(f64::from);
                patch.air_util_tx = metrics.air_util_tx.map(f64::from);
                patch.uptime_seconds = metrics.uptime_seconds.map(i64::from);
                self.store.upsert_node(&patch).await?;
            }
            Some(telemetry::Variant::EnvironmentMetrics(metrics)) => {
                let json = serde_json::json!({
                    "temperature": metrics.temperature,
                    "relative_humidity": metrics.relative_humidity,
                    "barometric_pressure": metrics.barometric_pressure,
                    "iaq": metrics.iaq,
                });
                self.store
                    .append_telemetry(
                        packet.from,
                        timestamp,
                        TelemetryKind::Environment,
                        &json.to_string(),
                    )
                    .await?;
            }
            Some(telemetry::Variant::PowerMetrics(metrics)) => {
                let json = serde_json::json!({
                    "ch1_voltage": metrics.ch1_voltage,
                    "ch1_current": metrics.ch1_current,
                    "ch2_voltage": metrics.ch2_voltage,
                    "ch2_current": metrics.ch2_current,
                    "ch3_voltage": metrics.ch3_voltage,
                    "ch3_current": metrics.ch3_current,
                });
                self.store
                    .append_telemetry(packet.from, timestamp, TelemetryKind::Power, &json.to_string())
                    .await?;
            }
            None => {}
        }

        if data.request_id != 0 {
            self.tracker.resolve_reply(data.request_id).await;
        }
        Ok(())
    }

    async fn handle_traceroute(&self, packet: &MeshPacket, data: &Data) -> Result<()> {
        self.stats.write().await.traceroutes += 1;

        let discovery = meshmonitor_proto::decode_payload::<RouteDiscovery>(&data.payload)?;

        // The reply comes from the traced node; the requester is `to`.
        let route = serde_json::to_string(&discovery.route)?;
        let route_back = serde_json::to_string(&discovery.route_back)?;
        let snr_towards = serde_json::to_string(
            &discovery
                .snr_towards
                .iter()
                .map(|&raw| traceroute_snr_db(raw))
                .collect::<Vec<_>>(),
        )?;
        let snr_back = serde_json::to_string(
            &discovery
                .snr_back
                .iter()
                .map(|&raw| traceroute_snr_db(raw))
                .collect::<Vec<_>>(),
        )?;

        self.store
            .append_traceroute(
                packet.to,
                packet.from,
                Some(&route),
                Some(&route_back),
                Some(&snr_towards),
                Some(&snr_back),
                packet_time(packet),
            )
            .await?;

        if data.request_id != 0 {
            self.tracker.resolve_reply(data.request_id).await;
        }
        Ok(())
    }

    async fn handle_neighborinfo(&self, data: &Data) -> Result<()> {
        let info = meshmonitor_proto::decode_payload::<NeighborInfo>(&data.payload)?;
        let edges: Vec<(u32, f64)> = info
            .neighbors
            .iter()
            .map(|n| (n.node_id, f64::from(n.snr)))
            .collect();
        self.store.replace_neighbors(info.node_id, &edges).await?;
        Ok(())
    }

    // === Shared bookkeeping ===

    async fn touch_sender(&self, packet: &MeshPacket) -> Result<()> {
        let mut patch = NodePatch::new(packet.from);
        patch.last_heard = Some(packet_time(packet));
        if packet.rx_snr != 0.0 {
            patch.snr = Some(f64::from(packet.rx_snr));
        }
        patch.via_mqtt = Some(packet.via_mqtt);
        patch.channel = Some(packet.channel as i32);
        if packet.hop_start > 0 && packet.hop_start >= packet.hop_limit {
            patch.hops_away = Some((packet.hop_start - packet.hop_limit) as i32);
        }
        self.store.upsert_node(&patch).await?;
        Ok(())
    }

    async fn apply_node_info(&self, node_info: &meshmonitor_proto::mesh::NodeInfo) -> Result<()> {
        self.stats.write().await.node_infos += 1;

        let mut patch = NodePatch::new(node_info.num);
        if let Some(user) = &node_info.user {
            apply_user(&mut patch, user);
        }
        if let Some(position) = &node_info.position {
            patch.latitude = position.latitude_i.map(i_to_degrees);
            patch.longitude = position.longitude_i.map(i_to_degrees);
            patch.altitude = position.altitude;
            if position.time != 0 {
                patch.position_time = Some(i64::from(position.time));
            }
        }
        if let Some(metrics) = &node_info.device_metrics {
            patch.battery_level = metrics.battery_level.map(|v| v as i32);
            patch.voltage = metrics.voltage.map(f64::from);
            patch.channel_utilization = metrics.channel_utilization.map(f64::from);
            patch.air_util_tx = metrics.air_util_tx.map(f64::from);
            patch.uptime_seconds = metrics.uptime_seconds.map(i64::from);
        }
        if node_info.snr != 0.0 {
            patch.snr = Some(f64::from(node_info.snr));
        }
        if node_info.last_heard != 0 {
            patch.last_heard = Some(i64::from(node_info.last_heard));
        }
        patch.channel = Some(node_info.channel as i32);
        patch.via_mqtt = Some(node_info.via_mqtt);
        patch.hops_away = node_info.hops_away.map(|h| h as i32);
        patch.is_favorite = Some(node_info.is_favorite);
        patch.is_ignored = Some(node_info.is_ignored);
        self.store.upsert_node(&patch).await?;

        self.notify_node_seen(node_info.num).await;
        Ok(())
    }

    async fn apply_channel(&self, channel: &ProtoChannel) -> Result<()> {
        let role = ChannelRole::try_from(channel.role).unwrap_or(ChannelRole::Disabled);
        let settings = channel.settings.clone().unwrap_or_default();
        let row = Channel {
            idx: channel.index,
            name: (!settings.name.is_empty()).then_some(settings.name),
            psk: (!settings.psk.is_empty()).then_some(settings.psk),
            role: role as i32,
            uplink_enabled: settings.uplink_enabled,
            downlink_enabled: settings.downlink_enabled,
            position_precision: settings
                .module_settings
                .map(|m| m.position_precision as i32),
            updated_at: chrono::Utc::now().timestamp(),
        };
        self.store.upsert_channel(&row).await?;
        Ok(())
    }

    async fn notify_node_seen(&self, node_num: u32) {
        let hooks = self.hooks.read().await.clone();
        if let Some(hooks) = hooks {
            match self.store.get_node(node_num).await {
                Ok(Some(node)) => hooks.on_node_seen(&node).await,
                Ok(None) => {}
                Err(e) => warn!("Node lookup for hook failed: {}", e),
            }
        }
    }
}

fn apply_user(patch: &mut NodePatch, user: &User) {
    if !user.long_name.is_empty() {
        patch.long_name = Some(user.long_name.clone());
    }
    if !user.short_name.is_empty() {
        patch.short_name = Some(user.short_name.clone());
    }
    patch.hw_model = Some(user.hw_model);
    patch.role = Some(user.role);
    if !user.public_key.is_empty() {
        patch.public_key = Some(user.public_key.clone());
    }
    patch.is_licensed = Some(user.is_licensed);
}

fn packet_time(packet: &MeshPacket) -> i64 {
    if packet.rx_time != 0 {
        i64::from(packet.rx_time)
    } else {
        chrono::Utc::now().timestamp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{DeviceSession, SessionConfig};
    use meshmonitor_proto::mesh::{MyNodeInfo, NodeInfo};
    use meshmonitor_proto::telemetry::DeviceMetrics;

    struct Harness {
        router: Arc<PacketRouter>,
        store: Arc<Store>,
        tracker: Arc<RequestTracker>,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).await.unwrap());
        let tracker = RequestTracker::new(Arc::clone(&store));
        let (session, _events) = DeviceSession::new(SessionConfig::default());
        let router = PacketRouter::new(Arc::clone(&store), Arc::clone(&tracker), session);
        Harness {
            router,
            store,
            tracker,
            _dir: dir,
        }
    }

    async fn set_local(h: &Harness, num: u32) {
        let frame = FromRadio::from_my_info(MyNodeInfo {
            my_node_num: num,
            ..Default::default()
        });
        h.router
            .handle_from_radio(&frame, &frame.encode_to_vec(), PacketOrigin::Radio)
            .await
            .unwrap();
    }

    fn radio_frame(packet: MeshPacket) -> (FromRadio, Vec<u8>) {
        let frame = FromRadio::from_packet(packet);
        let raw = frame.encode_to_vec();
        (frame, raw)
    }

    #[tokio::test]
    async fn test_incoming_text_is_stored() {
        let h = harness().await;
        set_local(&h, 0x10).await;

        let packet = MeshPacket::text_message(0x20, BROADCAST_NUM, 2, 900, "hello mesh", 0, false);
        let (frame, raw) = radio_frame(packet);
        h.router
            .handle_from_radio(&frame, &raw, PacketOrigin::Radio)
            .await
            .unwrap();

        let page = h.store.get_channel_messages(2, 10, 0).await.unwrap();
        assert_eq!(page.messages.len(), 1);
        let message = &page.messages[0];
        assert_eq!(message.text, "hello mesh");
        assert!(!message.is_local);
        assert_eq!(message.delivery_state, None);

        // Sender link bookkeeping happened.
        let node = h.store.get_node(0x20).await.unwrap().unwrap();
        assert!(node.last_heard.is_some());
    }

    #[tokio::test]
    async fn test_local_echo_pending_then_radio_echo_delivers() {
        let h = harness().await;
        set_local(&h, 0x10).await;

        // Local echo of an outbound broadcast (S1).
        let packet = MeshPacket::text_message(0x10, BROADCAST_NUM, 0, 1000, "hi", 0, false);
        let (frame, raw) = radio_frame(packet.clone());
        h.router
            .handle_from_radio(&frame, &raw, PacketOrigin::LocalEcho)
            .await
            .unwrap();

        let stored = h.store.get_message(1000).await.unwrap().unwrap();
        assert_eq!(stored.delivery_state, Some(DeliveryState::Pending));
        assert_eq!(stored.request_id, Some(1000));
        assert!(stored.is_local);
        assert_eq!(h.tracker.pending_count().await, 1);

        // Radio echoes the same packet back.
        let (frame, raw) = radio_frame(packet);
        h.router
            .handle_from_radio(&frame, &raw, PacketOrigin::Radio)
            .await
            .unwrap();

        let stored = h.store.get_message(1000).await.unwrap().unwrap();
        assert_eq!(stored.delivery_state, Some(DeliveryState::Delivered));
        // Broadcast: entry settled, no ack expected.
        assert_eq!(h.tracker.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_dm_ack_confirms_message() {
        let h = harness().await;
        set_local(&h, 0x10).await;

        let packet = MeshPacket::text_message(0x10, 0xabcd0001, 0, 5000, "yo", 0, false);
        let (frame, raw) = radio_frame(packet.clone());
        h.router
            .handle_from_radio(&frame, &raw, PacketOrigin::LocalEcho)
            .await
            .unwrap();
        let (frame, raw) = radio_frame(packet);
        h.router
            .handle_from_radio(&frame, &raw, PacketOrigin::Radio)
            .await
            .unwrap();

        // Routing ack with no error (S2).
        let ack = MeshPacket {
            from: 0xabcd0001,
            to: 0x10,
            id: 777,
            payload_variant: Some(meshmonitor_proto::mesh::mesh_packet::PayloadVariant::Decoded(
                Data {
                    portnum: PortNum::RoutingApp as i32,
                    payload: Routing {
                        variant: Some(routing::Variant::ErrorReason(RoutingError::None as i32)),
                    }
                    .encode_to_vec(),
                    request_id: 5000,
                    ..Default::default()
                },
            )),
            ..Default::default()
        };
        let (frame, raw) = radio_frame(ack);
        h.router
            .handle_from_radio(&frame, &raw, PacketOrigin::Radio)
            .await
            .unwrap();

        let stored = h.store.get_message(5000).await.unwrap().unwrap();
        assert_eq!(stored.delivery_state, Some(DeliveryState::Confirmed));
    }

    #[tokio::test]
    async fn test_dm_routing_error_fails_message() {
        let h = harness().await;
        set_local(&h, 0x10).await;

        let packet = MeshPacket::text_message(0x10, 0xabcd0001, 0, 5001, "yo", 0, false);
        let (frame, raw) = radio_frame(packet.clone());
        h.router
            .handle_from_radio(&frame, &raw, PacketOrigin::LocalEcho)
            .await
            .unwrap();
        let (frame, raw) = radio_frame(packet);
        h.router
            .handle_from_radio(&frame, &raw, PacketOrigin::Radio)
            .await
            .unwrap();

        let ack = MeshPacket {
            from: 0xabcd0001,
            to: 0x10,
            id: 778,
            payload_variant: Some(meshmonitor_proto::mesh::mesh_packet::PayloadVariant::Decoded(
                Data {
                    portnum: PortNum::RoutingApp as i32,
                    payload: Routing {
                        variant: Some(routing::Variant::ErrorReason(
                            RoutingError::Timeout as i32,
                        )),
                    }
                    .encode_to_vec(),
                    request_id: 5001,
                    ..Default::default()
                },
            )),
            ..Default::default()
        };
        let (frame, raw) = radio_frame(ack);
        h.router
            .handle_from_radio(&frame, &raw, PacketOrigin::Radio)
            .await
            .unwrap();

        let stored = h.store.get_message(5001).await.unwrap().unwrap();
        assert_eq!(stored.delivery_state, Some(DeliveryState::Failed));
        assert!(stored.ack_failed);
    }

    #[tokio::test]
    async fn test_node_info_replay_upserts_node() {
        let h = harness().await;

        let frame = FromRadio::from_node_info(NodeInfo {
            num: 0x30,
            user: Some(User {
                id: "!00000030".to_string(),
                long_name: "Ridge Repeater".to_string(),
                short_name: "RR".to_string(),
                hw_model: 9,
                role: 2,
                ..Default::default()
            }),
            snr: 6.5,
            last_heard: 1_700_000_000,
            device_metrics: Some(DeviceMetrics {
                battery_level: Some(88),
                ..Default::default()
            }),
            channel: 0,
            hops_away: Some(2),
            ..Default::default()
        });
        h.router
            .handle_from_radio(&frame, &frame.encode_to_vec(), PacketOrigin::Radio)
            .await
            .unwrap();

        let node = h.store.get_node(0x30).await.unwrap().unwrap();
        assert_eq!(node.long_name.as_deref(), Some("Ridge Repeater"));
        assert_eq!(node.battery_level, Some(88));
        assert_eq!(node.hops_away, Some(2));
        assert_eq!(node.role, Some(2));
    }

    #[tokio::test]
    async fn test_traceroute_reply_persisted_and_resolved() {
        let h = harness().await;
        set_local(&h, 0x10).await;

        h.tracker
            .track(
                9000,
                RequestKind::Traceroute,
                0x40,
                Duration::from_secs(60),
            )
            .await;

        let reply = MeshPacket {
            from: 0x40,
            to: 0x10,
            id: 901,
            payload_variant: Some(meshmonitor_proto::mesh::mesh_packet::PayloadVariant::Decoded(
                Data {
                    portnum: PortNum::TracerouteApp as i32,
                    payload: RouteDiscovery {
                        route: vec![0x99],
                        snr_towards: vec![24, -128],
                        route_back: vec![0x99],
                        snr_back: vec![16, 8],
                    }
                    .encode_to_vec(),
                    request_id: 9000,
                    ..Default::default()
                },
            )),
            ..Default::default()
        };
        let (frame, raw) = radio_frame(reply);
        h.router
            .handle_from_radio(&frame, &raw, PacketOrigin::Radio)
            .await
            .unwrap();

        let records = h.store.recent_traceroutes(10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].is_failed());
        assert_eq!(records[0].from_node_num, 0x10);
        assert_eq!(records[0].to_node_num, 0x40);
        // Unknown-SNR sentinel stored as null, not as -32 dB.
        assert_eq!(records[0].snr_towards.as_deref(), Some("[6.0,null]"));
        assert_eq!(h.tracker.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_port_stores_raw_packet() {
        let h = harness().await;
        set_local(&h, 0x10).await;

        let packet = MeshPacket {
            from: 0x50,
            to: 0x10,
            id: 333,
            payload_variant: Some(meshmonitor_proto::mesh::mesh_packet::PayloadVariant::Decoded(
                Data {
                    portnum: PortNum::SerialApp as i32,
                    payload: vec![1, 2, 3],
                    ..Default::default()
                },
            )),
            ..Default::default()
        };
        let (frame, raw) = radio_frame(packet);
        h.router
            .handle_from_radio(&frame, &raw, PacketOrigin::Radio)
            .await
            .unwrap();

        let packets = h.store.recent_raw_packets(10).await.unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].portnum, PortNum::SerialApp as i32);
        assert_eq!(h.router.stats().await.unknown_ports, 1);
    }

    #[tokio::test]
    async fn test_telemetry_updates_node_metrics() {
        let h = harness().await;
        set_local(&h, 0x10).await;

        let packet = MeshPacket {
            from: 0x60,
            to: BROADCAST_NUM,
            id: 444,
            rx_time: 1_700_000_100,
            payload_variant: Some(meshmonitor_proto::mesh::mesh_packet::PayloadVariant::Decoded(
                Data {
                    portnum: PortNum::TelemetryApp as i32,
                    payload: Telemetry {
                        time: 1_700_000_050,
                        variant: Some(telemetry::Variant::DeviceMetrics(DeviceMetrics {
                            battery_level: Some(42),
                            voltage: Some(3.7),
                            ..Default::default()
                        })),
                    }
                    .encode_to_vec(),
                    ..Default::default()
                },
            )),
            ..Default::default()
        };
        let (frame, raw) = radio_frame(packet);
        h.router
            .handle_from_radio(&frame, &raw, PacketOrigin::Radio)
            .await
            .unwrap();

        assert_eq!(h.store.telemetry_node_nums().await.unwrap(), vec![0x60]);
        let node = h.store.get_node(0x60).await.unwrap().unwrap();
        assert_eq!(node.battery_level, Some(42));
    }
}
