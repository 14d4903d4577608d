//! Poll snapshot: the single consistent view the web UI consumes

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use meshmonitor_device::{DeviceSession, SessionState};
use meshmonitor_store::{Channel, Message, Node, Store, TracerouteRecord};

use crate::config::Config;

/// Messages included in one snapshot.
const RECENT_MESSAGE_COUNT: u32 = 50;

/// Traceroutes included in one snapshot.
const RECENT_TRACEROUTE_COUNT: u32 = 25;

/// Connection bits derived from the session state.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub node_responsive: bool,
    pub configuring: bool,
    pub user_disconnected: bool,
    pub state: String,
    pub local_node_id: Option<String>,
    pub firmware_version: Option<String>,
}

impl ConnectionStatus {
    pub async fn derive(session: &Arc<DeviceSession>) -> Self {
        let state = session.state();
        ConnectionStatus {
            connected: state.is_connected(),
            node_responsive: state == SessionState::Connected,
            configuring: state == SessionState::Configuring,
            user_disconnected: state == SessionState::UserDisconnected,
            state: state.to_string(),
            local_node_id: session.my_node_id().await,
            firmware_version: session.firmware_version().await,
        }
    }
}

/// Static device facts for the UI header.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub node_num: Option<u32>,
    pub node_id: Option<String>,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub firmware_version: Option<String>,
    pub reboot_count: Option<u32>,
}

/// Behavior knobs the UI needs to render send surfaces and filters.
#[derive(Debug, Clone, Serialize)]
pub struct UiConfig {
    pub max_node_age_hours: u32,
    pub traceroute_interval_minutes: u32,
    pub allow_admin_commands: bool,
    pub version_check_disabled: bool,
    pub auto_upgrade_enabled: bool,
}

/// The whole poll payload.
#[derive(Debug, Clone, Serialize)]
pub struct PollSnapshot {
    pub connection: ConnectionStatus,
    pub nodes: Vec<Node>,
    pub messages: Vec<Message>,
    pub channels: Vec<Channel>,
    pub unread_counts: HashMap<String, i64>,
    pub telemetry_nodes: Vec<String>,
    pub traceroutes: Vec<TracerouteRecord>,
    pub device: DeviceInfo,
    pub config: UiConfig,
}

/// Materialize one point-in-time snapshot. Reads never block ingestion;
/// each store query sees its own consistent view.
pub async fn build_snapshot(
    store: &Arc<Store>,
    session: &Arc<DeviceSession>,
    config: &Config,
) -> Result<PollSnapshot> {
    let connection = ConnectionStatus::derive(session).await;
    let local_node_id = connection.local_node_id.clone().unwrap_or_default();

    let nodes = store.get_active_nodes(config.nodes.max_node_age_hours).await?;
    let messages = store.recent_messages(RECENT_MESSAGE_COUNT).await?;
    // Disabled channels stay in the payload; the UI excludes them from
    // send surfaces by role.
    let channels = store.get_channels().await?;
    let unread_counts: HashMap<String, i64> = store
        .unread_counts(&local_node_id)
        .await?
        .into_iter()
        .collect();
    let telemetry_nodes = store
        .telemetry_node_nums()
        .await?
        .into_iter()
        .map(meshmonitor_proto::node_id_from_num)
        .collect();
    let traceroutes = store.recent_traceroutes(RECENT_TRACEROUTE_COUNT).await?;

    let local_num = session.my_node_num().await;
    let local_row = match local_num {
        Some(num) => store.get_node(num).await?,
        None => None,
    };
    let device = DeviceInfo {
        node_num: local_num,
        node_id: connection.local_node_id.clone(),
        long_name: local_row.as_ref().and_then(|n| n.long_name.clone()),
        short_name: local_row.as_ref().and_then(|n| n.short_name.clone()),
        firmware_version: connection.firmware_version.clone(),
        reboot_count: session.reboot_count().await,
    };

    Ok(PollSnapshot {
        connection,
        nodes,
        messages,
        channels,
        unread_counts,
        telemetry_nodes,
        traceroutes,
        device,
        config: UiConfig {
            max_node_age_hours: config.nodes.max_node_age_hours,
            traceroute_interval_minutes: config.traceroute.interval_minutes,
            allow_admin_commands: config.vns.allow_admin_commands,
            version_check_disabled: config.updates.version_check_disabled,
            auto_upgrade_enabled: config.updates.auto_upgrade_enabled,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshmonitor_device::SessionConfig;
    use meshmonitor_store::{DeliveryState, NodePatch};

    async fn harness() -> (Arc<Store>, Arc<DeviceSession>, Config, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).await.unwrap());
        let (session, _events) = DeviceSession::new(SessionConfig::default());
        let config = Config::load(
            Some(dir.path().join("none.yaml")),
            Some(dir.path().to_path_buf()),
        )
        .unwrap();
        (store, session, config, dir)
    }

    fn message(id: u32, from: u32, channel: i32) -> Message {
        Message {
            id,
            from_node_num: from,
            to_node_num: 0xFFFF_FFFF,
            from_node_id: meshmonitor_proto::node_id_from_num(from),
            to_node_id: "!ffffffff".to_string(),
            channel,
            text: "hello".to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            portnum: 1,
            reply_id: None,
            emoji: false,
            hop_start: None,
            hop_limit: None,
            via_mqtt: false,
            delivery_state: Some(DeliveryState::Pending),
            ack_failed: false,
            request_id: None,
            is_local: false,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    #[tokio::test]
    async fn test_snapshot_unread_matches_messages() {
        let (store, session, config, _dir) = harness().await;

        let mut patch = NodePatch::new(0x20);
        patch.last_heard = Some(chrono::Utc::now().timestamp());
        store.upsert_node(&patch).await.unwrap();

        store.upsert_message(&message(1, 0x20, 0)).await.unwrap();
        store.upsert_message(&message(2, 0x20, 0)).await.unwrap();
        store.upsert_message(&message(3, 0x20, 1)).await.unwrap();

        let snapshot = build_snapshot(&store, &session, &config).await.unwrap();

        // Property: per channel, unread equals the count of visible
        // messages on that channel not sent by the local node.
        for (key, count) in &snapshot.unread_counts {
            if let Some(ch) = key.strip_prefix("ch:") {
                let ch: i32 = ch.parse().unwrap();
                let visible = snapshot
                    .messages
                    .iter()
                    .filter(|m| m.channel == ch && !m.is_local)
                    .count() as i64;
                assert_eq!(*count, visible, "unread mismatch on {}", key);
            }
        }
        assert_eq!(snapshot.unread_counts.get("ch:0"), Some(&2));
        assert_eq!(snapshot.unread_counts.get("ch:1"), Some(&1));

        assert_eq!(snapshot.nodes.len(), 1);
        assert!(!snapshot.connection.connected);
        assert_eq!(snapshot.config.max_node_age_hours, 24);
    }

    #[tokio::test]
    async fn test_snapshot_empty_store() {
        let (store, session, config, _dir) = harness().await;
        let snapshot = build_snapshot(&store, &session, &config).await.unwrap();

        assert!(snapshot.nodes.is_empty());
        assert!(snapshot.messages.is_empty());
        assert!(snapshot.unread_counts.is_empty());
        assert!(snapshot.device.node_id.is_none());
    }
}
