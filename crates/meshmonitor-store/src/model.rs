//! Durable mesh model types
//!
//! These mirror the persisted tables; timestamps are unix seconds.

use serde::{Deserialize, Serialize};

/// Delivery progress of a locally originated message.
///
/// Transitions only move forward: `Pending → Delivered → Confirmed`, or to
/// `Failed` from pending/delivered. Channel broadcasts stop at `Delivered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Pending,
    Delivered,
    Confirmed,
    Failed,
}

impl DeliveryState {
    /// Ordering used by the monotonic-update guard.
    pub fn rank(&self) -> u8 {
        match self {
            DeliveryState::Pending => 0,
            DeliveryState::Delivered => 1,
            DeliveryState::Confirmed => 2,
            DeliveryState::Failed => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Pending => "pending",
            DeliveryState::Delivered => "delivered",
            DeliveryState::Confirmed => "confirmed",
            DeliveryState::Failed => "failed",
        }
    }
}

/// One observed radio peer.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Node {
    pub node_num: u32,
    pub node_id: String,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub hw_model: Option<i32>,
    pub role: Option<i32>,
    pub public_key: Option<Vec<u8>>,
    pub is_licensed: bool,
    pub snr: Option<f64>,
    pub last_heard: Option<i64>,
    pub hops_away: Option<i32>,
    pub via_mqtt: bool,
    pub channel: Option<i32>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<i32>,
    pub position_time: Option<i64>,
    pub battery_level: Option<i32>,
    pub voltage: Option<f64>,
    pub channel_utilization: Option<f64>,
    pub air_util_tx: Option<f64>,
    pub uptime_seconds: Option<i64>,
    pub is_favorite: bool,
    pub is_ignored: bool,
    pub welcomed_at: Option<i64>,
    pub firmware_version: Option<String>,
    pub reboot_count: Option<i32>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Partial node update; `None` fields keep their stored value.
///
/// This is the unit of the per-field last-writer-wins merge.
#[derive(Debug, Clone, Default)]
pub struct NodePatch {
    pub node_num: u32,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub hw_model: Option<i32>,
    pub role: Option<i32>,
    pub public_key: Option<Vec<u8>>,
    pub is_licensed: Option<bool>,
    pub snr: Option<f64>,
    pub last_heard: Option<i64>,
    pub hops_away: Option<i32>,
    pub via_mqtt: Option<bool>,
    pub channel: Option<i32>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<i32>,
    pub position_time: Option<i64>,
    pub battery_level: Option<i32>,
    pub voltage: Option<f64>,
    pub channel_utilization: Option<f64>,
    pub air_util_tx: Option<f64>,
    pub uptime_seconds: Option<i64>,
    pub is_favorite: Option<bool>,
    pub is_ignored: Option<bool>,
    pub firmware_version: Option<String>,
    pub reboot_count: Option<i32>,
}

impl NodePatch {
    pub fn new(node_num: u32) -> Self {
        NodePatch {
            node_num,
            ..Default::default()
        }
    }
}

/// A radio channel slot (index 0–7).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Channel {
    pub idx: i32,
    pub name: Option<String>,
    pub psk: Option<Vec<u8>>,
    pub role: i32,
    pub uplink_enabled: bool,
    pub downlink_enabled: bool,
    pub position_precision: Option<i32>,
    pub updated_at: i64,
}

/// A delivered text message or reaction.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    /// Wire packet id when known, else a locally minted pending id.
    pub id: u32,
    pub from_node_num: u32,
    pub to_node_num: u32,
    pub from_node_id: String,
    pub to_node_id: String,
    /// 0..7 for channel messages, -1 for direct messages.
    pub channel: i32,
    pub text: String,
    pub timestamp: i64,
    pub portnum: i32,
    pub reply_id: Option<u32>,
    pub emoji: bool,
    pub hop_start: Option<i32>,
    pub hop_limit: Option<i32>,
    pub via_mqtt: bool,
    /// `None` means implicitly pending (remote messages never set it).
    pub delivery_state: Option<DeliveryState>,
    pub ack_failed: bool,
    pub request_id: Option<u32>,
    pub is_local: bool,
    pub created_at: i64,
}

/// One reverse-chronological page of messages.
#[derive(Debug, Clone, Serialize)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub has_more: bool,
}

/// A stored traceroute result. Failed iff both routes are absent.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TracerouteRecord {
    pub id: i64,
    pub from_node_num: u32,
    pub to_node_num: u32,
    /// JSON array of intermediate node numbers; NULL when no reply came.
    pub route: Option<String>,
    pub route_back: Option<String>,
    /// JSON arrays of scaled SNR values; `null` entries are unknown hops.
    pub snr_towards: Option<String>,
    pub snr_back: Option<String>,
    pub timestamp: i64,
    pub created_at: i64,
}

impl TracerouteRecord {
    pub fn is_failed(&self) -> bool {
        self.route.is_none() && self.route_back.is_none()
    }
}

/// Kind tag for a telemetry sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TelemetryKind {
    Device,
    Environment,
    Power,
    Pax,
}

/// Append-only telemetry time-series entry; metrics are a JSON object
/// shaped by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TelemetrySample {
    pub id: i64,
    pub node_num: u32,
    pub timestamp: i64,
    pub kind: TelemetryKind,
    pub metrics: String,
}

/// One edge of the reported neighbor graph.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NeighborEdge {
    pub node_num: u32,
    pub neighbor_num: u32,
    pub snr: f64,
    pub updated_at: i64,
}

/// Append-only audit record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditEntry {
    pub id: i64,
    pub actor: String,
    pub action: String,
    pub resource: Option<String>,
    pub details: Option<String>,
    pub ip: Option<String>,
    pub created_at: i64,
}

/// Packet on a port the router has no handler for, kept for inspection.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RawPacket {
    pub id: i64,
    pub from_node_num: u32,
    pub to_node_num: u32,
    pub portnum: i32,
    pub payload: Vec<u8>,
    pub rx_time: i64,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_state_rank_order() {
        assert!(DeliveryState::Pending.rank() < DeliveryState::Delivered.rank());
        assert!(DeliveryState::Delivered.rank() < DeliveryState::Confirmed.rank());
    }

    #[test]
    fn test_traceroute_failed_requires_both_absent() {
        let mut record = TracerouteRecord {
            id: 1,
            from_node_num: 1,
            to_node_num: 2,
            route: None,
            route_back: None,
            snr_towards: None,
            snr_back: None,
            timestamp: 0,
            created_at: 0,
        };
        assert!(record.is_failed());

        record.route_back = Some("[]".to_string());
        assert!(!record.is_failed());
    }
}
