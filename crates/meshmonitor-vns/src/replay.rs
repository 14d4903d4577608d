//! Hybrid config replay for attaching clients
//!
//! A native client bootstraps its view of the mesh from the config replay.
//! Static records (config sections, channels, metadata) are replayed from
//! the cache collected at session-configure time, byte-for-byte. Dynamic
//! records are built fresh: the NodeDB from the store, so clients see
//! current positions and metrics instead of whatever the radio reported at
//! our own startup.

use std::sync::Arc;

use meshmonitor_device::{CachedConfigRecord, ConfigRecordKind};
use meshmonitor_proto::mesh::{FromRadio, MyNodeInfo, NodeInfo, Position, User};
use meshmonitor_proto::telemetry::DeviceMetrics;
use meshmonitor_proto::types::degrees_to_i;
use meshmonitor_proto::Message as _;
use meshmonitor_store::{Node, Store};

use crate::error::Result;

/// Assemble the full replay as raw FromRadio payloads, in send order.
pub async fn build_replay(
    store: &Arc<Store>,
    local_node_num: u32,
    reboot_count: Option<u32>,
    cached: &[CachedConfigRecord],
    max_node_age_hours: u32,
    want_config_id: u32,
) -> Result<Vec<Vec<u8>>> {
    let mut frames = Vec::new();

    // Fresh MyNodeInfo from what we know about the local node.
    let my_info = MyNodeInfo {
        my_node_num: local_node_num,
        reboot_count: reboot_count.unwrap_or(0),
        ..Default::default()
    };
    frames.push(FromRadio::from_my_info(my_info).encode_to_vec());

    // Fresh NodeDB from the store, filtered to recently heard nodes.
    for node in store.get_active_nodes(max_node_age_hours).await? {
        let info = node_info_from_row(&node);
        frames.push(FromRadio::from_node_info(info).encode_to_vec());
    }

    // Static records in their original order; the dynamic kinds above and
    // the completion marker are skipped.
    for record in cached {
        match record.kind {
            ConfigRecordKind::MyInfo
            | ConfigRecordKind::NodeInfo
            | ConfigRecordKind::ConfigComplete => {}
            _ => frames.push(record.raw.clone()),
        }
    }

    frames.push(FromRadio::config_complete(want_config_id).encode_to_vec());
    Ok(frames)
}

/// Project a stored node row back into the wire NodeInfo shape.
fn node_info_from_row(node: &Node) -> NodeInfo {
    let position = match (node.latitude, node.longitude) {
        (Some(lat), Some(lon)) => Some(Position {
            latitude_i: Some(degrees_to_i(lat)),
            longitude_i: Some(degrees_to_i(lon)),
            altitude: node.altitude,
            time: node.position_time.unwrap_or(0) as u32,
            ..Default::default()
        }),
        _ => None,
    };

    let has_metrics = node.battery_level.is_some()
        || node.voltage.is_some()
        || node.channel_utilization.is_some();
    let device_metrics = has_metrics.then(|| DeviceMetrics {
        battery_level: node.battery_level.map(|v| v as u32),
        voltage: node.voltage.map(|v| v as f32),
        channel_utilization: node.channel_utilization.map(|v| v as f32),
        air_util_tx: node.air_util_tx.map(|v| v as f32),
        uptime_seconds: node.uptime_seconds.map(|v| v as u32),
    });

    NodeInfo {
        num: node.node_num,
        user: Some(User {
            id: node.node_id.clone(),
            long_name: node.long_name.clone().unwrap_or_default(),
            short_name: node.short_name.clone().unwrap_or_default(),
            hw_model: node.hw_model.unwrap_or(0),
            is_licensed: node.is_licensed,
            role: node.role.unwrap_or(0),
            public_key: node.public_key.clone().unwrap_or_default(),
        }),
        position,
        snr: node.snr.unwrap_or(0.0) as f32,
        last_heard: node.last_heard.unwrap_or(0) as u32,
        device_metrics,
        channel: node.channel.unwrap_or(0).max(0) as u32,
        via_mqtt: node.via_mqtt,
        hops_away: node.hops_away.map(|h| h.max(0) as u32),
        is_favorite: node.is_favorite,
        is_ignored: node.is_ignored,
    }
}
