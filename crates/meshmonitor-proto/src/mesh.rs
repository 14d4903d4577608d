//! Hand-maintained mirror of the Meshtastic `mesh.proto` subset this
//! system speaks.
//!
//! Field numbers follow the upstream schema exactly; fields the monitor
//! never reads are omitted (protobuf skips unknown tags on decode, and we
//! replay cached config records from their raw bytes, so omissions are
//! lossless on the pass-through paths). Structs are kept in the shape
//! `prost-build` would generate so the module reads like vendored
//! generated code.

use prost::Message;

use crate::channel::Channel;
use crate::config::{Config, ModuleConfig};
use crate::error::Result;
use crate::portnum::PortNum;
use crate::telemetry::Telemetry;

/// One routed unit on the mesh.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MeshPacket {
    #[prost(fixed32, tag = "1")]
    pub from: u32,
    #[prost(fixed32, tag = "2")]
    pub to: u32,
    #[prost(uint32, tag = "3")]
    pub channel: u32,
    #[prost(oneof = "mesh_packet::PayloadVariant", tags = "4, 5")]
    pub payload_variant: Option<mesh_packet::PayloadVariant>,
    #[prost(fixed32, tag = "6")]
    pub id: u32,
    #[prost(fixed32, tag = "7")]
    pub rx_time: u32,
    #[prost(float, tag = "8")]
    pub rx_snr: f32,
    #[prost(uint32, tag = "9")]
    pub hop_limit: u32,
    #[prost(bool, tag = "10")]
    pub want_ack: bool,
    #[prost(int32, tag = "11")]
    pub priority: i32,
    #[prost(int32, tag = "12")]
    pub rx_rssi: i32,
    #[prost(bool, tag = "14")]
    pub via_mqtt: bool,
    #[prost(uint32, tag = "15")]
    pub hop_start: u32,
    #[prost(bytes = "vec", tag = "16")]
    pub public_key: Vec<u8>,
    #[prost(bool, tag = "17")]
    pub pki_encrypted: bool,
}

pub mod mesh_packet {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "4")]
        Decoded(super::Data),
        #[prost(bytes, tag = "5")]
        Encrypted(Vec<u8>),
    }
}

impl MeshPacket {
    /// The decoded payload, when the packet is not channel-encrypted.
    pub fn decoded(&self) -> Option<&Data> {
        match &self.payload_variant {
            Some(mesh_packet::PayloadVariant::Decoded(data)) => Some(data),
            _ => None,
        }
    }
}

/// Typed payload of a decoded packet.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Data {
    #[prost(enumeration = "crate::portnum::PortNum", tag = "1")]
    pub portnum: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
    #[prost(bool, tag = "3")]
    pub want_response: bool,
    #[prost(fixed32, tag = "4")]
    pub dest: u32,
    #[prost(fixed32, tag = "5")]
    pub source: u32,
    #[prost(fixed32, tag = "6")]
    pub request_id: u32,
    #[prost(fixed32, tag = "7")]
    pub reply_id: u32,
    #[prost(fixed32, tag = "8")]
    pub emoji: u32,
    #[prost(uint32, optional, tag = "9")]
    pub bitfield: Option<u32>,
}

/// Peer identity broadcast with NODEINFO_APP.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct User {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub long_name: String,
    #[prost(string, tag = "3")]
    pub short_name: String,
    #[prost(int32, tag = "5")]
    pub hw_model: i32,
    #[prost(bool, tag = "6")]
    pub is_licensed: bool,
    #[prost(int32, tag = "7")]
    pub role: i32,
    #[prost(bytes = "vec", tag = "8")]
    pub public_key: Vec<u8>,
}

/// GPS fix, 1e-7 fixed-point degrees.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Position {
    #[prost(sfixed32, optional, tag = "1")]
    pub latitude_i: Option<i32>,
    #[prost(sfixed32, optional, tag = "2")]
    pub longitude_i: Option<i32>,
    #[prost(int32, optional, tag = "3")]
    pub altitude: Option<i32>,
    #[prost(fixed32, tag = "4")]
    pub time: u32,
    #[prost(uint32, tag = "23")]
    pub precision_bits: u32,
}

/// Mesh routing control payload (ROUTING_APP).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Routing {
    #[prost(oneof = "routing::Variant", tags = "1, 2, 3")]
    pub variant: Option<routing::Variant>,
}

pub mod routing {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Variant {
        #[prost(message, tag = "1")]
        RouteRequest(super::RouteDiscovery),
        #[prost(message, tag = "2")]
        RouteReply(super::RouteDiscovery),
        #[prost(enumeration = "super::RoutingError", tag = "3")]
        ErrorReason(i32),
    }
}

/// End-to-end routing outcome carried in a routing ack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum RoutingError {
    None = 0,
    NoRoute = 1,
    GotNak = 2,
    Timeout = 3,
    NoInterface = 4,
    MaxRetransmit = 5,
    NoChannel = 6,
    TooLarge = 7,
    NoResponse = 8,
    DutyCycleLimit = 9,
    BadRequest = 32,
    NotAuthorized = 33,
    PkiFailed = 34,
    PkiUnknownPubkey = 35,
    AdminBadSessionKey = 36,
    AdminPublicKeyUnauthorized = 37,
}

impl RoutingError {
    pub fn name(&self) -> &'static str {
        match self {
            RoutingError::None => "NONE",
            RoutingError::NoRoute => "NO_ROUTE",
            RoutingError::GotNak => "GOT_NAK",
            RoutingError::Timeout => "TIMEOUT",
            RoutingError::NoInterface => "NO_INTERFACE",
            RoutingError::MaxRetransmit => "MAX_RETRANSMIT",
            RoutingError::NoChannel => "NO_CHANNEL",
            RoutingError::TooLarge => "TOO_LARGE",
            RoutingError::NoResponse => "NO_RESPONSE",
            RoutingError::DutyCycleLimit => "DUTY_CYCLE_LIMIT",
            RoutingError::BadRequest => "BAD_REQUEST",
            RoutingError::NotAuthorized => "NOT_AUTHORIZED",
            RoutingError::PkiFailed => "PKI_FAILED",
            RoutingError::PkiUnknownPubkey => "PKI_UNKNOWN_PUBKEY",
            RoutingError::AdminBadSessionKey => "ADMIN_BAD_SESSION_KEY",
            RoutingError::AdminPublicKeyUnauthorized => "ADMIN_PUBLIC_KEY_UNAUTHORIZED",
        }
    }
}

/// Forward and return paths between two nodes (TRACEROUTE_APP).
///
/// SNR arrays are scaled by 4; `-128` entries mean "unknown".
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RouteDiscovery {
    #[prost(fixed32, repeated, tag = "1")]
    pub route: Vec<u32>,
    #[prost(int32, repeated, tag = "2")]
    pub snr_towards: Vec<i32>,
    #[prost(fixed32, repeated, tag = "3")]
    pub route_back: Vec<u32>,
    #[prost(int32, repeated, tag = "4")]
    pub snr_back: Vec<i32>,
}

/// The local radio's own identity record.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MyNodeInfo {
    #[prost(uint32, tag = "1")]
    pub my_node_num: u32,
    #[prost(uint32, tag = "8")]
    pub reboot_count: u32,
    #[prost(uint32, tag = "11")]
    pub min_app_version: u32,
}

/// One NodeDB entry replayed during configuration.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeInfo {
    #[prost(uint32, tag = "1")]
    pub num: u32,
    #[prost(message, optional, tag = "2")]
    pub user: Option<User>,
    #[prost(message, optional, tag = "3")]
    pub position: Option<Position>,
    #[prost(float, tag = "4")]
    pub snr: f32,
    #[prost(fixed32, tag = "5")]
    pub last_heard: u32,
    #[prost(message, optional, tag = "6")]
    pub device_metrics: Option<crate::telemetry::DeviceMetrics>,
    #[prost(uint32, tag = "7")]
    pub channel: u32,
    #[prost(bool, tag = "8")]
    pub via_mqtt: bool,
    #[prost(uint32, optional, tag = "9")]
    pub hops_away: Option<u32>,
    #[prost(bool, tag = "10")]
    pub is_favorite: bool,
    #[prost(bool, tag = "11")]
    pub is_ignored: bool,
}

/// Static device capabilities reported once per session.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeviceMetadata {
    #[prost(string, tag = "1")]
    pub firmware_version: String,
    #[prost(uint32, tag = "2")]
    pub device_state_version: u32,
    #[prost(bool, tag = "3")]
    pub can_shutdown: bool,
    #[prost(bool, tag = "4")]
    pub has_wifi: bool,
    #[prost(bool, tag = "5")]
    pub has_bluetooth: bool,
    #[prost(bool, tag = "6")]
    pub has_ethernet: bool,
    #[prost(int32, tag = "7")]
    pub role: i32,
    #[prost(uint32, tag = "8")]
    pub position_flags: u32,
    #[prost(int32, tag = "9")]
    pub hw_model: i32,
    #[prost(bool, tag = "10")]
    pub has_remote_hardware: bool,
}

/// Device log line forwarded over the API link.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogRecord {
    #[prost(string, tag = "1")]
    pub message: String,
    #[prost(fixed32, tag = "2")]
    pub time: u32,
    #[prost(string, tag = "3")]
    pub source: String,
    #[prost(int32, tag = "4")]
    pub level: i32,
}

/// Radio transmit queue status.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueueStatus {
    #[prost(int32, tag = "1")]
    pub res: i32,
    #[prost(uint32, tag = "2")]
    pub free: u32,
    #[prost(uint32, tag = "3")]
    pub maxlen: u32,
    #[prost(uint32, tag = "4")]
    pub mesh_packet_id: u32,
}

/// Keep-alive sent by API clients; never routed to the mesh.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Heartbeat {}

/// Neighbor graph broadcast (NEIGHBORINFO_APP).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NeighborInfo {
    #[prost(uint32, tag = "1")]
    pub node_id: u32,
    #[prost(uint32, tag = "2")]
    pub last_sent_by_id: u32,
    #[prost(uint32, tag = "3")]
    pub node_broadcast_interval_secs: u32,
    #[prost(message, repeated, tag = "4")]
    pub neighbors: Vec<Neighbor>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Neighbor {
    #[prost(uint32, tag = "1")]
    pub node_id: u32,
    #[prost(float, tag = "2")]
    pub snr: f32,
}

/// People-counter sample (PAXCOUNTER_APP).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Paxcount {
    #[prost(uint32, tag = "1")]
    pub wifi: u32,
    #[prost(uint32, tag = "2")]
    pub ble: u32,
    #[prost(uint32, tag = "3")]
    pub uptime: u32,
}

/// Device-to-host message; exactly one payload variant is present.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FromRadio {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(
        oneof = "from_radio::PayloadVariant",
        tags = "2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 13"
    )]
    pub payload_variant: Option<from_radio::PayloadVariant>,
}

pub mod from_radio {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "2")]
        Packet(super::MeshPacket),
        #[prost(message, tag = "3")]
        MyInfo(super::MyNodeInfo),
        #[prost(message, tag = "4")]
        NodeInfo(super::NodeInfo),
        #[prost(message, tag = "5")]
        Config(super::Config),
        #[prost(message, tag = "6")]
        LogRecord(super::LogRecord),
        #[prost(uint32, tag = "7")]
        ConfigCompleteId(u32),
        #[prost(bool, tag = "8")]
        Rebooted(bool),
        #[prost(message, tag = "9")]
        ModuleConfig(super::ModuleConfig),
        #[prost(message, tag = "10")]
        Channel(super::Channel),
        #[prost(message, tag = "11")]
        QueueStatus(super::QueueStatus),
        #[prost(message, tag = "13")]
        Metadata(super::DeviceMetadata),
    }
}

/// Host-to-device message; exactly one payload variant is present.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ToRadio {
    #[prost(oneof = "to_radio::PayloadVariant", tags = "1, 3, 4, 7")]
    pub payload_variant: Option<to_radio::PayloadVariant>,
}

pub mod to_radio {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "1")]
        Packet(super::MeshPacket),
        #[prost(uint32, tag = "3")]
        WantConfigId(u32),
        #[prost(bool, tag = "4")]
        Disconnect(bool),
        #[prost(message, tag = "7")]
        Heartbeat(super::Heartbeat),
    }
}

/// Decode a framed payload as FromRadio, all-or-nothing.
pub fn decode_from_radio(bytes: &[u8]) -> Result<FromRadio> {
    Ok(FromRadio::decode(bytes)?)
}

/// Decode a framed payload as ToRadio, all-or-nothing.
pub fn decode_to_radio(bytes: &[u8]) -> Result<ToRadio> {
    Ok(ToRadio::decode(bytes)?)
}

impl FromRadio {
    pub fn from_packet(packet: MeshPacket) -> Self {
        FromRadio {
            id: 0,
            payload_variant: Some(from_radio::PayloadVariant::Packet(packet)),
        }
    }

    pub fn from_my_info(my_info: MyNodeInfo) -> Self {
        FromRadio {
            id: 0,
            payload_variant: Some(from_radio::PayloadVariant::MyInfo(my_info)),
        }
    }

    pub fn from_node_info(node_info: NodeInfo) -> Self {
        FromRadio {
            id: 0,
            payload_variant: Some(from_radio::PayloadVariant::NodeInfo(node_info)),
        }
    }

    pub fn config_complete(id: u32) -> Self {
        FromRadio {
            id: 0,
            payload_variant: Some(from_radio::PayloadVariant::ConfigCompleteId(id)),
        }
    }

    /// The mesh packet, if this record carries one.
    pub fn packet(&self) -> Option<&MeshPacket> {
        match &self.payload_variant {
            Some(from_radio::PayloadVariant::Packet(p)) => Some(p),
            _ => None,
        }
    }
}

impl ToRadio {
    pub fn from_packet(packet: MeshPacket) -> Self {
        ToRadio {
            payload_variant: Some(to_radio::PayloadVariant::Packet(packet)),
        }
    }

    /// Request the full config download; `0xFFFFFFFF` asks for everything.
    pub fn want_config(id: u32) -> Self {
        ToRadio {
            payload_variant: Some(to_radio::PayloadVariant::WantConfigId(id)),
        }
    }

    pub fn disconnect() -> Self {
        ToRadio {
            payload_variant: Some(to_radio::PayloadVariant::Disconnect(true)),
        }
    }
}

impl MeshPacket {
    fn with_data(from: u32, to: u32, channel: u32, id: u32, want_ack: bool, data: Data) -> Self {
        MeshPacket {
            from,
            to,
            channel,
            payload_variant: Some(mesh_packet::PayloadVariant::Decoded(data)),
            id,
            want_ack,
            ..Default::default()
        }
    }

    /// Build a text-message packet; `reply_id`/`emoji` mark tapback
    /// reactions.
    pub fn text_message(
        from: u32,
        to: u32,
        channel: u32,
        id: u32,
        text: &str,
        reply_id: u32,
        emoji: bool,
    ) -> Self {
        Self::with_data(
            from,
            to,
            channel,
            id,
            true,
            Data {
                portnum: PortNum::TextMessageApp as i32,
                payload: text.as_bytes().to_vec(),
                reply_id,
                emoji: emoji as u32,
                ..Default::default()
            },
        )
    }

    /// Build a traceroute request toward `to`.
    pub fn traceroute_request(from: u32, to: u32, channel: u32, id: u32) -> Self {
        Self::with_data(
            from,
            to,
            channel,
            id,
            true,
            Data {
                portnum: PortNum::TracerouteApp as i32,
                payload: RouteDiscovery::default().encode_to_vec(),
                want_response: true,
                ..Default::default()
            },
        )
    }

    /// Build a position exchange: send our own fix and ask for one back.
    pub fn position_request(from: u32, to: u32, channel: u32, id: u32, own: Position) -> Self {
        Self::with_data(
            from,
            to,
            channel,
            id,
            true,
            Data {
                portnum: PortNum::PositionApp as i32,
                payload: own.encode_to_vec(),
                want_response: true,
                ..Default::default()
            },
        )
    }

    /// Build a telemetry request (empty Telemetry with want_response).
    pub fn telemetry_request(from: u32, to: u32, channel: u32, id: u32) -> Self {
        Self::with_data(
            from,
            to,
            channel,
            id,
            true,
            Data {
                portnum: PortNum::TelemetryApp as i32,
                payload: Telemetry::default().encode_to_vec(),
                want_response: true,
                ..Default::default()
            },
        )
    }

    /// Wrap an encoded admin message for `to`.
    pub fn admin(from: u32, to: u32, id: u32, admin_payload: Vec<u8>) -> Self {
        Self::with_data(
            from,
            to,
            0,
            id,
            true,
            Data {
                portnum: PortNum::AdminApp as i32,
                payload: admin_payload,
                want_response: true,
                ..Default::default()
            },
        )
    }
}
