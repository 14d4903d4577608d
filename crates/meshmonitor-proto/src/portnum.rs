//! Application port numbers and their normalization
//!
//! Routing decisions are made on the numeric value only. Wire layers and
//! peer tooling sometimes surface ports by enum name, so both forms
//! normalize through here before any comparison.

/// Application type of a packet payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum PortNum {
    UnknownApp = 0,
    TextMessageApp = 1,
    RemoteHardwareApp = 2,
    PositionApp = 3,
    NodeinfoApp = 4,
    RoutingApp = 5,
    AdminApp = 6,
    TextMessageCompressedApp = 7,
    WaypointApp = 8,
    AudioApp = 9,
    DetectionSensorApp = 10,
    AlertApp = 11,
    ReplyApp = 32,
    IpTunnelApp = 33,
    PaxcounterApp = 34,
    SerialApp = 64,
    StoreForwardApp = 65,
    RangeTestApp = 66,
    TelemetryApp = 67,
    ZpsApp = 68,
    SimulatorApp = 69,
    TracerouteApp = 70,
    NeighborinfoApp = 71,
    AtakPlugin = 72,
    MapReportApp = 73,
    PowerstressApp = 74,
    PrivateApp = 256,
    AtakForwarder = 257,
}

impl PortNum {
    /// Schema name of this port, as it appears on enum-name wire surfaces.
    pub fn name(&self) -> &'static str {
        match self {
            PortNum::UnknownApp => "UNKNOWN_APP",
            PortNum::TextMessageApp => "TEXT_MESSAGE_APP",
            PortNum::RemoteHardwareApp => "REMOTE_HARDWARE_APP",
            PortNum::PositionApp => "POSITION_APP",
            PortNum::NodeinfoApp => "NODEINFO_APP",
            PortNum::RoutingApp => "ROUTING_APP",
            PortNum::AdminApp => "ADMIN_APP",
            PortNum::TextMessageCompressedApp => "TEXT_MESSAGE_COMPRESSED_APP",
            PortNum::WaypointApp => "WAYPOINT_APP",
            PortNum::AudioApp => "AUDIO_APP",
            PortNum::DetectionSensorApp => "DETECTION_SENSOR_APP",
            PortNum::AlertApp => "ALERT_APP",
            PortNum::ReplyApp => "REPLY_APP",
            PortNum::IpTunnelApp => "IP_TUNNEL_APP",
            PortNum::PaxcounterApp => "PAXCOUNTER_APP",
            PortNum::SerialApp => "SERIAL_APP",
            PortNum::StoreForwardApp => "STORE_FORWARD_APP",
            PortNum::RangeTestApp => "RANGE_TEST_APP",
            PortNum::TelemetryApp => "TELEMETRY_APP",
            PortNum::ZpsApp => "ZPS_APP",
            PortNum::SimulatorApp => "SIMULATOR_APP",
            PortNum::TracerouteApp => "TRACEROUTE_APP",
            PortNum::NeighborinfoApp => "NEIGHBORINFO_APP",
            PortNum::AtakPlugin => "ATAK_PLUGIN",
            PortNum::MapReportApp => "MAP_REPORT_APP",
            PortNum::PowerstressApp => "POWERSTRESS_APP",
            PortNum::PrivateApp => "PRIVATE_APP",
            PortNum::AtakForwarder => "ATAK_FORWARDER",
        }
    }

    /// All known ports, for exhaustive normalization checks.
    pub fn all() -> &'static [PortNum] {
        &[
            PortNum::UnknownApp,
            PortNum::TextMessageApp,
            PortNum::RemoteHardwareApp,
            PortNum::PositionApp,
            PortNum::NodeinfoApp,
            PortNum::RoutingApp,
            PortNum::AdminApp,
            PortNum::TextMessageCompressedApp,
            PortNum::WaypointApp,
            PortNum::AudioApp,
            PortNum::DetectionSensorApp,
            PortNum::AlertApp,
            PortNum::ReplyApp,
            PortNum::IpTunnelApp,
            PortNum::PaxcounterApp,
            PortNum::SerialApp,
            PortNum::StoreForwardApp,
            PortNum::RangeTestApp,
            PortNum::TelemetryApp,
            PortNum::ZpsApp,
            PortNum::SimulatorApp,
            PortNum::TracerouteApp,
            PortNum::NeighborinfoApp,
            PortNum::AtakPlugin,
            PortNum::MapReportApp,
            PortNum::PowerstressApp,
            PortNum::PrivateApp,
            PortNum::AtakForwarder,
        ]
    }
}

/// Resolve a schema enum name to its port.
pub fn port_from_name(name: &str) -> Option<PortNum> {
    PortNum::all().iter().copied().find(|p| p.name() == name)
}

/// Resolve a numeric value to its port, if known.
pub fn port_from_number(value: i32) -> Option<PortNum> {
    PortNum::try_from(value).ok()
}

/// Normalize either surface form to the numeric port value.
///
/// Unknown names and unknown numbers both collapse to `UNKNOWN_APP` (0).
pub fn normalize(value: i32) -> i32 {
    port_from_number(value).map(|p| p as i32).unwrap_or(0)
}
