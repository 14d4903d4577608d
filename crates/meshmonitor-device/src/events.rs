//! Session state and event plumbing

use meshmonitor_proto::mesh::from_radio::PayloadVariant;
use meshmonitor_proto::FromRadio;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of the physical-radio session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No stream to the radio; the supervisor retries with backoff.
    Disconnected,
    /// TCP connect in flight.
    Connecting,
    /// Stream open, config download in progress.
    Configuring,
    /// Normal operation.
    Connected,
    /// Stream open but no ingress within the unresponsive window.
    NodeOffline,
    /// Reboot admin command acknowledged; waiting out the restart.
    Rebooting,
    /// Operator asked to disconnect; no auto-reconnect.
    UserDisconnected,
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            SessionState::Connected | SessionState::NodeOffline | SessionState::Configuring
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "Disconnected"),
            SessionState::Connecting => write!(f, "Connecting"),
            SessionState::Configuring => write!(f, "Configuring"),
            SessionState::Connected => write!(f, "Connected"),
            SessionState::NodeOffline => write!(f, "Node Offline"),
            SessionState::Rebooting => write!(f, "Rebooting"),
            SessionState::UserDisconnected => write!(f, "User Disconnected"),
        }
    }
}

/// Ingress event handed from the session to the packet router.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A decoded FromRadio together with its raw payload bytes (the bytes
    /// are what VNS rebroadcasts, verbatim-framed).
    FromRadio { frame: FromRadio, raw: Vec<u8> },
    StateChanged(SessionState),
}

/// Record type tag for one cached init-config entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigRecordKind {
    MyInfo,
    NodeInfo,
    Config,
    ModuleConfig,
    Channel,
    Metadata,
    ConfigComplete,
    Other,
}

impl ConfigRecordKind {
    pub fn of(frame: &FromRadio) -> Self {
        match &frame.payload_variant {
            Some(PayloadVariant::MyInfo(_)) => ConfigRecordKind::MyInfo,
            Some(PayloadVariant::NodeInfo(_)) => ConfigRecordKind::NodeInfo,
            Some(PayloadVariant::Config(_)) => ConfigRecordKind::Config,
            Some(PayloadVariant::ModuleConfig(_)) => ConfigRecordKind::ModuleConfig,
            Some(PayloadVariant::Channel(_)) => ConfigRecordKind::Channel,
            Some(PayloadVariant::Metadata(_)) => ConfigRecordKind::Metadata,
            Some(PayloadVariant::ConfigCompleteId(_)) => ConfigRecordKind::ConfigComplete,
            _ => ConfigRecordKind::Other,
        }
    }
}

/// One record of the config download, kept in arrival order with its raw
/// payload so virtual-node clients can replay it byte-for-byte.
#[derive(Debug, Clone)]
pub struct CachedConfigRecord {
    pub kind: ConfigRecordKind,
    pub raw: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshmonitor_proto::mesh::MyNodeInfo;

    #[test]
    fn test_record_kind_tags() {
        let frame = FromRadio::from_my_info(MyNodeInfo::default());
        assert_eq!(ConfigRecordKind::of(&frame), ConfigRecordKind::MyInfo);

        let frame = FromRadio::config_complete(7);
        assert_eq!(ConfigRecordKind::of(&frame), ConfigRecordKind::ConfigComplete);
    }

    #[test]
    fn test_state_connected_set() {
        assert!(SessionState::Connected.is_connected());
        assert!(SessionState::Configuring.is_connected());
        assert!(!SessionState::Disconnected.is_connected());
        assert!(!SessionState::UserDisconnected.is_connected());
    }
}
