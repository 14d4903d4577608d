//! Mirror of the Meshtastic `admin.proto` subset, plus builders for every
//! admin command the monitor issues.
//!
//! Firmware 2.5+ requires the session passkey (field 101) on mutating
//! commands; older firmware ignores the field, so builders always accept
//! one and callers pass whatever the session has cached.

use prost::Message;

use crate::channel::Channel;
use crate::config::{Config, ModuleConfig};
use crate::error::Result;
use crate::mesh::{DeviceMetadata, Position, User};

/// Sections addressable by `get_config_request`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum AdminConfigType {
    DeviceConfig = 0,
    PositionConfig = 1,
    PowerConfig = 2,
    NetworkConfig = 3,
    DisplayConfig = 4,
    LoraConfig = 5,
    BluetoothConfig = 6,
    SecurityConfig = 7,
    SessionkeyConfig = 8,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AdminMessage {
    #[prost(
        oneof = "admin_message::PayloadVariant",
        tags = "1, 2, 3, 4, 5, 6, 7, 8, 12, 13, 32, 33, 34, 35, 38, 39, 40, 41, 42, 47, 48, 64, 65, 97, 100"
    )]
    pub payload_variant: Option<admin_message::PayloadVariant>,
    #[prost(bytes = "vec", tag = "101")]
    pub session_passkey: Vec<u8>,
}

pub mod admin_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(uint32, tag = "1")]
        GetChannelRequest(u32),
        #[prost(message, tag = "2")]
        GetChannelResponse(super::Channel),
        #[prost(bool, tag = "3")]
        GetOwnerRequest(bool),
        #[prost(message, tag = "4")]
        GetOwnerResponse(super::User),
        #[prost(enumeration = "super::AdminConfigType", tag = "5")]
        GetConfigRequest(i32),
        #[prost(message, tag = "6")]
        GetConfigResponse(super::Config),
        #[prost(int32, tag = "7")]
        GetModuleConfigRequest(i32),
        #[prost(message, tag = "8")]
        GetModuleConfigResponse(super::ModuleConfig),
        #[prost(bool, tag = "12")]
        GetDeviceMetadataRequest(bool),
        #[prost(message, tag = "13")]
        GetDeviceMetadataResponse(super::DeviceMetadata),
        #[prost(message, tag = "32")]
        SetOwner(super::User),
        #[prost(message, tag = "33")]
        SetChannel(super::Channel),
        #[prost(message, tag = "34")]
        SetConfig(super::Config),
        #[prost(message, tag = "35")]
        SetModuleConfig(super::ModuleConfig),
        #[prost(uint32, tag = "38")]
        RemoveByNodenum(u32),
        #[prost(uint32, tag = "39")]
        SetFavoriteNode(u32),
        #[prost(uint32, tag = "40")]
        RemoveFavoriteNode(u32),
        #[prost(message, tag = "41")]
        SetFixedPosition(super::Position),
        #[prost(bool, tag = "42")]
        RemoveFixedPosition(bool),
        #[prost(uint32, tag = "47")]
        SetIgnoredNode(u32),
        #[prost(uint32, tag = "48")]
        RemoveIgnoredNode(u32),
        #[prost(bool, tag = "64")]
        BeginEditSettings(bool),
        #[prost(bool, tag = "65")]
        CommitEditSettings(bool),
        #[prost(int32, tag = "97")]
        RebootSeconds(i32),
        #[prost(int32, tag = "100")]
        NodedbReset(i32),
    }

    impl PayloadVariant {
        /// Stable subcommand name used in audit entries.
        pub fn name(&self) -> &'static str {
            match self {
                PayloadVariant::GetChannelRequest(_) => "getChannelRequest",
                PayloadVariant::GetChannelResponse(_) => "getChannelResponse",
                PayloadVariant::GetOwnerRequest(_) => "getOwnerRequest",
                PayloadVariant::GetOwnerResponse(_) => "getOwnerResponse",
                PayloadVariant::GetConfigRequest(_) => "getConfigRequest",
                PayloadVariant::GetConfigResponse(_) => "getConfigResponse",
                PayloadVariant::GetModuleConfigRequest(_) => "getModuleConfigRequest",
                PayloadVariant::GetModuleConfigResponse(_) => "getModuleConfigResponse",
                PayloadVariant::GetDeviceMetadataRequest(_) => "getDeviceMetadataRequest",
                PayloadVariant::GetDeviceMetadataResponse(_) => "getDeviceMetadataResponse",
                PayloadVariant::SetOwner(_) => "setOwner",
                PayloadVariant::SetChannel(_) => "setChannel",
                PayloadVariant::SetConfig(_) => "setConfig",
                PayloadVariant::SetModuleConfig(_) => "setModuleConfig",
                PayloadVariant::RemoveByNodenum(_) => "removeByNodenum",
                PayloadVariant::SetFavoriteNode(_) => "setFavoriteNode",
                PayloadVariant::RemoveFavoriteNode(_) => "removeFavoriteNode",
                PayloadVariant::SetFixedPosition(_) => "setFixedPosition",
                PayloadVariant::RemoveFixedPosition(_) => "removeFixedPosition",
                PayloadVariant::SetIgnoredNode(_) => "setIgnoredNode",
                PayloadVariant::RemoveIgnoredNode(_) => "removeIgnoredNode",
                PayloadVariant::BeginEditSettings(_) => "beginEditSettings",
                PayloadVariant::CommitEditSettings(_) => "commitEditSettings",
                PayloadVariant::RebootSeconds(_) => "rebootSeconds",
                PayloadVariant::NodedbReset(_) => "nodedbReset",
            }
        }
    }
}

use admin_message::PayloadVariant;

impl AdminMessage {
    fn with_variant(variant: PayloadVariant, passkey: &[u8]) -> Self {
        AdminMessage {
            payload_variant: Some(variant),
            session_passkey: passkey.to_vec(),
        }
    }

    pub fn get_config(section: AdminConfigType) -> Self {
        Self::with_variant(PayloadVariant::GetConfigRequest(section as i32), &[])
    }

    /// Ask the device for a fresh session passkey.
    pub fn get_session_key() -> Self {
        Self::get_config(AdminConfigType::SessionkeyConfig)
    }

    pub fn get_owner() -> Self {
        Self::with_variant(PayloadVariant::GetOwnerRequest(true), &[])
    }

    pub fn get_device_metadata() -> Self {
        Self::with_variant(PayloadVariant::GetDeviceMetadataRequest(true), &[])
    }

    pub fn set_owner(owner: User, passkey: &[u8]) -> Self {
        Self::with_variant(PayloadVariant::SetOwner(owner), passkey)
    }

    pub fn set_channel(channel: Channel, passkey: &[u8]) -> Self {
        Self::with_variant(PayloadVariant::SetChannel(channel), passkey)
    }

    pub fn set_config(config: Config, passkey: &[u8]) -> Self {
        Self::with_variant(PayloadVariant::SetConfig(config), passkey)
    }

    pub fn set_module_config(config: ModuleConfig, passkey: &[u8]) -> Self {
        Self::with_variant(PayloadVariant::SetModuleConfig(config), passkey)
    }

    pub fn set_fixed_position(position: Position, passkey: &[u8]) -> Self {
        Self::with_variant(PayloadVariant::SetFixedPosition(position), passkey)
    }

    pub fn set_favorite_node(node_num: u32, passkey: &[u8]) -> Self {
        Self::with_variant(PayloadVariant::SetFavoriteNode(node_num), passkey)
    }

    pub fn remove_favorite_node(node_num: u32, passkey: &[u8]) -> Self {
        Self::with_variant(PayloadVariant::RemoveFavoriteNode(node_num), passkey)
    }

    pub fn set_ignored_node(node_num: u32, passkey: &[u8]) -> Self {
        Self::with_variant(PayloadVariant::SetIgnoredNode(node_num), passkey)
    }

    pub fn remove_ignored_node(node_num: u32, passkey: &[u8]) -> Self {
        Self::with_variant(PayloadVariant::RemoveIgnoredNode(node_num), passkey)
    }

    pub fn remove_by_nodenum(node_num: u32, passkey: &[u8]) -> Self {
        Self::with_variant(PayloadVariant::RemoveByNodenum(node_num), passkey)
    }

    pub fn begin_edit_settings() -> Self {
        Self::with_variant(PayloadVariant::BeginEditSettings(true), &[])
    }

    pub fn commit_edit_settings(passkey: &[u8]) -> Self {
        Self::with_variant(PayloadVariant::CommitEditSettings(true), passkey)
    }

    pub fn reboot(seconds: i32, passkey: &[u8]) -> Self {
        Self::with_variant(PayloadVariant::RebootSeconds(seconds), passkey)
    }

    pub fn nodedb_reset(passkey: &[u8]) -> Self {
        Self::with_variant(PayloadVariant::NodedbReset(1), passkey)
    }

    /// Audit name of the subcommand, or "empty" when none decoded.
    pub fn subcommand_name(&self) -> &'static str {
        self.payload_variant
            .as_ref()
            .map(|v| v.name())
            .unwrap_or("empty")
    }
}

/// Decode an ADMIN_APP payload, all-or-nothing.
pub fn decode_admin(bytes: &[u8]) -> Result<AdminMessage> {
    Ok(AdminMessage::decode(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_favorite_round_trip() {
        let msg = AdminMessage::set_favorite_node(0xabcd0001, b"pass");
        let decoded = decode_admin(&msg.encode_to_vec()).unwrap();
        assert_eq!(
            decoded.payload_variant,
            Some(PayloadVariant::SetFavoriteNode(0xabcd0001))
        );
        assert_eq!(decoded.session_passkey, b"pass");
        assert_eq!(decoded.subcommand_name(), "setFavoriteNode");
    }

    #[test]
    fn test_session_key_request_shape() {
        let msg = AdminMessage::get_session_key();
        assert_eq!(
            msg.payload_variant,
            Some(PayloadVariant::GetConfigRequest(
                AdminConfigType::SessionkeyConfig as i32
            ))
        );
        assert!(msg.session_passkey.is_empty());
    }

    #[test]
    fn test_unknown_subcommand_decodes_empty() {
        // Field 99 (shutdown_seconds) is not mirrored; the decode must
        // still succeed so the caller can drop it by name.
        let raw = [0x98, 0x06, 0x05]; // field 99, varint, value 5
        let decoded = decode_admin(&raw).unwrap();
        assert_eq!(decoded.subcommand_name(), "empty");
    }

    #[test]
    fn test_set_owner_name() {
        let owner = User {
            long_name: "Base Camp".to_string(),
            short_name: "BC".to_string(),
            ..Default::default()
        };
        let msg = AdminMessage::set_owner(owner, &[]);
        assert_eq!(msg.subcommand_name(), "setOwner");
    }
}
