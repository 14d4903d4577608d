//! Mirror of the Meshtastic `channel.proto` subset.

/// Logical radio subnet, index 0–7.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Channel {
    #[prost(int32, tag = "1")]
    pub index: i32,
    #[prost(message, optional, tag = "2")]
    pub settings: Option<ChannelSettings>,
    #[prost(enumeration = "ChannelRole", tag = "3")]
    pub role: i32,
}

/// Channel key material and naming.
///
/// `psk` semantics: empty = unencrypted, a single byte 1 = the well-known
/// default key, a single byte 2.. = a simple preset, anything longer is an
/// explicit key.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChannelSettings {
    #[prost(bytes = "vec", tag = "2")]
    pub psk: Vec<u8>,
    #[prost(string, tag = "3")]
    pub name: String,
    #[prost(fixed32, tag = "4")]
    pub id: u32,
    #[prost(bool, tag = "5")]
    pub uplink_enabled: bool,
    #[prost(bool, tag = "6")]
    pub downlink_enabled: bool,
    #[prost(message, optional, tag = "7")]
    pub module_settings: Option<ModuleSettings>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ModuleSettings {
    #[prost(uint32, tag = "1")]
    pub position_precision: u32,
    #[prost(bool, tag = "2")]
    pub is_client_muted: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ChannelRole {
    Disabled = 0,
    Primary = 1,
    Secondary = 2,
}

impl ChannelRole {
    pub fn name(&self) -> &'static str {
        match self {
            ChannelRole::Disabled => "disabled",
            ChannelRole::Primary => "primary",
            ChannelRole::Secondary => "secondary",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_channel_round_trip() {
        let channel = Channel {
            index: 0,
            settings: Some(ChannelSettings {
                psk: vec![1],
                name: "LongFast".to_string(),
                id: 0,
                uplink_enabled: true,
                downlink_enabled: false,
                module_settings: None,
            }),
            role: ChannelRole::Primary as i32,
        };

        let decoded = Channel::decode(channel.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, channel);
        assert_eq!(ChannelRole::try_from(decoded.role), Ok(ChannelRole::Primary));
    }
}
