//! Mirror of the Meshtastic `config.proto` / `module_config.proto` subset.
//!
//! Config records mostly pass through this process verbatim (cached at
//! session configure time, replayed to virtual-node clients from their raw
//! bytes), so only the fields the monitor itself inspects are mirrored.

/// Device-level configuration; exactly one section per record.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Config {
    #[prost(oneof = "config::PayloadVariant", tags = "1, 2, 3, 4, 5, 6, 7, 8, 9")]
    pub payload_variant: Option<config::PayloadVariant>,
}

pub mod config {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "1")]
        Device(super::DeviceConfig),
        #[prost(message, tag = "2")]
        Position(super::PositionConfig),
        #[prost(message, tag = "3")]
        Power(super::PowerConfig),
        #[prost(message, tag = "4")]
        Network(super::NetworkConfig),
        #[prost(message, tag = "5")]
        Display(super::DisplayConfig),
        #[prost(message, tag = "6")]
        Lora(super::LoRaConfig),
        #[prost(message, tag = "7")]
        Bluetooth(super::BluetoothConfig),
        #[prost(message, tag = "8")]
        Security(super::SecurityConfig),
        #[prost(message, tag = "9")]
        Sessionkey(super::SessionkeyConfig),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeviceConfig {
    #[prost(int32, tag = "1")]
    pub role: i32,
    #[prost(uint32, tag = "7")]
    pub node_info_broadcast_secs: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PositionConfig {
    #[prost(uint32, tag = "1")]
    pub position_broadcast_secs: u32,
    #[prost(bool, tag = "2")]
    pub position_broadcast_smart_enabled: bool,
    #[prost(bool, tag = "3")]
    pub fixed_position: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PowerConfig {
    #[prost(bool, tag = "1")]
    pub is_power_saving: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NetworkConfig {
    #[prost(bool, tag = "1")]
    pub wifi_enabled: bool,
    #[prost(string, tag = "3")]
    pub wifi_ssid: String,
    #[prost(string, tag = "5")]
    pub ntp_server: String,
    #[prost(bool, tag = "6")]
    pub eth_enabled: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DisplayConfig {
    #[prost(uint32, tag = "1")]
    pub screen_on_secs: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LoRaConfig {
    #[prost(bool, tag = "1")]
    pub use_preset: bool,
    #[prost(int32, tag = "2")]
    pub modem_preset: i32,
    #[prost(int32, tag = "7")]
    pub region: i32,
    #[prost(uint32, tag = "8")]
    pub hop_limit: u32,
    #[prost(bool, tag = "9")]
    pub tx_enabled: bool,
    #[prost(int32, tag = "10")]
    pub tx_power: i32,
    #[prost(uint32, tag = "11")]
    pub channel_num: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BluetoothConfig {
    #[prost(bool, tag = "1")]
    pub enabled: bool,
    #[prost(int32, tag = "2")]
    pub mode: i32,
    #[prost(uint32, tag = "3")]
    pub fixed_pin: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SecurityConfig {
    #[prost(bytes = "vec", tag = "1")]
    pub public_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub private_key: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "3")]
    pub admin_key: Vec<Vec<u8>>,
    #[prost(bool, tag = "4")]
    pub is_managed: bool,
    #[prost(bool, tag = "8")]
    pub admin_channel_enabled: bool,
}

/// Empty marker section; requesting it makes the device mint a session
/// passkey for subsequent admin commands.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SessionkeyConfig {}

/// Module configuration; exactly one section per record.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ModuleConfig {
    #[prost(oneof = "module_config::PayloadVariant", tags = "1, 10")]
    pub payload_variant: Option<module_config::PayloadVariant>,
}

pub mod module_config {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "1")]
        Mqtt(super::MqttConfig),
        #[prost(message, tag = "10")]
        NeighborInfo(super::NeighborInfoConfig),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MqttConfig {
    #[prost(bool, tag = "1")]
    pub enabled: bool,
    #[prost(string, tag = "2")]
    pub address: String,
    #[prost(string, tag = "3")]
    pub username: String,
    #[prost(string, tag = "4")]
    pub password: String,
    #[prost(bool, tag = "5")]
    pub encryption_enabled: bool,
    #[prost(bool, tag = "6")]
    pub json_enabled: bool,
    #[prost(bool, tag = "7")]
    pub tls_enabled: bool,
    #[prost(string, tag = "8")]
    pub root: String,
    #[prost(bool, tag = "9")]
    pub proxy_to_client_enabled: bool,
    #[prost(bool, tag = "10")]
    pub map_reporting_enabled: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NeighborInfoConfig {
    #[prost(bool, tag = "1")]
    pub enabled: bool,
    #[prost(uint32, tag = "2")]
    pub update_interval: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_config_section_round_trip() {
        let config = Config {
            payload_variant: Some(config::PayloadVariant::Lora(LoRaConfig {
                use_preset: true,
                modem_preset: 0,
                region: 3,
                hop_limit: 3,
                tx_enabled: true,
                tx_power: 27,
                channel_num: 20,
            })),
        };

        let decoded = Config::decode(config.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn test_unknown_section_decodes_as_none() {
        // A section this mirror does not carry (e.g. device-ui, tag 10)
        // must not fail the decode; the record stays pass-through.
        let raw = [0x52, 0x00]; // field 10, length-delimited, empty
        let decoded = Config::decode(&raw[..]).unwrap();
        assert!(decoded.payload_variant.is_none());
    }
}
