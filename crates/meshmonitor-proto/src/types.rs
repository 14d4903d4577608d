//! Node identifiers, coordinates, and wire-unit helpers

use crate::error::{ProtoError, Result};

/// Broadcast destination node number.
pub const BROADCAST_NUM: u32 = 0xFFFF_FFFF;

/// String form of the broadcast node number.
pub const BROADCAST_ID: &str = "!ffffffff";

/// Channel sentinel used in snapshots for direct messages.
pub const DM_CHANNEL: i32 = -1;

/// Raw traceroute SNR value meaning "unknown" (MQTT hops, older firmware).
pub const SNR_UNKNOWN_RAW: i32 = -128;

/// Traceroute SNR values are scaled by 4 on the wire.
pub const SNR_SCALE: f64 = 4.0;

/// Format a node number as its canonical string id: `!` + 8 lowercase hex.
pub fn node_id_from_num(num: u32) -> String {
    format!("!{:08x}", num)
}

/// Parse a canonical node id back to its node number.
pub fn node_num_from_id(id: &str) -> Result<u32> {
    let hex8 = id
        .strip_prefix('!')
        .filter(|rest| rest.len() == 8)
        .ok_or_else(|| ProtoError::InvalidNodeId(id.to_string()))?;
    u32::from_str_radix(hex8, 16).map_err(|_| ProtoError::InvalidNodeId(id.to_string()))
}

/// Convert decimal degrees to the on-wire 1e-7 fixed-point form.
pub fn degrees_to_i(degrees: f64) -> i32 {
    (degrees * 1e7).round() as i32
}

/// Convert the on-wire 1e-7 fixed-point form back to decimal degrees.
pub fn i_to_degrees(value: i32) -> f64 {
    value as f64 / 1e7
}

/// Decode a scaled traceroute SNR value to dB.
///
/// The `-128` sentinel is an explicit unknown and is never surfaced as a
/// (bogus) −32 dB reading.
pub fn traceroute_snr_db(raw: i32) -> Option<f64> {
    if raw == SNR_UNKNOWN_RAW {
        None
    } else {
        Some(raw as f64 / SNR_SCALE)
    }
}

/// Human-readable device role name (Config.DeviceConfig.Role values).
pub fn role_name(role: i32) -> &'static str {
    match role {
        0 => "CLIENT",
        1 => "CLIENT_MUTE",
        2 => "ROUTER",
        3 => "ROUTER_CLIENT",
        4 => "REPEATER",
        5 => "TRACKER",
        6 => "SENSOR",
        7 => "TAK",
        8 => "CLIENT_HIDDEN",
        9 => "LOST_AND_FOUND",
        10 => "TAK_TRACKER",
        11 => "ROUTER_LATE",
        _ => "UNKNOWN",
    }
}

/// Human-readable hardware model name for the models commonly seen on a
/// mesh; anything else renders by number.
pub fn hardware_model_name(hw_model: i32) -> Option<&'static str> {
    let name = match hw_model {
        0 => "UNSET",
        1 => "TLORA_V2",
        2 => "TLORA_V1",
        3 => "TLORA_V2_1_1P6",
        4 => "TBEAM",
        5 => "HELTEC_V2_0",
        6 => "TBEAM_V0P7",
        7 => "T_ECHO",
        8 => "TLORA_V1_1P3",
        9 => "RAK4631",
        10 => "HELTEC_V2_1",
        11 => "HELTEC_V1",
        12 => "LILYGO_TBEAM_S3_CORE",
        13 => "RAK11200",
        14 => "NANO_G1",
        15 => "TLORA_V2_1_1P8",
        16 => "TLORA_T3_S3",
        17 => "NANO_G1_EXPLORER",
        18 => "NANO_G2_ULTRA",
        25 => "STATION_G1",
        26 => "RAK11310",
        29 => "CANARYONE",
        31 => "STATION_G2",
        39 => "DIY_V1",
        41 => "DR_DEV",
        42 => "M5STACK",
        43 => "HELTEC_V3",
        44 => "HELTEC_WSL_V3",
        47 => "RPI_PICO",
        48 => "HELTEC_WIRELESS_TRACKER",
        49 => "HELTEC_WIRELESS_PAPER",
        50 => "T_DECK",
        51 => "T_WATCH_S3",
        52 => "PICOMPUTER_S3",
        53 => "HELTEC_HT62",
        57 => "HELTEC_WIRELESS_PAPER_V1_0",
        58 => "HELTEC_WIRELESS_TRACKER_V1_0",
        59 => "UNPHONE",
        64 => "PORTDUINO",
        65 => "ANDROID_SIM",
        66 => "DIY_DEVICE",
        71 => "RAK2560",
        72 => "HELTEC_HRU_3601",
        73 => "HELTEC_WIRELESS_BRIDGE",
        74 => "SEEED_SOLAR_NODE",
        76 => "TRACKER_T1000_E",
        80 => "SEEED_XIAO_S3",
        _ => return None,
    };
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_round_trip() {
        assert_eq!(node_id_from_num(0xabcd0001), "!abcd0001");
        assert_eq!(node_num_from_id("!abcd0001").unwrap(), 0xabcd0001);
        assert_eq!(node_id_from_num(BROADCAST_NUM), BROADCAST_ID);
        assert_eq!(node_num_from_id(BROADCAST_ID).unwrap(), BROADCAST_NUM);
    }

    #[test]
    fn test_node_id_rejects_malformed() {
        assert!(node_num_from_id("abcd0001").is_err());
        assert!(node_num_from_id("!abcd").is_err());
        assert!(node_num_from_id("!zzzz0001").is_err());
        assert!(node_num_from_id("!abcd00011").is_err());
    }

    #[test]
    fn test_coordinate_round_trip() {
        let lat = 52.520008;
        let i = degrees_to_i(lat);
        assert_eq!(i, 525_200_080);
        assert!((i_to_degrees(i) - lat).abs() < 1e-7);
    }

    #[test]
    fn test_snr_sentinel_is_unknown() {
        assert_eq!(traceroute_snr_db(SNR_UNKNOWN_RAW), None);
        assert_eq!(traceroute_snr_db(-127), Some(-31.75));
        assert_eq!(traceroute_snr_db(26), Some(6.5));
    }

    #[test]
    fn test_role_names() {
        assert_eq!(role_name(2), "ROUTER");
        assert_eq!(role_name(99), "UNKNOWN");
    }
}
