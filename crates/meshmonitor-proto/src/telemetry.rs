//! Mirror of the Meshtastic `telemetry.proto` subset.

/// One telemetry sample; exactly one metrics variant is present.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Telemetry {
    #[prost(fixed32, tag = "1")]
    pub time: u32,
    #[prost(oneof = "telemetry::Variant", tags = "2, 3, 5")]
    pub variant: Option<telemetry::Variant>,
}

pub mod telemetry {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Variant {
        #[prost(message, tag = "2")]
        DeviceMetrics(super::DeviceMetrics),
        #[prost(message, tag = "3")]
        EnvironmentMetrics(super::EnvironmentMetrics),
        #[prost(message, tag = "5")]
        PowerMetrics(super::PowerMetrics),
    }
}

/// Radio health metrics. Battery level 101 means externally powered.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeviceMetrics {
    #[prost(uint32, optional, tag = "1")]
    pub battery_level: Option<u32>,
    #[prost(float, optional, tag = "2")]
    pub voltage: Option<f32>,
    #[prost(float, optional, tag = "3")]
    pub channel_utilization: Option<f32>,
    #[prost(float, optional, tag = "4")]
    pub air_util_tx: Option<f32>,
    #[prost(uint32, optional, tag = "5")]
    pub uptime_seconds: Option<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EnvironmentMetrics {
    #[prost(float, optional, tag = "1")]
    pub temperature: Option<f32>,
    #[prost(float, optional, tag = "2")]
    pub relative_humidity: Option<f32>,
    #[prost(float, optional, tag = "3")]
    pub barometric_pressure: Option<f32>,
    #[prost(float, optional, tag = "4")]
    pub gas_resistance: Option<f32>,
    #[prost(float, optional, tag = "5")]
    pub voltage: Option<f32>,
    #[prost(float, optional, tag = "6")]
    pub current: Option<f32>,
    #[prost(uint32, optional, tag = "7")]
    pub iaq: Option<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PowerMetrics {
    #[prost(float, optional, tag = "1")]
    pub ch1_voltage: Option<f32>,
    #[prost(float, optional, tag = "2")]
    pub ch1_current: Option<f32>,
    #[prost(float, optional, tag = "3")]
    pub ch2_voltage: Option<f32>,
    #[prost(float, optional, tag = "4")]
    pub ch2_current: Option<f32>,
    #[prost(float, optional, tag = "5")]
    pub ch3_voltage: Option<f32>,
    #[prost(float, optional, tag = "6")]
    pub ch3_current: Option<f32>,
}
