//! Meshtastic protobuf schema, restricted to the messages the bridge reads.
//!
//! Field numbers and wire types must match the upstream `mqtt.proto`,
//! `mesh.proto` and `telemetry.proto` definitions. Fields the bridge never
//! looks at are left out; prost skips unknown tags while decoding.

/// Outer record published by a gateway node on the MQTT uplink.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServiceEnvelope {
    #[prost(message, optional, tag = "1")]
    pub packet: Option<MeshPacket>,
    #[prost(string, tag = "2")]
    pub channel_id: String,
    /// Node id of the relaying gateway, e.g. `!0a1b2c3d`.
    #[prost(string, tag = "3")]
    pub gateway_id: String,
}

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
    #[prost(int32, tag = "12")]
    pub rx_rssi: i32,
    #[prost(bool, tag = "14")]
    pub via_mqtt: bool,
    #[prost(uint32, tag = "15")]
    pub hop_start: u32,
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

/// Decrypted application payload of a mesh packet.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Data {
    #[prost(enumeration = "PortNum", tag = "1")]
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
}

/// Application port numbers.
///
/// Only a handful are interpreted; the rest are listed so logs can name
/// what was skipped.
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
    PrivateApp = 256,
    AtakForwarder = 257,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Position {
    #[prost(sfixed32, tag = "1")]
    pub latitude_i: i32,
    #[prost(sfixed32, tag = "2")]
    pub longitude_i: i32,
    #[prost(int32, tag = "3")]
    pub altitude: i32,
    #[prost(fixed32, tag = "4")]
    pub time: u32,
    #[prost(uint32, tag = "15")]
    pub ground_speed: u32,
    #[prost(uint32, tag = "16")]
    pub ground_track: u32,
    #[prost(uint32, tag = "19")]
    pub sats_in_view: u32,
    #[prost(uint32, tag = "23")]
    pub precision_bits: u32,
}

/// Node identity broadcast (`NODEINFO_APP`).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct User {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub long_name: String,
    #[prost(string, tag = "3")]
    pub short_name: String,
    #[prost(bytes = "vec", tag = "4")]
    pub macaddr: Vec<u8>,
    #[prost(int32, tag = "5")]
    pub hw_model: i32,
    #[prost(bool, tag = "6")]
    pub is_licensed: bool,
    #[prost(int32, tag = "7")]
    pub role: i32,
}

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
    #[prost(fixed32, tag = "3")]
    pub last_rx_time: u32,
    #[prost(uint32, tag = "4")]
    pub node_broadcast_interval_secs: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Telemetry {
    #[prost(fixed32, tag = "1")]
    pub time: u32,
    #[prost(oneof = "telemetry::Variant", tags = "2, 3")]
    pub variant: Option<telemetry::Variant>,
}

pub mod telemetry {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Variant {
        #[prost(message, tag = "2")]
        DeviceMetrics(super::DeviceMetrics),
        #[prost(message, tag = "3")]
        EnvironmentMetrics(super::EnvironmentMetrics),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeviceMetrics {
    #[prost(uint32, tag = "1")]
    pub battery_level: u32,
    #[prost(float, tag = "2")]
    pub voltage: f32,
    #[prost(float, tag = "3")]
    pub channel_utilization: f32,
    #[prost(float, tag = "4")]
    pub air_util_tx: f32,
    #[prost(uint32, tag = "5")]
    pub uptime_seconds: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EnvironmentMetrics {
    #[prost(float, tag = "1")]
    pub temperature: f32,
    #[prost(float, tag = "2")]
    pub relative_humidity: f32,
    #[prost(float, tag = "3")]
    pub barometric_pressure: f32,
    #[prost(float, tag = "4")]
    pub gas_resistance: f32,
}
