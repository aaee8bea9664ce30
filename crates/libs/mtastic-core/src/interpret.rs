//! Payload interpretation: decoded mesh data to normalized records.

use core::fmt;

use prost::Message;
use serde_json::{json, Map, Value};

use crate::envelope::Envelope;
use crate::error::DecodeError;
use crate::proto::telemetry::Variant;
use crate::proto::{Data, NeighborInfo, PortNum, Position, Telemetry, User};

/// Attribute map of one record type. Ordered by key.
pub type Attributes = Map<String, Value>;

/// Scale of `Position.latitude_i` / `longitude_i`.
const COORDINATE_SCALE: f64 = 1e7;

/// Record types the bridge produces; each becomes a top-level key in the
/// device state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordType {
    Position,
    DeviceMetrics,
    EnvironmentMetrics,
    NodeInfo,
    NeighborInfo,
    TextMessage,
}

impl RecordType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Position => "position",
            Self::DeviceMetrics => "device_metrics",
            Self::EnvironmentMetrics => "environment_metrics",
            Self::NodeInfo => "nodeinfo",
            Self::NeighborInfo => "neighborinfo",
            Self::TextMessage => "text_message",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized `(type, attributes)` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub kind: RecordType,
    pub attributes: Attributes,
}

impl Record {
    fn new<const N: usize>(kind: RecordType, pairs: [(&str, Value); N]) -> Self {
        let attributes = pairs.into_iter().map(|(key, value)| (key.to_string(), value)).collect();
        Self { kind, attributes }
    }
}

/// Interpret the decoded payload of an envelope.
///
/// Fails with [`DecodeError::MissingField`] if the packet is still
/// encrypted.
pub fn interpret(envelope: &Envelope) -> Result<Option<Record>, DecodeError> {
    let data = envelope.decoded().ok_or(DecodeError::MissingField("packet.decoded"))?;
    interpret_data(data, envelope)
}

/// Interpret `data` in the context of its owning envelope.
///
/// `Ok(None)` means the port carries nothing the bridge tracks. That is the
/// common case on a busy channel and is not an error.
pub fn interpret_data(data: &Data, envelope: &Envelope) -> Result<Option<Record>, DecodeError> {
    let payload = data.payload.as_slice();
    let record = match PortNum::try_from(data.portnum) {
        Ok(PortNum::PositionApp) => Some(position(&Position::decode(payload)?)),
        Ok(PortNum::TelemetryApp) => telemetry(&Telemetry::decode(payload)?),
        Ok(PortNum::NodeinfoApp) => Some(node_info(&User::decode(payload)?)),
        Ok(PortNum::NeighborinfoApp) => Some(neighbor_info(&NeighborInfo::decode(payload)?)),
        Ok(PortNum::TextMessageApp) => {
            let text = String::from_utf8(data.payload.clone())?;
            Some(Record::new(
                RecordType::TextMessage,
                [("text", json!(text)), ("rx_time", json!(envelope.rx_time()))],
            ))
        }
        Ok(other) => {
            log::debug!("ignoring unsupported port {other:?} from !{:08x}", envelope.from_node());
            None
        }
        Err(_) => {
            log::debug!("ignoring unknown port {} from !{:08x}", data.portnum, envelope.from_node());
            None
        }
    };
    Ok(record)
}

fn position(pos: &Position) -> Record {
    Record::new(
        RecordType::Position,
        [
            ("latitude_i", json!(pos.latitude_i)),
            ("longitude_i", json!(pos.longitude_i)),
            ("latitude", json!(f64::from(pos.latitude_i) / COORDINATE_SCALE)),
            ("longitude", json!(f64::from(pos.longitude_i) / COORDINATE_SCALE)),
            ("altitude", json!(pos.altitude)),
            ("ground_speed", json!(pos.ground_speed)),
            ("sats_in_view", json!(pos.sats_in_view)),
        ],
    )
}

fn telemetry(telemetry: &Telemetry) -> Option<Record> {
    match telemetry.variant.as_ref()? {
        Variant::DeviceMetrics(m) => Some(Record::new(
            RecordType::DeviceMetrics,
            [
                ("battery_level", json!(m.battery_level)),
                ("voltage", json!(m.voltage)),
                ("channel_utilization", json!(m.channel_utilization)),
                ("air_util_tx", json!(m.air_util_tx)),
            ],
        )),
        Variant::EnvironmentMetrics(m) => Some(Record::new(
            RecordType::EnvironmentMetrics,
            [
                ("temperature", json!(m.temperature)),
                ("relative_humidity", json!(m.relative_humidity)),
                ("barometric_pressure", json!(m.barometric_pressure)),
                ("gas_resistance", json!(m.gas_resistance)),
            ],
        )),
    }
}

fn node_info(user: &User) -> Record {
    Record::new(
        RecordType::NodeInfo,
        [
            ("id", json!(user.id)),
            ("shortname", json!(user.short_name)),
            ("longname", json!(user.long_name)),
        ],
    )
}

fn neighbor_info(info: &NeighborInfo) -> Record {
    let neighbors: Vec<Value> = info
        .neighbors
        .iter()
        .map(|n| json!({ "node_id": n.node_id, "snr": n.snr }))
        .collect();
    Record::new(
        RecordType::NeighborInfo,
        [("neighbors_count", json!(neighbors.len())), ("neighbors", Value::Array(neighbors))],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::mesh_packet::PayloadVariant;
    use crate::proto::{DeviceMetrics, EnvironmentMetrics, MeshPacket, Neighbor};

    fn envelope_with(portnum: i32, payload: Vec<u8>) -> Envelope {
        Envelope {
            gateway_id: "!0a1b2c3d".into(),
            channel_id: "LongFast".into(),
            packet: MeshPacket {
                from: 0x0a1b_2c3d,
                id: 42,
                rx_time: 1_700_000_123,
                payload_variant: Some(PayloadVariant::Decoded(Data {
                    portnum,
                    payload,
                    ..Default::default()
                })),
                ..Default::default()
            },
        }
    }

    fn interpret_port(port: PortNum, payload: Vec<u8>) -> Option<Record> {
        interpret(&envelope_with(port as i32, payload)).expect("interpret")
    }

    #[test]
    fn position_is_scaled() {
        let pos = Position {
            latitude_i: 407_128_000,
            longitude_i: -740_060_000,
            altitude: 10,
            ground_speed: 3,
            sats_in_view: 7,
            ..Default::default()
        };
        let record = interpret_port(PortNum::PositionApp, pos.encode_to_vec()).expect("record");
        assert_eq!(record.kind, RecordType::Position);
        let attrs = &record.attributes;
        assert_eq!(attrs["latitude_i"], json!(407_128_000));
        assert_eq!(attrs["longitude_i"], json!(-740_060_000));
        let lat = attrs["latitude"].as_f64().expect("latitude");
        let lon = attrs["longitude"].as_f64().expect("longitude");
        assert!((lat - 40.7128).abs() < 1e-9);
        assert!((lon + 74.006).abs() < 1e-9);
        assert_eq!(attrs["altitude"], json!(10));
        assert_eq!(attrs["ground_speed"], json!(3));
        assert_eq!(attrs["sats_in_view"], json!(7));
    }

    #[test]
    fn device_metrics_variant() {
        let telemetry = Telemetry {
            time: 1,
            variant: Some(Variant::DeviceMetrics(DeviceMetrics {
                battery_level: 87,
                voltage: 4.125,
                channel_utilization: 12.5,
                air_util_tx: 0.75,
                uptime_seconds: 3600,
            })),
        };
        let record =
            interpret_port(PortNum::TelemetryApp, telemetry.encode_to_vec()).expect("record");
        assert_eq!(record.kind, RecordType::DeviceMetrics);
        let expected: Attributes = serde_json::from_value(json!({
            "battery_level": 87,
            "voltage": 4.125,
            "channel_utilization": 12.5,
            "air_util_tx": 0.75,
        }))
        .expect("map");
        assert_eq!(record.attributes, expected);
    }

    #[test]
    fn environment_metrics_variant() {
        let telemetry = Telemetry {
            time: 1,
            variant: Some(Variant::EnvironmentMetrics(EnvironmentMetrics {
                temperature: 21.5,
                relative_humidity: 40.0,
                barometric_pressure: 1013.25,
                gas_resistance: 0.5,
            })),
        };
        let record =
            interpret_port(PortNum::TelemetryApp, telemetry.encode_to_vec()).expect("record");
        assert_eq!(record.kind, RecordType::EnvironmentMetrics);
        assert_eq!(record.attributes["temperature"], json!(21.5));
        assert_eq!(record.attributes["barometric_pressure"], json!(1013.25));
        assert_eq!(record.attributes.len(), 4);
    }

    #[test]
    fn telemetry_without_variant_is_ignored() {
        let telemetry = Telemetry { time: 5, variant: None };
        assert!(interpret_port(PortNum::TelemetryApp, telemetry.encode_to_vec()).is_none());
    }

    #[test]
    fn node_info_fields() {
        let user = User {
            id: "!0a1b2c3d".into(),
            long_name: "Roof Node".into(),
            short_name: "ROOF".into(),
            ..Default::default()
        };
        let record = interpret_port(PortNum::NodeinfoApp, user.encode_to_vec()).expect("record");
        assert_eq!(record.kind, RecordType::NodeInfo);
        assert_eq!(record.attributes["id"], json!("!0a1b2c3d"));
        assert_eq!(record.attributes["shortname"], json!("ROOF"));
        assert_eq!(record.attributes["longname"], json!("Roof Node"));
    }

    #[test]
    fn neighbor_info_keeps_order_and_count() {
        let info = NeighborInfo {
            node_id: 0x0a1b_2c3d,
            neighbors: vec![
                Neighbor { node_id: 3, snr: 6.25, ..Default::default() },
                Neighbor { node_id: 1, snr: -2.5, ..Default::default() },
            ],
            ..Default::default()
        };
        let record =
            interpret_port(PortNum::NeighborinfoApp, info.encode_to_vec()).expect("record");
        assert_eq!(record.kind, RecordType::NeighborInfo);
        assert_eq!(record.attributes["neighbors_count"], json!(2));
        assert_eq!(
            record.attributes["neighbors"],
            json!([{ "node_id": 3, "snr": 6.25 }, { "node_id": 1, "snr": -2.5 }])
        );
    }

    #[test]
    fn text_message_copies_rx_time() {
        let record =
            interpret_port(PortNum::TextMessageApp, "hello 🌍".as_bytes().to_vec()).expect("record");
        assert_eq!(record.kind, RecordType::TextMessage);
        assert_eq!(record.attributes["text"], json!("hello 🌍"));
        assert_eq!(record.attributes["rx_time"], json!(1_700_000_123));
    }

    #[test]
    fn invalid_utf8_text_is_a_decode_error() {
        let envelope = envelope_with(PortNum::TextMessageApp as i32, vec![0xff, 0xfe]);
        assert!(matches!(interpret(&envelope), Err(DecodeError::InvalidText(_))));
    }

    #[test]
    fn unsupported_and_unknown_ports_yield_nothing() {
        assert!(interpret_port(PortNum::RoutingApp, vec![1, 2, 3]).is_none());
        assert!(interpret(&envelope_with(9999, vec![1, 2, 3])).expect("interpret").is_none());
    }

    #[test]
    fn malformed_sub_message_is_a_decode_error() {
        let envelope = envelope_with(PortNum::PositionApp as i32, vec![0x0a, 0x10, 0x01]);
        assert!(matches!(interpret(&envelope), Err(DecodeError::Protobuf(_))));
    }

    #[test]
    fn encrypted_envelope_cannot_be_interpreted() {
        let mut envelope = envelope_with(PortNum::TextMessageApp as i32, Vec::new());
        envelope.packet.payload_variant = Some(PayloadVariant::Encrypted(vec![1, 2, 3]));
        assert!(matches!(interpret(&envelope), Err(DecodeError::MissingField(_))));
    }
}
