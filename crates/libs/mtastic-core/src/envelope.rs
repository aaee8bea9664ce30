//! Envelope codec: raw MQTT payload bytes to a validated [`Envelope`].

use prost::Message;

use crate::error::DecodeError;
use crate::proto::mesh_packet::PayloadVariant;
use crate::proto::{Data, MeshPacket, ServiceEnvelope};

/// A decoded service envelope with its mesh packet guaranteed present.
///
/// Exactly one of [`Envelope::decoded`] / [`Envelope::encrypted`] returns
/// `Some` at any time. Decryption replaces the encrypted variant in place.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub gateway_id: String,
    pub channel_id: String,
    pub packet: MeshPacket,
}

impl Envelope {
    /// Decode one transport message.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let raw = ServiceEnvelope::decode(bytes)?;
        Self::try_from(raw)
    }

    /// Sender node number.
    pub fn from_node(&self) -> u32 {
        self.packet.from
    }

    pub fn packet_id(&self) -> u32 {
        self.packet.id
    }

    pub fn rx_time(&self) -> u32 {
        self.packet.rx_time
    }

    pub fn decoded(&self) -> Option<&Data> {
        match &self.packet.payload_variant {
            Some(PayloadVariant::Decoded(data)) => Some(data),
            _ => None,
        }
    }

    pub fn encrypted(&self) -> Option<&[u8]> {
        match &self.packet.payload_variant {
            Some(PayloadVariant::Encrypted(bytes)) => Some(bytes.as_slice()),
            _ => None,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted().is_some()
    }

    pub(crate) fn set_decoded(&mut self, data: Data) {
        self.packet.payload_variant = Some(PayloadVariant::Decoded(data));
    }
}

impl TryFrom<ServiceEnvelope> for Envelope {
    type Error = DecodeError;

    fn try_from(raw: ServiceEnvelope) -> Result<Self, Self::Error> {
        let packet = raw.packet.ok_or(DecodeError::MissingField("packet"))?;
        if packet.payload_variant.is_none() {
            return Err(DecodeError::MissingField("packet.decoded|packet.encrypted"));
        }
        Ok(Self { gateway_id: raw.gateway_id, channel_id: raw.channel_id, packet })
    }
}
