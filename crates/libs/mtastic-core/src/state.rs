//! Per-device running state and the merge rules that fold records into it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;
use crate::interpret::{Attributes, Record, RecordType};
use crate::node_id::NodeId;

/// Accumulated state of one tracked node.
///
/// Serializes as a single flat object: one key per record type plus
/// `last_update` and `stat`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    /// Epoch seconds of the last accepted mesh message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<f64>,
    /// Last payload seen on the status topic, typically `online`/`offline`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stat: Option<String>,
    #[serde(flatten)]
    pub records: BTreeMap<String, Attributes>,
}

/// Why a decoded record was not merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The packet was sent by another node overheard on the channel.
    ForeignSender { from: u32 },
    /// A node-info broadcast describing a node other than the gateway.
    ForeignNodeInfo,
}

impl DeviceState {
    pub fn attributes(&self, kind: RecordType) -> Option<&Attributes> {
        self.records.get(kind.as_str())
    }

    /// `Some(true)` when the status topic last reported `online`.
    pub fn is_online(&self) -> Option<bool> {
        self.stat.as_deref().map(|stat| stat == "online")
    }

    /// Shallow merge: keys in `attributes` overwrite, other keys stay.
    pub fn merge(&mut self, kind: RecordType, attributes: Attributes) {
        let entry = self.records.entry(kind.as_str().to_string()).or_default();
        for (key, value) in attributes {
            entry.insert(key, value);
        }
    }

    /// Check a record against the origin rules for `device`.
    pub fn admit(device: NodeId, envelope: &Envelope, record: &Record) -> Result<(), Rejection> {
        if envelope.from_node() != device.num() {
            return Err(Rejection::ForeignSender { from: envelope.from_node() });
        }
        if record.kind == RecordType::NodeInfo {
            let id = record.attributes.get("id").and_then(|id| id.as_str());
            if id != Some(envelope.gateway_id.as_str()) {
                return Err(Rejection::ForeignNodeInfo);
            }
        }
        Ok(())
    }

    /// Build the state that results from accepting `record` at `now`.
    ///
    /// `self` is not touched; the caller commits the returned value.
    pub fn accept(
        &self,
        device: NodeId,
        envelope: &Envelope,
        record: Record,
        now: f64,
    ) -> Result<DeviceState, Rejection> {
        Self::admit(device, envelope, &record)?;
        let mut next = self.clone();
        next.merge(record.kind, record.attributes);
        next.last_update = Some(now);
        Ok(next)
    }

    /// Build the state after a status-topic message. No origin filtering.
    pub fn with_stat(&self, stat: impl Into<String>) -> DeviceState {
        DeviceState { stat: Some(stat.into()), ..self.clone() }
    }
}
