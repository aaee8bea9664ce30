//! # mtastic-core
//!
//! Decoding and state tracking for Meshtastic nodes reporting over MQTT.
//!
//! A gateway node publishes every packet it hears as a protobuf
//! `ServiceEnvelope`. This crate turns those envelopes into per-device
//! state records suitable for a home automation host:
//!
//! ```text
//! bytes -> Envelope -> (AES-CTR decrypt) -> Data -> Record -> DeviceState
//! ```
//!
//! Each [`Coordinator`] tracks one configured node. The MQTT client and the
//! persistence backend are hidden behind the [`Transport`] and
//! [`StateStore`] traits.
//!
//! ## Example
//!
//! ```rust
//! use mtastic_core::{interpret, Envelope, RecordType};
//! use mtastic_core::proto::{mesh_packet::PayloadVariant, Data, MeshPacket, PortNum, ServiceEnvelope};
//! use prost::Message;
//!
//! let wire = ServiceEnvelope {
//!     packet: Some(MeshPacket {
//!         from: 0x0a1b_2c3d,
//!         payload_variant: Some(PayloadVariant::Decoded(Data {
//!             portnum: PortNum::TextMessageApp as i32,
//!             payload: b"hello".to_vec(),
//!             ..Default::default()
//!         })),
//!         ..Default::default()
//!     }),
//!     channel_id: "LongFast".into(),
//!     gateway_id: "!0a1b2c3d".into(),
//! }
//! .encode_to_vec();
//!
//! let envelope = Envelope::decode(&wire).unwrap();
//! let record = interpret(&envelope).unwrap().unwrap();
//! assert_eq!(record.kind, RecordType::TextMessage);
//! assert_eq!(record.attributes["text"], "hello");
//! ```

pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod interpret;
pub mod node_id;
pub mod proto;
pub mod state;
pub mod store;
pub mod time;
pub mod transport;

pub use config::{BridgeConfig, DeviceConfig};
pub use coordinator::{Coordinator, Ignored, Listener, Outcome};
pub use crypto::{decrypt_envelope, encrypt_data, ChannelKey, DEFAULT_KEY};
pub use envelope::Envelope;
pub use error::{BridgeError, ConfigError, DecodeError, DecryptionError, StoreError, TransportError};
pub use interpret::{interpret, Attributes, Record, RecordType};
pub use node_id::NodeId;
pub use state::{DeviceState, Rejection};
pub use store::{JsonFileStore, MemoryStore, StateStore};
pub use transport::{LoopbackTransport, Subscription, Transport};
