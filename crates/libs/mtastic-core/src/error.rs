use std::io;

/// Errors from decoding a transport envelope or one of its sub-messages.
///
/// Always local to a single message: the caller drops the message and
/// keeps processing the subscription.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("protobuf decode error: {0}")]
    Protobuf(#[from] prost::DecodeError),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("text payload is not valid UTF-8")]
    InvalidText(#[from] std::string::FromUtf8Error),
}

/// Errors from recovering an encrypted packet.
#[derive(Debug, thiserror::Error)]
pub enum DecryptionError {
    #[error("invalid channel key encoding: {0}")]
    KeyEncoding(#[from] base64::DecodeError),

    #[error("unsupported channel key length: {0} bytes")]
    KeyLength(usize),

    /// Wrong key and corrupt ciphertext are indistinguishable here.
    #[error("could not recover a valid payload")]
    Unrecoverable,
}

/// Durable write or read of device state failed.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("state serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid node id {0:?} (expected '!' followed by 8 hex digits)")]
    InvalidId(String),

    #[error("device {0}: payload topic must not be empty")]
    EmptyTopic(String),

    #[error("device {id}: invalid channel key: {source}")]
    InvalidKey {
        id: String,
        #[source]
        source: DecryptionError,
    },

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config i/o error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
}

/// Errors that stop a coordinator.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
