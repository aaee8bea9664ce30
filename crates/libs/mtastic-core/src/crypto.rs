//! Channel decryption for encrypted mesh packets.
//!
//! Meshtastic channels use AES-CTR. The 16-byte initial counter block is the
//! packet id followed by the sender node number, each widened to 64 bits
//! little-endian. The two halves are not interchangeable: swapping them
//! still "decrypts", only to garbage.

use aes::{Aes128, Aes192, Aes256};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ctr::cipher::{KeyIvInit, StreamCipher};
use prost::Message;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::envelope::Envelope;
use crate::error::DecryptionError;
use crate::proto::Data;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes192Ctr = ctr::Ctr128BE<Aes192>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

pub const NONCE_SIZE: usize = 16;

/// Publicly documented key of the default `LongFast` channel. Not a secret.
pub const DEFAULT_KEY: [u8; 16] = [
    0xd4, 0xf1, 0xbb, 0x3a, 0x20, 0x29, 0x07, 0x59, 0xf0, 0xbc, 0xff, 0xab, 0xcf, 0x4e, 0x69, 0x01,
];

/// Key descriptor shorthand that selects [`DEFAULT_KEY`].
pub const DEFAULT_KEY_DESCRIPTOR: &str = "AQ==";

/// A symmetric channel key.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ChannelKey(Vec<u8>);

impl ChannelKey {
    /// Parse a base64 key descriptor as shown by the Meshtastic apps.
    ///
    /// URL-safe characters are folded back to the standard alphabet. A
    /// single `0x01` byte stands for the default channel key.
    pub fn from_descriptor(descriptor: &str) -> Result<Self, DecryptionError> {
        let normalized = descriptor.trim().replace('_', "/").replace('-', "+");
        if normalized.is_empty() {
            return Ok(Self::default());
        }
        let bytes = STANDARD.decode(normalized.as_bytes())?;
        Self::from_bytes(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, DecryptionError> {
        if bytes.as_slice() == [0x01] {
            return Ok(Self::default());
        }
        match bytes.len() {
            16 | 24 | 32 => Ok(Self(bytes)),
            len => Err(DecryptionError::KeyLength(len)),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn apply_keystream(
        &self,
        nonce: &[u8; NONCE_SIZE],
        buf: &mut [u8],
    ) -> Result<(), DecryptionError> {
        let key = self.0.as_slice();
        let invalid = |_| DecryptionError::KeyLength(key.len());
        match key.len() {
            16 => Aes128Ctr::new_from_slices(key, nonce).map_err(invalid)?.apply_keystream(buf),
            24 => Aes192Ctr::new_from_slices(key, nonce).map_err(invalid)?.apply_keystream(buf),
            32 => Aes256Ctr::new_from_slices(key, nonce).map_err(invalid)?.apply_keystream(buf),
            len => return Err(DecryptionError::KeyLength(len)),
        }
        Ok(())
    }
}

impl Default for ChannelKey {
    fn default() -> Self {
        Self(DEFAULT_KEY.to_vec())
    }
}

impl core::fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChannelKey").field("len", &self.0.len()).finish_non_exhaustive()
    }
}

/// Build the initial counter block for a packet.
pub fn nonce(packet_id: u32, from_node: u32) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..8].copy_from_slice(&u64::from(packet_id).to_le_bytes());
    nonce[8..].copy_from_slice(&u64::from(from_node).to_le_bytes());
    nonce
}

/// Encrypt or decrypt `payload` under `key` and `nonce`. In counter mode the
/// two directions are the same operation.
pub fn transform(
    key: &ChannelKey,
    nonce: &[u8; NONCE_SIZE],
    payload: &[u8],
) -> Result<Vec<u8>, DecryptionError> {
    let mut buf = payload.to_vec();
    key.apply_keystream(nonce, &mut buf)?;
    Ok(buf)
}

/// Decrypt an envelope's packet in place.
///
/// An envelope that already carries a decoded payload is left untouched.
/// On any failure the envelope is not modified.
pub fn decrypt_envelope(envelope: &mut Envelope, key: &ChannelKey) -> Result<(), DecryptionError> {
    let Some(ciphertext) = envelope.encrypted() else {
        return Ok(());
    };
    let nonce = nonce(envelope.packet_id(), envelope.from_node());
    let plaintext = transform(key, &nonce, ciphertext)?;
    let data = Data::decode(plaintext.as_slice()).map_err(|_| DecryptionError::Unrecoverable)?;
    envelope.set_decoded(data);
    Ok(())
}

/// Encrypt a decoded payload for a given packet, producing the bytes that
/// belong in `MeshPacket.encrypted`.
pub fn encrypt_data(
    data: &Data,
    key: &ChannelKey,
    packet_id: u32,
    from_node: u32,
) -> Result<Vec<u8>, DecryptionError> {
    transform(key, &nonce(packet_id, from_node), &data.encode_to_vec())
}
