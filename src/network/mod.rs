//! Network protocol message definitions for tangle synchronization.
//!
//! One logical message per frame: a 4-byte little-endian length prefix
//! followed by the bincode payload. The transport ([`p2p`]) provides typed
//! delivery of decoded messages; the replication state machine lives in
//! [`sync`].

pub mod p2p;
pub mod sync;

use serde::{Deserialize, Serialize};

use crate::crypto::keys::PublicKey;
use crate::hash::TxHash;
use crate::transaction::Transaction;

/// An opaque peer identifier assigned by the transport for the lifetime of
/// a session.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 16]);

impl PeerId {
    /// Generate a fresh random identifier.
    pub fn random() -> Self {
        PeerId(rand::random())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", hex::encode(self.0))
    }
}

/// Network protocol messages.
///
/// The add-transaction variants carry a `validity_hash` alongside the
/// transaction: recipients drop the message if the two disagree, so a
/// corrupted relay cannot smuggle a transaction under a different name.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    // ── Transport Handshake ──
    /// First frame in both directions after connecting.
    Hello {
        version: u32,
        peer_id: PeerId,
        listen_port: u16,
    },

    // ── Account Keys ──
    /// Ask the recipient for its account public key.
    KeyRequest,

    /// Announce an account public key (reply to `KeyRequest`, and broadcast
    /// when an operator switches accounts).
    KeyResponse(PublicKey),

    // ── Tangle Sync ──
    /// Ask every recipient to stream its DAG back to the sender.
    SynchronizeRequest,

    /// First frame of a DAG stream: the sender's genesis. Only honored by
    /// peers that are listening for a genesis.
    SyncGenesis {
        validity_hash: TxHash,
        genesis: Transaction,
    },

    /// One descendant in a DAG stream. Identical layout to
    /// `AddTransaction`, but replayed with relaxed balance rules.
    SyncAddTransaction {
        validity_hash: TxHash,
        transaction: Transaction,
    },

    // ── Gossip ──
    /// A freshly authored transaction broadcast to all peers.
    AddTransaction {
        validity_hash: TxHash,
        transaction: Transaction,
    },

    /// Ask the recipient to recompute cumulative weights from every tip.
    UpdateWeights,
}

/// Network errors.
#[derive(Clone, Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("message serialization failed: {0}")]
    SerializationFailed(String),
    #[error(
        "message exceeds maximum size ({} bytes)",
        crate::constants::MAX_WIRE_MESSAGE_BYTES
    )]
    MessageTooLarge,
}

/// Size-limited bincode config used for both serialization and
/// deserialization. Prevents allocation-based DoS from crafted length
/// prefixes within payloads.
fn bincode_config() -> bincode::config::Configuration<
    bincode::config::LittleEndian,
    bincode::config::Fixint,
    bincode::config::Limit<{ crate::constants::MAX_WIRE_MESSAGE_BYTES }>,
> {
    bincode::config::legacy().with_limit::<{ crate::constants::MAX_WIRE_MESSAGE_BYTES }>()
}

/// Serialize a message to bytes (length-prefixed).
///
/// Returns an error if serialization fails or the encoded message exceeds
/// `MAX_WIRE_MESSAGE_BYTES`.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, NetworkError> {
    let payload = bincode::serde::encode_to_vec(msg, bincode_config())
        .map_err(|e| NetworkError::SerializationFailed(e.to_string()))?;
    if payload.len() > crate::constants::MAX_WIRE_MESSAGE_BYTES {
        return Err(NetworkError::MessageTooLarge);
    }
    let len = (payload.len() as u32).to_le_bytes();
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&len);
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Deserialize a message from bytes (including the length prefix).
///
/// Rejects messages whose declared length exceeds `MAX_WIRE_MESSAGE_BYTES`.
pub fn decode_message(data: &[u8]) -> Option<Message> {
    if data.len() < 4 {
        return None;
    }
    let len = u32::from_le_bytes(data[..4].try_into().ok()?) as usize;
    if len > crate::constants::MAX_WIRE_MESSAGE_BYTES {
        return None;
    }
    if data.len() < 4usize.saturating_add(len) {
        return None;
    }
    let (msg, _) = bincode::serde::decode_from_slice(&data[4..4 + len], bincode_config()).ok()?;
    Some(msg)
}
