//! # Filament
//!
//! A peer-to-peer distributed ledger organized as a DAG of transactions — a
//! "tangle". Instead of batching transfers into blocks, every transaction
//! directly approves one or more earlier transactions (its parents), pays a
//! small proof-of-work cost, and is gossiped to peers. Confidence in a
//! transaction grows as later transactions accumulate on top of it, measured
//! by biased random walks over cumulative weights.
//!
//! The crate is organized as:
//! - [`hash`] — content addressing of transactions
//! - [`crypto`] — account key pairs and signatures
//! - [`transaction`] — the signed, mined value-transfer record
//! - [`tangle`] — the in-memory DAG: tips, weights, walks, balances
//! - [`network`] — sync messages, TCP transport, and the replicated tangle
//! - [`snapshot`] — pre-order save/load of a whole DAG
//! - [`node`] — the orchestrator tying the above together

pub mod config;
pub mod crypto;
pub mod hash;
pub mod network;
pub mod node;
pub mod snapshot;
pub mod tangle;
pub mod transaction;

/// Protocol constants
pub mod constants {
    /// Wire protocol version, exchanged in the Hello handshake.
    pub const PROTOCOL_VERSION: u32 = 1;
    /// Maximum network message size (16 MiB).
    pub const MAX_WIRE_MESSAGE_BYTES: usize = 16 * 1024 * 1024;
    /// Lowest accepted mining difficulty (leading zero hex nibbles).
    pub const MIN_DIFFICULTY: u8 = 1;
    /// Highest accepted mining difficulty.
    pub const MAX_DIFFICULTY: u8 = 5;
    /// Difficulty used for operator transfers when none is given.
    pub const DEFAULT_DIFFICULTY: u8 = 3;
    /// Difficulty used by the ping responder.
    pub const PING_DIFFICULTY: u8 = 3;
    /// Number of parents a freshly authored transaction approves.
    pub const PARENT_COUNT: usize = 2;
    /// Floor for random-walk step probabilities; keeps the distribution
    /// well-defined when exp() underflows.
    pub const WALK_EPSILON: f64 = 1e-12;
    /// Default bias for the random walk over cumulative weights.
    pub const DEFAULT_WALK_ALPHA: f64 = 0.5;
    /// Minimum number of walk starting points for a confidence query.
    pub const CONFIDENCE_WALK_SET: usize = 100;
    /// Extra ancestor levels behind the target when picking walk entries.
    pub const CONFIDENCE_DEPTH_MARGIN: u64 = 5;
    /// Output granted to the network key in a freshly hosted genesis.
    pub const GENESIS_SUPPLY: f64 = f64::MAX;
    /// Amount granted to each newly announced account by a hosting node.
    pub const FAUCET_GRANT: f64 = 1_000_000.0;
    /// Maximum number of connected peers.
    pub const MAX_PEERS: usize = 64;
    /// How long a joining node waits for its first peer before giving up.
    pub const CONNECT_TIMEOUT_SECS: u64 = 10;
}

pub use crate::crypto::keys::{KeyPair, PublicKey, Signature};
pub use crate::hash::TxHash;
pub use crate::network::sync::NetworkedTangle;
pub use crate::tangle::{Tangle, TangleError, TransactionNode};
pub use crate::transaction::{Transaction, TxInput, TxOutput};
