//! Snapshot persistence: save and restore a whole DAG as one byte stream.
//!
//! The stream is exactly the synchronize stream written to disk: a genesis
//! frame followed by one frame per descendant in pre-order, each frame
//! being a length-prefixed wire message. Loading replays the stream with
//! the same relaxed rules and orphan tolerance as a network
//! synchronization.

use std::collections::{HashSet, VecDeque};
use std::io::{Read, Write};
use std::sync::Arc;

use crate::network::{decode_message, encode_message, Message};
use crate::tangle::{Tangle, TangleError, TransactionNode};
use crate::transaction::{Transaction, TxValidationError};

/// Errors from snapshot persistence.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot serialization error: {0}")]
    Serialization(String),
    #[error("snapshot stream corrupt: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Tangle(#[from] TangleError),
    #[error(transparent)]
    Validation(#[from] TxValidationError),
}

/// Write the DAG to `writer`: genesis first, descendants in pre-order.
pub fn save_tangle<W: Write>(tangle: &Tangle, writer: &mut W) -> Result<usize, SnapshotError> {
    let genesis = tangle.genesis();
    let mut stack = vec![Arc::clone(&genesis)];
    let mut visited = HashSet::from([genesis.hash()]);
    let mut written = 0usize;
    while let Some(node) = stack.pop() {
        let tx = node.transaction().clone();
        let message = if node.is_genesis() {
            Message::SyncGenesis {
                validity_hash: tx.hash,
                genesis: tx,
            }
        } else {
            Message::SyncAddTransaction {
                validity_hash: tx.hash,
                transaction: tx,
            }
        };
        let frame =
            encode_message(&message).map_err(|e| SnapshotError::Serialization(e.to_string()))?;
        writer.write_all(&frame)?;
        written += 1;
        for child in node.children() {
            if visited.insert(child.hash()) {
                stack.push(child);
            }
        }
    }
    writer.flush()?;
    Ok(written)
}

/// Restore a DAG from a stream written by [`save_tangle`], replacing the
/// tangle's genesis and replaying every descendant. Returns the number of
/// transactions installed (genesis included).
pub fn load_tangle<R: Read>(tangle: &Tangle, reader: &mut R) -> Result<usize, SnapshotError> {
    let mut queue: VecDeque<Transaction> = VecDeque::new();
    let mut installed = 0usize;
    let mut saw_genesis = false;

    while let Some(message) = read_frame(reader)? {
        match message {
            Message::SyncGenesis {
                validity_hash,
                genesis,
            } => {
                if genesis.hash != validity_hash {
                    return Err(TxValidationError::InvalidHash {
                        claimed: validity_hash,
                        actual: genesis.hash,
                    }
                    .into());
                }
                genesis.verify_hash()?;
                tangle.set_genesis(TransactionNode::genesis(genesis)?)?;
                saw_genesis = true;
                installed += 1;
            }
            Message::SyncAddTransaction {
                validity_hash,
                transaction,
            } => {
                if !saw_genesis {
                    return Err(SnapshotError::Corrupt(
                        "transaction frame before genesis frame".into(),
                    ));
                }
                if transaction.hash != validity_hash {
                    return Err(TxValidationError::InvalidHash {
                        claimed: validity_hash,
                        actual: transaction.hash,
                    }
                    .into());
                }
                if attempt_add(tangle, transaction, &mut queue)? {
                    installed += 1;
                    installed += drain_once(tangle, &mut queue)?;
                }
            }
            other => {
                return Err(SnapshotError::Corrupt(format!(
                    "unexpected message in snapshot stream: {:?}",
                    other
                )));
            }
        }
    }

    if !saw_genesis {
        return Err(SnapshotError::Corrupt("stream carries no genesis".into()));
    }
    if !queue.is_empty() {
        return Err(SnapshotError::Corrupt(format!(
            "{} transactions with unresolved parents",
            queue.len()
        )));
    }
    Ok(installed)
}

/// Insert if every parent resolves, otherwise buffer. Returns whether an
/// insert happened.
fn attempt_add(
    tangle: &Tangle,
    transaction: Transaction,
    queue: &mut VecDeque<Transaction>,
) -> Result<bool, SnapshotError> {
    match tangle.resolve_node(transaction.clone()) {
        Ok(node) => {
            tangle.add_for_sync(node)?;
            Ok(true)
        }
        Err(TangleError::NodeNotFound(_)) => {
            queue.push_back(transaction);
            Ok(false)
        }
        Err(err) => Err(err.into()),
    }
}

/// One pass over the buffered orphans; still-orphaned items keep their
/// order. Returns the number of inserts.
fn drain_once(tangle: &Tangle, queue: &mut VecDeque<Transaction>) -> Result<usize, SnapshotError> {
    let mut inserted = 0usize;
    for _ in 0..queue.len() {
        let Some(transaction) = queue.pop_front() else {
            break;
        };
        if attempt_add(tangle, transaction, queue)? {
            inserted += 1;
        }
    }
    Ok(inserted)
}

/// Read one frame, or `None` at a clean end of stream. A partial frame is
/// corruption.
fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Message>, SnapshotError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > crate::constants::MAX_WIRE_MESSAGE_BYTES {
        return Err(SnapshotError::Corrupt("frame length out of range".into()));
    }
    let mut frame = vec![0u8; 4 + len];
    frame[..4].copy_from_slice(&len_buf);
    reader
        .read_exact(&mut frame[4..])
        .map_err(|_| SnapshotError::Corrupt("truncated frame".into()))?;
    decode_message(&frame)
        .map(Some)
        .ok_or_else(|| SnapshotError::Corrupt("undecodable frame".into()))
}
