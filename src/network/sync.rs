//! Replica synchronization layered on top of the tangle.
//!
//! The networked tangle wires a local [`Tangle`] to the P2P transport:
//! locally authored transactions are broadcast after insertion, remote
//! transactions are validated and inserted (buffering orphans whose parents
//! have not arrived yet), and a joining node bootstraps by asking every
//! peer to stream its DAG — genesis first, descendants after.
//!
//! Broadcast is unreliable and fire-and-forget; convergence relies on
//! orphan buffering and future synchronization rounds.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::crypto::keys::{KeyPair, PublicKey};
use crate::hash::TxHash;
use crate::network::p2p::P2pHandle;
use crate::network::{Message, PeerId};
use crate::tangle::{Tangle, TangleError, TransactionNode};
use crate::transaction::{Transaction, TxValidationError};

/// Errors surfaced by the replication layer.
#[derive(Clone, Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Tangle(#[from] TangleError),
    #[error(transparent)]
    Validation(#[from] TxValidationError),
    #[error("account `{0}` does not resolve to any known public key")]
    InvalidAccount(String),
}

enum AddOutcome {
    Inserted,
    Queued,
}

/// A [`Tangle`] that keeps itself convergent with its peers.
pub struct NetworkedTangle {
    tangle: Arc<Tangle>,
    p2p: P2pHandle,
    keys: RwLock<Arc<KeyPair>>,
    peer_keys: RwLock<HashMap<PeerId, PublicKey>>,
    /// Set while waiting for a peer's DAG stream; gates genesis replacement.
    listening_for_genesis: AtomicBool,
    /// Orphaned remote transactions, in arrival order.
    queue: Mutex<VecDeque<Transaction>>,
}

impl NetworkedTangle {
    pub fn new(tangle: Arc<Tangle>, p2p: P2pHandle, keys: KeyPair) -> Self {
        NetworkedTangle {
            tangle,
            p2p,
            keys: RwLock::new(Arc::new(keys)),
            peer_keys: RwLock::new(HashMap::new()),
            listening_for_genesis: AtomicBool::new(false),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// The underlying DAG.
    pub fn tangle(&self) -> &Arc<Tangle> {
        &self.tangle
    }

    /// The operator's current account keys.
    pub fn key_pair(&self) -> Arc<KeyPair> {
        Arc::clone(&self.keys.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Swap the operator's account keys, optionally announcing the new
    /// public key to the network.
    pub async fn set_key_pair(&self, keys: KeyPair, network_sync: bool) {
        let public = keys.public().clone();
        *self.keys.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(keys);
        if network_sync {
            self.send_broadcast(Message::KeyResponse(public), None).await;
        }
    }

    /// The public key a peer announced, if any.
    pub fn peer_key(&self, peer: &PeerId) -> Option<PublicKey> {
        self.peer_keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .cloned()
    }

    /// Snapshot of all announced peer keys.
    pub fn peer_keys(&self) -> Vec<(PeerId, PublicKey)> {
        self.peer_keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, pk)| (*id, pk.clone()))
            .collect()
    }

    /// Drop the key table entry of a departed peer.
    pub fn forget_peer(&self, peer: &PeerId) {
        self.peer_keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer);
    }

    /// Resolve an operator-supplied account hash against the own key and
    /// every announced peer key.
    pub fn find_account(&self, account_hex: &str) -> Result<PublicKey, SyncError> {
        let own = self.key_pair();
        if own.account_hex() == account_hex {
            return Ok(own.public().clone());
        }
        let peers = self.peer_keys.read().unwrap_or_else(PoisonError::into_inner);
        peers
            .values()
            .find(|pk| pk.account_hex() == account_hex)
            .cloned()
            .ok_or_else(|| SyncError::InvalidAccount(account_hex.to_string()))
    }

    /// Insert a locally authored node and broadcast it to all peers.
    ///
    /// The insert is validated by the base tangle first; only transactions
    /// the local replica accepts are gossiped.
    pub async fn add(&self, node: Arc<TransactionNode>) -> Result<TxHash, SyncError> {
        let hash = self.tangle.add(Arc::clone(&node))?;
        let message = Message::AddTransaction {
            validity_hash: hash,
            transaction: node.transaction().clone(),
        };
        self.send_broadcast(message, None).await;
        Ok(hash)
    }

    /// Bootstrap against the current peer set: announce our key, collect
    /// theirs, and ask everyone to stream their DAG. The genesis listening
    /// flag is raised before the request goes out so the first stream wins.
    pub async fn begin_sync(&self) {
        let public = self.key_pair().public().clone();
        self.send_broadcast(Message::KeyResponse(public), None).await;
        self.send_broadcast(Message::KeyRequest, None).await;
        self.listening_for_genesis.store(true, Ordering::SeqCst);
        self.send_broadcast(Message::SynchronizeRequest, None).await;
    }

    /// Dispatch one inbound message.
    pub async fn handle_message(&self, from: PeerId, message: Message) -> Result<(), SyncError> {
        match message {
            Message::Hello { .. } => Ok(()), // transport artifact

            Message::KeyRequest => {
                let public = self.key_pair().public().clone();
                self.send_to(from, Message::KeyResponse(public)).await;
                Ok(())
            }

            Message::KeyResponse(public) => {
                tracing::info!(peer = %from, account = %public.account_hex(), "peer key announced");
                self.peer_keys
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(from, public);
                Ok(())
            }

            Message::SynchronizeRequest => {
                self.stream_tangle_to(from).await;
                Ok(())
            }

            Message::SyncGenesis {
                validity_hash,
                genesis,
            } => self.receive_genesis(validity_hash, genesis),

            Message::SyncAddTransaction {
                validity_hash,
                transaction,
            } => self.receive_transaction(validity_hash, transaction, true),

            Message::AddTransaction {
                validity_hash,
                transaction,
            } => self.receive_transaction(validity_hash, transaction, false),

            Message::UpdateWeights => {
                self.tangle.update_weights_from_tips();
                Ok(())
            }
        }
    }

    /// Stream our whole DAG to one peer: the genesis first, then every
    /// descendant in pre-order. Descendants reached through a side branch
    /// may arrive before all their parents; the recipient's orphan queue
    /// absorbs that.
    async fn stream_tangle_to(&self, peer: PeerId) {
        let genesis = self.tangle.genesis();
        let mut stack = vec![Arc::clone(&genesis)];
        let mut visited = HashSet::from([genesis.hash()]);
        let mut sent = 0usize;
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
            self.send_to(peer, message).await;
            sent += 1;
            for child in node.children() {
                if visited.insert(child.hash()) {
                    stack.push(child);
                }
            }
        }
        tracing::info!(peer = %peer, nodes = sent, "streamed tangle");
    }

    /// Handle a streamed genesis: only honored while the listening flag is
    /// raised, and ignored when it matches the current genesis.
    fn receive_genesis(
        &self,
        validity_hash: TxHash,
        genesis: Transaction,
    ) -> Result<(), SyncError> {
        if genesis.hash != validity_hash {
            return Err(TxValidationError::InvalidHash {
                claimed: validity_hash,
                actual: genesis.hash,
            }
            .into());
        }
        if self.tangle.genesis().hash() == genesis.hash {
            return Ok(());
        }
        if !self.listening_for_genesis.load(Ordering::SeqCst) {
            return Ok(());
        }
        genesis.verify_hash()?;
        let node = TransactionNode::genesis(genesis)?;
        let hash = node.hash();
        self.tangle.set_genesis(node)?;
        self.listening_for_genesis.store(false, Ordering::SeqCst);
        tracing::info!(genesis = %hash, "synchronized new genesis");
        Ok(())
    }

    /// Handle a remote transaction: check the claimed hash, insert or
    /// buffer, and give the orphan queue one drain pass after a successful
    /// insert.
    fn receive_transaction(
        &self,
        validity_hash: TxHash,
        transaction: Transaction,
        relaxed: bool,
    ) -> Result<(), SyncError> {
        if transaction.hash != validity_hash {
            return Err(TxValidationError::InvalidHash {
                claimed: validity_hash,
                actual: transaction.hash,
            }
            .into());
        }
        match self.attempt_add(transaction, relaxed)? {
            AddOutcome::Inserted => {
                self.drain_queue_once(relaxed);
                Ok(())
            }
            AddOutcome::Queued => Ok(()),
        }
    }

    /// Insert if every parent resolves, otherwise append to the orphan
    /// queue. Inserts go through the base tangle so remote transactions are
    /// never re-broadcast.
    fn attempt_add(
        &self,
        transaction: Transaction,
        relaxed: bool,
    ) -> Result<AddOutcome, SyncError> {
        let node = match self.tangle.resolve_node(transaction.clone()) {
            Ok(node) => node,
            Err(TangleError::NodeNotFound(missing)) => {
                let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
                if !queue.iter().any(|t| t.hash == transaction.hash) {
                    tracing::debug!(
                        tx = %transaction.hash,
                        parent = %missing,
                        "orphaned remote transaction, buffering"
                    );
                    queue.push_back(transaction);
                }
                return Ok(AddOutcome::Queued);
            }
            Err(err) => return Err(err.into()),
        };
        if relaxed {
            self.tangle.add_for_sync(node)?;
        } else {
            self.tangle.add(node)?;
        }
        Ok(AddOutcome::Inserted)
    }

    /// One pass over the orphan queue. Items whose parents are still
    /// missing re-enter the queue in their original order; items that fail
    /// validation are dropped and logged.
    fn drain_queue_once(&self, relaxed: bool) {
        let pending = {
            let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            queue.len()
        };
        for _ in 0..pending {
            let Some(transaction) = self
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
            else {
                break;
            };
            let hash = transaction.hash;
            if let Err(err) = self.attempt_add(transaction, relaxed) {
                tracing::warn!(tx = %hash, %err, "discarding queued transaction");
            }
        }
    }

    async fn send_to(&self, peer: PeerId, message: Message) {
        if let Err(err) = self.p2p.send_to(peer, message).await {
            tracing::debug!(%peer, %err, "send failed");
        }
    }

    async fn send_broadcast(&self, message: Message, exclude: Option<PeerId>) {
        if let Err(err) = self.p2p.broadcast(message, exclude).await {
            tracing::debug!(%err, "broadcast failed");
        }
    }
}

impl std::fmt::Debug for NetworkedTangle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkedTangle")
            .field("tangle", &self.tangle)
            .field(
                "queued",
                &self
                    .queue
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .len(),
            )
            .finish()
    }
}
