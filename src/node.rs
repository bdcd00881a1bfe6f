//! Node orchestrator tying together the tangle, the replication layer, and
//! the P2P transport.
//!
//! A node either hosts a fresh network — creating a network key pair and a
//! genesis that grants it the whole supply — or joins an existing one by
//! dialing a peer and running the bootstrap sequence. The event loop
//! dispatches inbound messages to the replication layer and serves operator
//! commands; authoring (which mines) always runs on blocking worker tasks
//! so the loop never stalls.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::constants::{
    CONNECT_TIMEOUT_SECS, FAUCET_GRANT, GENESIS_SUPPLY, PING_DIFFICULTY,
};
use crate::crypto::keys::{KeyError, KeyPair, PublicKey};
use crate::hash::TxHash;
use crate::network::p2p::{self, P2pConfig, P2pError, P2pEvent, P2pHandle};
use crate::network::sync::{NetworkedTangle, SyncError};
use crate::network::{Message, PeerId};
use crate::snapshot::{self, SnapshotError};
use crate::tangle::{Tangle, TangleError};
use crate::transaction::builder::BuildError;
use crate::transaction::{Transaction, TransactionBuilder, TxOutput};

/// Node errors.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("key error: {0}")]
    Key(#[from] KeyError),
    #[error("P2P error: {0}")]
    P2p(#[from] P2pError),
    #[error(transparent)]
    Tangle(#[from] TangleError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error("authoring task failed: {0}")]
    Authoring(String),
    #[error("no peer connected before the bootstrap timeout expired")]
    ConnectTimeout,
}

/// Node configuration.
#[derive(Clone)]
pub struct NodeConfig {
    pub listen_addr: SocketAddr,
    /// Peers to dial on startup; empty means host a new network.
    pub bootstrap_peers: Vec<SocketAddr>,
    pub data_dir: PathBuf,
    pub keypair: KeyPair,
    pub walk_alpha: f64,
    pub default_difficulty: u8,
    pub max_peers: usize,
}

/// Commands from the operator console.
#[derive(Clone, Debug)]
pub enum OperatorCommand {
    Clear,
    Transfer {
        account: String,
        amount: f64,
        difficulty: Option<u8>,
    },
    Dump,
    RandomWalk,
    Balance,
    Save(PathBuf),
    Load(PathBuf),
    GenerateKeys,
    SaveKeys(PathBuf),
    LoadKeys(PathBuf),
    TogglePing,
    UpdateWeights,
    Quit,
}

/// Load the operator account key from `data_dir/account.key`, generating
/// and persisting a fresh one on first start.
pub fn load_or_generate_keypair(data_dir: &Path) -> Result<KeyPair, NodeError> {
    std::fs::create_dir_all(data_dir)?;
    let key_path = data_dir.join("account.key");
    if key_path.exists() {
        let bytes = std::fs::read(&key_path)?;
        let keypair = KeyPair::load(&bytes)?;
        tracing::info!(account = %keypair.account_hex(), "loaded account key");
        Ok(keypair)
    } else {
        let keypair = KeyPair::generate();
        std::fs::write(&key_path, keypair.save())?;
        tracing::info!(account = %keypair.account_hex(), "generated account key");
        Ok(keypair)
    }
}

/// One turn of the node's event loop.
enum Tick {
    Stop,
    Event(P2pEvent),
    Operator(OperatorCommand),
}

/// The node orchestrator.
pub struct Node {
    sync: Arc<NetworkedTangle>,
    p2p: P2pHandle,
    events: mpsc::Receiver<P2pEvent>,
    local_addr: SocketAddr,
    bootstrap_peers: Vec<SocketAddr>,
    data_dir: PathBuf,
    /// Present when hosting: the key pair holding the genesis supply, used
    /// to grant starter funds to newly announced accounts.
    network_keys: Option<Arc<KeyPair>>,
    walk_alpha: f64,
    default_difficulty: u8,
    pinging: bool,
    ping_tasks: Arc<AtomicUsize>,
}

impl Node {
    /// Bind the transport and set up the replica. Hosting nodes install a
    /// supply-bearing genesis immediately; joining nodes start from a
    /// placeholder genesis that the first synchronized stream replaces.
    pub async fn new(config: NodeConfig) -> Result<Node, NodeError> {
        let started = p2p::start(P2pConfig {
            listen_addr: config.listen_addr,
            max_peers: config.max_peers,
            our_peer_id: PeerId::random(),
        })
        .await?;

        let hosting = config.bootstrap_peers.is_empty();
        let (tangle, network_keys) = if hosting {
            let network_keys = KeyPair::generate();
            let genesis = Transaction::genesis(vec![TxOutput {
                account: network_keys.public().clone(),
                amount: GENESIS_SUPPLY,
            }]);
            (Tangle::new(genesis)?, Some(Arc::new(network_keys)))
        } else {
            (Tangle::new(Transaction::genesis(Vec::new()))?, None)
        };

        let sync = Arc::new(NetworkedTangle::new(
            Arc::new(tangle),
            started.handle.clone(),
            config.keypair,
        ));

        Ok(Node {
            sync,
            p2p: started.handle,
            events: started.events,
            local_addr: started.local_addr,
            bootstrap_peers: config.bootstrap_peers,
            data_dir: config.data_dir,
            network_keys,
            walk_alpha: config.walk_alpha,
            default_difficulty: config.default_difficulty,
            pinging: false,
            ping_tasks: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// The bound transport address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The replication layer, for inspection.
    pub fn sync(&self) -> &Arc<NetworkedTangle> {
        &self.sync
    }

    /// Run until the token cancels, the operator quits, or the transport
    /// dies. Returns [`NodeError::ConnectTimeout`] if no bootstrap peer
    /// answered in time.
    pub async fn run(
        mut self,
        mut operator: mpsc::Receiver<OperatorCommand>,
        shutdown: CancellationToken,
    ) -> Result<(), NodeError> {
        if self.network_keys.is_some() {
            tracing::info!(addr = %self.local_addr, "hosting a new network");
            // Seed the operator account from the genesis supply
            let recipient = self.sync.key_pair().public().clone();
            self.spawn_grant(recipient, "funding own account");
        } else {
            for addr in self.bootstrap_peers.clone() {
                tracing::info!(%addr, "dialing bootstrap peer");
                self.p2p.connect(addr).await?;
            }
            self.await_first_peer().await?;
            self.sync.begin_sync().await;
        }

        loop {
            let tick = tokio::select! {
                _ = shutdown.cancelled() => Tick::Stop,
                event = self.events.recv() => match event {
                    Some(event) => Tick::Event(event),
                    None => Tick::Stop,
                },
                command = operator.recv() => match command {
                    Some(OperatorCommand::Quit) | None => Tick::Stop,
                    Some(command) => Tick::Operator(command),
                },
            };
            match tick {
                Tick::Stop => break,
                Tick::Event(event) => self.handle_event(event).await,
                Tick::Operator(command) => self.handle_operator(command).await,
            }
        }

        let _ = self.p2p.shutdown().await;
        tracing::info!("node stopped");
        Ok(())
    }

    /// Wait for the first peer to complete its handshake.
    async fn await_first_peer(&mut self) -> Result<(), NodeError> {
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(CONNECT_TIMEOUT_SECS);
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .map_err(|_| NodeError::ConnectTimeout)?;
            let Some(event) = event else {
                return Err(NodeError::ConnectTimeout);
            };
            let connected = matches!(event, P2pEvent::PeerConnected(_));
            self.handle_event(event).await;
            if connected {
                return Ok(());
            }
        }
    }

    async fn handle_event(&mut self, event: P2pEvent) {
        match event {
            P2pEvent::PeerConnected(peer) => {
                tracing::info!(%peer, "peer connected");
            }
            P2pEvent::PeerDisconnected(peer) => {
                tracing::info!(%peer, "peer disconnected");
                self.sync.forget_peer(&peer);
            }
            P2pEvent::MessageReceived { from, message } => {
                // Peek before the message moves into the handler: the
                // hosting faucet reacts to key announcements, the ping
                // responder to incoming transfers.
                let grant = match (&self.network_keys, &*message) {
                    (Some(_), Message::KeyResponse(public)) => Some(public.clone()),
                    _ => None,
                };
                let ping = if self.pinging {
                    match &*message {
                        Message::AddTransaction { transaction, .. } => {
                            Some((transaction.hash, transaction.total_output()))
                        }
                        _ => None,
                    }
                } else {
                    None
                };

                if let Err(err) = self.sync.handle_message(from, *message).await {
                    tracing::warn!(peer = %from, %err, "discarding message");
                }

                if let Some(recipient) = grant {
                    self.spawn_grant(recipient, "granting starter funds");
                }
                if let Some((hash, amount)) = ping {
                    self.spawn_ping(hash, amount);
                }
            }
        }
    }

    /// Transfer starter funds from the network key to `recipient` once its
    /// balance is still zero. Hosting nodes only.
    fn spawn_grant(&self, recipient: PublicKey, reason: &'static str) {
        let Some(network_keys) = self.network_keys.clone() else {
            return;
        };
        let sync = Arc::clone(&self.sync);
        let alpha = self.walk_alpha;
        tokio::spawn(async move {
            // Give broadcasts from the announcement round a moment to land
            tokio::time::sleep(Duration::from_millis(500)).await;
            let Ok(balance) = sync.tangle().query_balance(&recipient) else {
                return;
            };
            if balance != 0.0 {
                return;
            }
            tracing::info!(account = %recipient.account_hex(), amount = FAUCET_GRANT, reason, "granting funds");
            if let Err(err) =
                author_transfer(&sync, &network_keys, recipient, FAUCET_GRANT, 1, alpha).await
            {
                tracing::warn!(%err, "grant failed");
            }
        });
    }

    /// Echo a received amount onward to a random peer account. At most one
    /// ping task runs at a time.
    fn spawn_ping(&self, hash: TxHash, amount: f64) {
        if self.ping_tasks.load(Ordering::SeqCst) >= 1 {
            return;
        }
        let sync = Arc::clone(&self.sync);
        let alpha = self.walk_alpha;
        let counter = Arc::clone(&self.ping_tasks);
        counter.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            // Only echo transactions the local replica accepted
            if sync.tangle().find(hash).is_some() {
                let peers = sync.peer_keys();
                if !peers.is_empty() {
                    let index = rand::thread_rng().gen_range(0..peers.len());
                    let (_, account) = peers[index].clone();
                    tracing::info!(amount, to = %account.account_hex(), "pinging value onward");
                    let from = sync.key_pair();
                    if let Err(err) =
                        author_transfer(&sync, &from, account, amount, PING_DIFFICULTY, alpha)
                            .await
                    {
                        tracing::warn!(%err, "ping transfer failed");
                    }
                }
            }
            counter.fetch_sub(1, Ordering::SeqCst);
        });
    }

    async fn handle_operator(&mut self, command: OperatorCommand) {
        match command {
            OperatorCommand::Clear => {
                print!("\x1b[2J\x1b[H");
            }

            OperatorCommand::Transfer {
                account,
                amount,
                difficulty,
            } => {
                let difficulty = difficulty.unwrap_or(self.default_difficulty);
                let account = if account == "r" {
                    self.random_account()
                } else {
                    account
                };
                let recipient = match self.sync.find_account(&account) {
                    Ok(recipient) => recipient,
                    Err(err) => {
                        tracing::warn!(%err, "discarding transaction");
                        return;
                    }
                };
                println!("Sending {amount} to {account}");
                let sync = Arc::clone(&self.sync);
                let from = self.sync.key_pair();
                let alpha = self.walk_alpha;
                tokio::spawn(async move {
                    match author_transfer(&sync, &from, recipient, amount, difficulty, alpha)
                        .await
                    {
                        Ok(hash) => println!("Transaction accepted: {hash}"),
                        Err(err) => tracing::warn!(%err, "discarding transaction"),
                    }
                });
            }

            OperatorCommand::Dump => {
                print!("{}", self.sync.tangle().debug_dump());
            }

            OperatorCommand::RandomWalk => {
                let tangle = Arc::clone(self.sync.tangle());
                println!("{} tips to find", tangle.tips().len());
                let tip = tangle.random_walk(self.walk_alpha);
                println!("found: {}", tip.hash());
                println!(
                    "descends from genesis: {}",
                    tangle.genesis().has_descendant(tip.hash())
                );
            }

            OperatorCommand::Balance => {
                let tangle = Arc::clone(self.sync.tangle());
                let keys = self.sync.key_pair();
                let result = tokio::task::spawn_blocking(move || {
                    let public = keys.public();
                    let levels = [0.0, 0.5, 0.95].map(|confidence| {
                        tangle
                            .query_balance_with_confidence(public, confidence)
                            .unwrap_or(f64::NAN)
                    });
                    (keys.account_hex(), levels)
                })
                .await;
                match result {
                    Ok((account, [b0, b50, b95])) => {
                        println!("Our ({account}) balance is: {b0} (0%) {b50} (50%) {b95} (95%)");
                    }
                    Err(err) => tracing::warn!(%err, "balance query failed"),
                }
            }

            OperatorCommand::Save(path) => {
                let tangle = Arc::clone(self.sync.tangle());
                let result = tokio::task::spawn_blocking(move || -> Result<usize, NodeError> {
                    let mut file = std::fs::File::create(&path)?;
                    Ok(snapshot::save_tangle(&tangle, &mut file)?)
                })
                .await;
                match result {
                    Ok(Ok(count)) => println!("Tangle saved ({count} transactions)"),
                    Ok(Err(err)) => tracing::warn!(%err, "save failed"),
                    Err(err) => tracing::warn!(%err, "save task failed"),
                }
            }

            OperatorCommand::Load(path) => {
                let tangle = Arc::clone(self.sync.tangle());
                let result = tokio::task::spawn_blocking(move || -> Result<usize, NodeError> {
                    let mut file = std::fs::File::open(&path)?;
                    Ok(snapshot::load_tangle(&tangle, &mut file)?)
                })
                .await;
                match result {
                    Ok(Ok(count)) => println!("Tangle loaded ({count} transactions)"),
                    Ok(Err(err)) => tracing::warn!(%err, "load failed"),
                    Err(err) => tracing::warn!(%err, "load task failed"),
                }
            }

            OperatorCommand::GenerateKeys => {
                let keypair = KeyPair::generate();
                println!("New account: {}", keypair.account_hex());
                if let Err(err) = std::fs::write(
                    self.data_dir.join("account.key"),
                    keypair.save(),
                ) {
                    tracing::warn!(%err, "could not persist account key");
                }
                self.sync.set_key_pair(keypair, true).await;
            }

            OperatorCommand::SaveKeys(path) => {
                match std::fs::write(&path, self.sync.key_pair().save()) {
                    Ok(()) => println!("Account key saved to {}", path.display()),
                    Err(err) => tracing::warn!(%err, "could not save account key"),
                }
            }

            OperatorCommand::LoadKeys(path) => {
                let loaded = std::fs::read(&path)
                    .map_err(NodeError::from)
                    .and_then(|bytes| Ok(KeyPair::load(&bytes)?));
                match loaded {
                    Ok(keypair) => {
                        println!("Loaded account: {}", keypair.account_hex());
                        self.sync.set_key_pair(keypair, true).await;
                    }
                    Err(err) => tracing::warn!(%err, "could not load account key"),
                }
            }

            OperatorCommand::TogglePing => {
                self.pinging = !self.pinging;
                println!(
                    "{} pinging transactions",
                    if self.pinging { "Started" } else { "Stopped" }
                );
            }

            OperatorCommand::UpdateWeights => {
                self.sync.tangle().update_weights_from_tips();
                let _ = self.p2p.broadcast(Message::UpdateWeights, None).await;
            }

            OperatorCommand::Quit => {} // handled by the run loop
        }
    }

    /// Pick a random announced peer account, falling back to our own.
    fn random_account(&self) -> String {
        let peers = self.sync.peer_keys();
        if peers.is_empty() {
            return self.sync.key_pair().account_hex();
        }
        let index = rand::thread_rng().gen_range(0..peers.len());
        peers[index].1.account_hex()
    }
}

/// Author a transfer: select parents by random walk, mine and sign on a
/// blocking worker, insert, and broadcast.
async fn author_transfer(
    sync: &Arc<NetworkedTangle>,
    from: &KeyPair,
    to: PublicKey,
    amount: f64,
    difficulty: u8,
    alpha: f64,
) -> Result<TxHash, NodeError> {
    let parents: Vec<TxHash> = sync
        .tangle()
        .select_parents(alpha)
        .iter()
        .map(|n| n.hash())
        .collect();
    let from = from.clone();
    let tx = tokio::task::spawn_blocking(move || {
        TransactionBuilder::new()
            .add_input(&from, amount)
            .add_output(to, amount)
            .parents(parents)
            .difficulty(difficulty)
            .build()
    })
    .await
    .map_err(|e| NodeError::Authoring(e.to_string()))??;
    let node = sync.tangle().resolve_node(tx)?;
    Ok(sync.add(node).await?)
}
