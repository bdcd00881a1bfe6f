//! P2P networking layer using async TCP with tokio.
//!
//! Connections open with a plaintext `Hello` exchange carrying the protocol
//! version, a session peer id, and the advertised listen port. After the
//! handshake each connection runs a reader task and a writer task; the
//! application talks to the layer through a command channel and receives
//! decoded messages on an event channel.

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

use crate::constants::PROTOCOL_VERSION;
use crate::network::{self, Message, PeerId};

/// Errors from P2P operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum P2pError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("peer limit reached ({0})")]
    PeerLimitReached(usize),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("invalid handshake")]
    InvalidHandshake,
    #[error("shutdown")]
    Shutdown,
}

/// A command sent from the application to the P2P event loop.
pub enum P2pCommand {
    /// Connect to a peer at the given address.
    Connect(SocketAddr),
    /// Send a message to a specific peer.
    SendTo(PeerId, Message),
    /// Broadcast a message to all peers (optionally excluding one).
    Broadcast {
        message: Message,
        exclude: Option<PeerId>,
    },
    /// Request the current peer list.
    GetPeers(oneshot::Sender<Vec<PeerInfo>>),
    /// Shutdown the P2P system.
    Shutdown,
}

/// An event received from the P2P layer by the application.
#[derive(Debug)]
pub enum P2pEvent {
    /// A new peer completed the handshake (inbound or outbound).
    PeerConnected(PeerId),
    /// A peer disconnected.
    PeerDisconnected(PeerId),
    /// A message was received from a peer.
    MessageReceived { from: PeerId, message: Box<Message> },
}

/// Information about a connected peer.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub addr: SocketAddr,
    pub listen_port: u16,
}

/// Handle for the application to interact with the P2P layer.
#[derive(Clone)]
pub struct P2pHandle {
    command_tx: mpsc::Sender<P2pCommand>,
}

impl P2pHandle {
    /// A handle with no event loop behind it; every send fails fast. Useful
    /// for exercising the replication layer without sockets.
    pub fn detached() -> Self {
        let (command_tx, _) = mpsc::channel(1);
        P2pHandle { command_tx }
    }

    /// Ask the event loop to dial a peer.
    pub async fn connect(&self, addr: SocketAddr) -> Result<(), P2pError> {
        self.command_tx
            .send(P2pCommand::Connect(addr))
            .await
            .map_err(|_| P2pError::Shutdown)
    }

    /// Send a message to a specific peer.
    pub async fn send_to(&self, peer_id: PeerId, msg: Message) -> Result<(), P2pError> {
        self.command_tx
            .send(P2pCommand::SendTo(peer_id, msg))
            .await
            .map_err(|_| P2pError::Shutdown)
    }

    /// Broadcast a message to all peers, optionally excluding one.
    pub async fn broadcast(&self, msg: Message, exclude: Option<PeerId>) -> Result<(), P2pError> {
        self.command_tx
            .send(P2pCommand::Broadcast {
                message: msg,
                exclude,
            })
            .await
            .map_err(|_| P2pError::Shutdown)
    }

    /// Get the current peer list.
    pub async fn get_peers(&self) -> Result<Vec<PeerInfo>, P2pError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(P2pCommand::GetPeers(tx))
            .await
            .map_err(|_| P2pError::Shutdown)?;
        rx.await.map_err(|_| P2pError::Shutdown)
    }

    /// Shut down the P2P layer.
    pub async fn shutdown(&self) -> Result<(), P2pError> {
        self.command_tx
            .send(P2pCommand::Shutdown)
            .await
            .map_err(|_| P2pError::Shutdown)
    }
}

/// Configuration for the P2P layer.
#[derive(Clone)]
pub struct P2pConfig {
    pub listen_addr: SocketAddr,
    pub max_peers: usize,
    pub our_peer_id: PeerId,
}

/// State for a single peer connection.
struct PeerConnection {
    addr: SocketAddr,
    listen_port: u16,
    msg_tx: mpsc::Sender<Message>,
}

/// Internal event from connection tasks to the main P2P loop.
enum InternalEvent {
    /// A connection completed its handshake.
    Connected {
        peer_id: PeerId,
        addr: SocketAddr,
        listen_port: u16,
        msg_tx: mpsc::Sender<Message>,
    },
    /// A message arrived from a peer.
    Message { from: PeerId, message: Box<Message> },
    /// A peer connection ended.
    Disconnected(PeerId),
}

/// Result of starting the P2P layer.
pub struct P2pStartResult {
    pub handle: P2pHandle,
    pub events: mpsc::Receiver<P2pEvent>,
    /// The actual bound address (useful when listening on port 0).
    pub local_addr: SocketAddr,
}

/// Start the P2P networking layer.
pub async fn start(config: P2pConfig) -> Result<P2pStartResult, P2pError> {
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .map_err(|e| P2pError::ConnectionFailed(e.to_string()))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| P2pError::ConnectionFailed(e.to_string()))?;

    let (command_tx, command_rx) = mpsc::channel::<P2pCommand>(256);
    let (event_tx, event_rx) = mpsc::channel::<P2pEvent>(256);

    tokio::spawn(p2p_loop(config, listener, local_addr, command_rx, event_tx));

    Ok(P2pStartResult {
        handle: P2pHandle { command_tx },
        events: event_rx,
        local_addr,
    })
}

/// Main P2P event loop.
async fn p2p_loop(
    config: P2pConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    mut command_rx: mpsc::Receiver<P2pCommand>,
    event_tx: mpsc::Sender<P2pEvent>,
) {
    let mut peers: HashMap<PeerId, PeerConnection> = HashMap::new();
    let (internal_tx, mut internal_rx) = mpsc::channel::<InternalEvent>(256);

    let our_hello = Message::Hello {
        version: PROTOCOL_VERSION,
        peer_id: config.our_peer_id,
        listen_port: local_addr.port(),
    };

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        tracing::debug!(%addr, "inbound connection");
                        tokio::spawn(run_connection(
                            stream,
                            our_hello.clone(),
                            false,
                            internal_tx.clone(),
                        ));
                    }
                    Err(err) => tracing::warn!(%err, "accept failed"),
                }
            }

            command = command_rx.recv() => {
                let Some(command) = command else { break };
                match command {
                    P2pCommand::Connect(addr) => {
                        let hello = our_hello.clone();
                        let internal_tx = internal_tx.clone();
                        tokio::spawn(async move {
                            match TcpStream::connect(addr).await {
                                Ok(stream) => {
                                    run_connection(stream, hello, true, internal_tx).await;
                                }
                                Err(err) => {
                                    tracing::warn!(%addr, %err, "outbound connect failed");
                                }
                            }
                        });
                    }
                    P2pCommand::SendTo(peer_id, msg) => {
                        if let Some(peer) = peers.get(&peer_id) {
                            if peer.msg_tx.send(msg).await.is_err() {
                                tracing::debug!(peer = %peer_id, "send to closed connection");
                            }
                        }
                    }
                    P2pCommand::Broadcast { message, exclude } => {
                        // Broadcast is fire-and-forget: a peer with a full
                        // queue misses the message and catches up on the
                        // next synchronization.
                        for (peer_id, peer) in &peers {
                            if Some(*peer_id) == exclude {
                                continue;
                            }
                            if peer.msg_tx.try_send(message.clone()).is_err() {
                                tracing::debug!(peer = %peer_id, "broadcast dropped");
                            }
                        }
                    }
                    P2pCommand::GetPeers(reply) => {
                        let list = peers
                            .iter()
                            .map(|(peer_id, p)| PeerInfo {
                                peer_id: *peer_id,
                                addr: p.addr,
                                listen_port: p.listen_port,
                            })
                            .collect();
                        let _ = reply.send(list);
                    }
                    P2pCommand::Shutdown => break,
                }
            }

            internal = internal_rx.recv() => {
                let Some(internal) = internal else { break };
                match internal {
                    InternalEvent::Connected { peer_id, addr, listen_port, msg_tx } => {
                        if peer_id == config.our_peer_id || peers.contains_key(&peer_id) {
                            tracing::debug!(peer = %peer_id, "dropping duplicate connection");
                            continue;
                        }
                        if peers.len() >= config.max_peers {
                            tracing::warn!(peer = %peer_id, "peer limit reached, dropping");
                            continue;
                        }
                        tracing::info!(peer = %peer_id, %addr, "peer connected");
                        peers.insert(peer_id, PeerConnection { addr, listen_port, msg_tx });
                        let _ = event_tx.send(P2pEvent::PeerConnected(peer_id)).await;
                    }
                    InternalEvent::Message { from, message } => {
                        if peers.contains_key(&from) {
                            let _ = event_tx
                                .send(P2pEvent::MessageReceived { from, message })
                                .await;
                        }
                    }
                    InternalEvent::Disconnected(peer_id) => {
                        if peers.remove(&peer_id).is_some() {
                            tracing::info!(peer = %peer_id, "peer disconnected");
                            let _ = event_tx.send(P2pEvent::PeerDisconnected(peer_id)).await;
                        }
                    }
                }
            }
        }
    }
    tracing::debug!("p2p loop stopped");
}

/// Drive one connection: handshake, then pump frames both ways until either
/// side closes.
async fn run_connection(
    stream: TcpStream,
    our_hello: Message,
    is_outbound: bool,
    internal_tx: mpsc::Sender<InternalEvent>,
) {
    let addr = match stream.peer_addr() {
        Ok(addr) => addr,
        Err(err) => {
            tracing::debug!(%err, "connection lost before handshake");
            return;
        }
    };
    let (mut reader, mut writer) = stream.into_split();

    let handshake = async {
        if is_outbound {
            write_frame(&mut writer, &our_hello).await?;
        }
        let first = read_frame(&mut reader).await?;
        let Message::Hello {
            version,
            peer_id,
            listen_port,
        } = first
        else {
            return Err(P2pError::InvalidHandshake);
        };
        if version != PROTOCOL_VERSION {
            return Err(P2pError::InvalidHandshake);
        }
        if !is_outbound {
            write_frame(&mut writer, &our_hello).await?;
        }
        Ok((peer_id, listen_port))
    };

    let (peer_id, listen_port) = match handshake.await {
        Ok(ok) => ok,
        Err(err) => {
            tracing::debug!(%addr, %err, "handshake failed");
            return;
        }
    };

    let (msg_tx, mut msg_rx) = mpsc::channel::<Message>(64);
    if internal_tx
        .send(InternalEvent::Connected {
            peer_id,
            addr,
            listen_port,
            msg_tx,
        })
        .await
        .is_err()
    {
        return;
    }

    let writer_task = tokio::spawn(async move {
        while let Some(msg) = msg_rx.recv().await {
            if let Err(err) = write_frame(&mut writer, &msg).await {
                tracing::debug!(%err, "write failed, closing connection");
                break;
            }
        }
    });

    loop {
        match read_frame(&mut reader).await {
            Ok(msg) => {
                if internal_tx
                    .send(InternalEvent::Message {
                        from: peer_id,
                        message: Box::new(msg),
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(err) => {
                tracing::debug!(peer = %peer_id, %err, "read ended");
                break;
            }
        }
    }

    writer_task.abort();
    let _ = internal_tx.send(InternalEvent::Disconnected(peer_id)).await;
}

/// Write one length-prefixed message frame.
async fn write_frame(writer: &mut OwnedWriteHalf, msg: &Message) -> Result<(), P2pError> {
    let frame = network::encode_message(msg).map_err(|e| P2pError::SendFailed(e.to_string()))?;
    writer
        .write_all(&frame)
        .await
        .map_err(|e| P2pError::SendFailed(e.to_string()))
}

/// Read one length-prefixed message frame.
async fn read_frame(reader: &mut OwnedReadHalf) -> Result<Message, P2pError> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| P2pError::ConnectionFailed(e.to_string()))?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > crate::constants::MAX_WIRE_MESSAGE_BYTES {
        return Err(P2pError::ConnectionFailed("frame too large".into()));
    }
    let mut frame = vec![0u8; 4 + len];
    frame[..4].copy_from_slice(&len_buf);
    reader
        .read_exact(&mut frame[4..])
        .await
        .map_err(|e| P2pError::ConnectionFailed(e.to_string()))?;
    network::decode_message(&frame)
        .ok_or_else(|| P2pError::ConnectionFailed("frame decode failed".into()))
}
