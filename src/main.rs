//! Filament node binary.
//!
//! Hosts a new tangle network, or joins an existing one when a target
//! address is given. Once running, the operator console reads single-letter
//! commands from stdin:
//!
//!   c                clear the screen
//!   t <acct> <amt> [difficulty]   create a transfer ("r" = random peer)
//!   d                dump the tangle
//!   r                biased random walk to a tip
//!   b                balances at 0% / 50% / 95% confidence
//!   s <path>         save the tangle snapshot
//!   l <path>         load a tangle snapshot
//!   k g | k s <path> | k l <path>   key management
//!   p                toggle the ping responder
//!   w                update cumulative weights
//!   q                quit

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use filament::config::FilamentConfig;
use filament::node::{self, Node, NodeConfig, NodeError, OperatorCommand};

/// Filament tangle node.
#[derive(Parser, Debug)]
#[command(name = "filament", version, about = "A tangle-structured distributed ledger node")]
struct Cli {
    /// Address of an existing network node to join; omit to host a new
    /// network.
    target: Option<SocketAddr>,

    /// Data directory for keys and configuration.
    #[arg(long, default_value = "./filament-data")]
    data_dir: PathBuf,

    /// P2P listen host (overrides the config file).
    #[arg(long)]
    host: Option<String>,

    /// P2P listen port; 0 picks a free port (overrides the config file).
    #[arg(long)]
    port: Option<u16>,

    /// Random-walk bias (overrides the config file).
    #[arg(long)]
    alpha: Option<f64>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = FilamentConfig::load(&cli.data_dir);

    let host = cli.host.unwrap_or_else(|| config.node.listen_host.clone());
    let port = cli.port.unwrap_or(config.node.listen_port);
    let listen_addr: SocketAddr = match format!("{host}:{port}").parse() {
        Ok(addr) => addr,
        Err(err) => {
            eprintln!("invalid listen address {host}:{port}: {err}");
            std::process::exit(1);
        }
    };

    let keypair = match node::load_or_generate_keypair(&cli.data_dir) {
        Ok(keypair) => keypair,
        Err(err) => {
            eprintln!("cannot set up account key: {err}");
            std::process::exit(1);
        }
    };

    // An explicit target takes precedence over configured bootstrap peers
    let bootstrap_peers: Vec<SocketAddr> = match cli.target {
        Some(target) => vec![target],
        None => config.parse_bootstrap_peers(),
    };

    let node = match Node::new(NodeConfig {
        listen_addr,
        bootstrap_peers,
        data_dir: cli.data_dir,
        keypair,
        walk_alpha: cli.alpha.unwrap_or(config.walk.alpha),
        default_difficulty: config.node.default_difficulty,
        max_peers: config.node.max_peers,
    })
    .await
    {
        Ok(node) => node,
        Err(err) => {
            eprintln!("cannot start node: {err}");
            std::process::exit(2);
        }
    };

    println!("Listening on {}", node.local_addr());
    println!("Account: {}", node.sync().key_pair().account_hex());

    let (operator_tx, operator_rx) = mpsc::channel(16);
    spawn_console(operator_tx);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Ctrl-C received, shutting down...");
        signal.cancel();
    });

    match node.run(operator_rx, shutdown).await {
        Ok(()) => {}
        Err(err @ (NodeError::ConnectTimeout | NodeError::P2p(_))) => {
            eprintln!("network failure: {err}");
            std::process::exit(2);
        }
        Err(err) => {
            eprintln!("node failed: {err}");
            std::process::exit(1);
        }
    }
}

/// Read operator commands from stdin on a dedicated thread.
fn spawn_console(commands: mpsc::Sender<OperatorCommand>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            match stdin.read_line(&mut line) {
                Ok(0) => break, // EOF
                Ok(_) => {}
                Err(_) => break,
            }
            match parse_command(line.trim()) {
                Some(command) => {
                    let quit = matches!(command, OperatorCommand::Quit);
                    if commands.blocking_send(command).is_err() || quit {
                        break;
                    }
                }
                None => {
                    if !line.trim().is_empty() {
                        eprintln!("commands: c t d r b s l k p w q");
                    }
                }
            }
        }
    });
}

/// Parse a console line into an operator command.
fn parse_command(line: &str) -> Option<OperatorCommand> {
    let mut parts = line.split_whitespace();
    match parts.next()? {
        "c" => Some(OperatorCommand::Clear),
        "t" => {
            let account = parts.next()?.to_string();
            let amount: f64 = parts.next()?.parse().ok()?;
            let difficulty = match parts.next() {
                Some(d) => Some(d.parse().ok()?),
                None => None,
            };
            Some(OperatorCommand::Transfer {
                account,
                amount,
                difficulty,
            })
        }
        "d" => Some(OperatorCommand::Dump),
        "r" => Some(OperatorCommand::RandomWalk),
        "b" => Some(OperatorCommand::Balance),
        "s" => Some(OperatorCommand::Save(PathBuf::from(parts.next()?))),
        "l" => Some(OperatorCommand::Load(PathBuf::from(parts.next()?))),
        "k" => match parts.next()? {
            "g" => Some(OperatorCommand::GenerateKeys),
            "s" => Some(OperatorCommand::SaveKeys(PathBuf::from(parts.next()?))),
            "l" => Some(OperatorCommand::LoadKeys(PathBuf::from(parts.next()?))),
            _ => None,
        },
        "p" => Some(OperatorCommand::TogglePing),
        "w" => Some(OperatorCommand::UpdateWeights),
        "q" => Some(OperatorCommand::Quit),
        _ => None,
    }
}
