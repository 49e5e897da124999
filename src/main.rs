// This is the entry point for the peerwire node binary
// I pull in the server, its config and the key and peer stores from the library
use clap::Parser;
use log::{error, info, LevelFilter};
use peerwire::{Command, NetworkConfig, NetworkEvent, NetworkServer, NodeKey, Opt, PeerDatabase};
use std::process;
use std::sync::Arc;

fn main() {
    // I initialize logging at Info so peers joining and leaving show up
    // RUST_LOG still wins when I want more or less detail
    env_logger::builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    // I parse the command line with clap
    let opt = Opt::parse();

    // I run the chosen command; on failure I log the error and exit with code 1
    if let Err(e) = run_command(opt.command) {
        error!("Error: {e}");
        process::exit(1);
    }
}

// This is where I handle each CLI command
fn run_command(command: Command) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        // When I want to start a node and join the network
        Command::Run {
            config,
            port,
            bootnodes,
            peers,
        } => {
            // I read the TOML file if one was given, otherwise I start from the defaults
            // Either way NODE_ADDRESS and NODE_PORT are honoured
            let mut settings = match config {
                Some(path) => NetworkConfig::load(&path)?,
                None => {
                    let mut settings = NetworkConfig::default();
                    settings.apply_env_overrides()?;
                    settings
                }
            };
            // Flags on the command line override whatever the config says
            if let Some(port) = port {
                settings.listen_port = port;
            }
            if !bootnodes.is_empty() {
                settings.bootnodes = bootnodes;
            }
            settings.peers.extend(peers);
            settings.validate()?;

            // I load the node key from disk, generating one on first start
            let key = Arc::new(NodeKey::load_or_generate(&settings.key_path())?);
            let server = NetworkServer::start(&settings, key)?;
            info!("Node running on {}", server.local_addr());

            // I log every pool event; this loop runs until the process is killed
            for event in server.events().iter() {
                match event {
                    NetworkEvent::PeerConnected { peer, endpoint } => {
                        info!("Peer #{peer} joined from {endpoint} ({} connected)", server.peer_count())
                    }
                    NetworkEvent::PeerDisconnected { peer, endpoint } => {
                        info!("Peer #{peer} at {endpoint} left ({} connected)", server.peer_count())
                    }
                    NetworkEvent::MessageReceived {
                        peer,
                        endpoint,
                        message,
                    } => info!(
                        "Message type {} ({} bytes) from #{peer} {endpoint}",
                        message.msg_type,
                        message.len()
                    ),
                }
            }
        }
        // When I want a fresh node identity
        Command::Keygen { out, force } => {
            // I refuse to overwrite an existing key unless asked to
            if out.exists() && !force {
                return Err(format!("{} already exists, use --force to replace it", out.display()).into());
            }
            let key = NodeKey::generate()?;
            key.save(&out)?;
            println!("Node key written to {}", out.display());
            println!("Public key: {}", hex::encode(key.public_key()));
        }
        // When I want to see which peers the node remembers between runs
        Command::ShowPeers { data_dir } => {
            let path = data_dir.join("peers");
            if !path.exists() {
                println!("No peer database at {}", path.display());
                return Ok(());
            }
            // I open the sled tree read by the server at startup and list what it holds
            let db = PeerDatabase::open(&path)?;
            let peers = db.read_peers()?;
            if peers.is_empty() {
                println!("No stored peers");
            }
            for peer in peers {
                println!("{} (last seen {})", peer.endpoint, peer.last_seen);
            }
        }
    }
    Ok(())
}
