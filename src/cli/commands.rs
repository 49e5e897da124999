use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "peerwire", about = "Peer-to-peer networking node")]
pub struct Opt {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(name = "run", about = "Start a node and stay connected to the network")]
    Run {
        #[arg(long, short, help = "TOML config file; defaults are used when omitted")]
        config: Option<PathBuf>,
        #[arg(long, short, help = "Port to listen on, overrides the config")]
        port: Option<u16>,
        #[arg(long = "bootnode", help = "Bootnode host:port, may be repeated")]
        bootnodes: Vec<String>,
        #[arg(long = "peer", help = "Peer host:port to dial at startup, may be repeated")]
        peers: Vec<String>,
    },
    #[command(name = "keygen", about = "Generate a new node key")]
    Keygen {
        #[arg(long, short, default_value = "data/node.key", help = "Where to write the key")]
        out: PathBuf,
        #[arg(long, help = "Replace an existing key file")]
        force: bool,
    },
    #[command(name = "show-peers", about = "List peers remembered from earlier runs")]
    ShowPeers {
        #[arg(long, default_value = "data", help = "Node data directory")]
        data_dir: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let opt = Opt::try_parse_from([
            "peerwire",
            "run",
            "--port",
            "7001",
            "--bootnode",
            "127.0.0.1:6789",
            "--bootnode",
            "127.0.0.1:6788",
        ])
        .unwrap();
        match opt.command {
            Command::Run {
                config,
                port,
                bootnodes,
                peers,
            } => {
                assert!(config.is_none());
                assert_eq!(port, Some(7001));
                assert_eq!(bootnodes.len(), 2);
                assert!(peers.is_empty());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_keygen_defaults() {
        let opt = Opt::try_parse_from(["peerwire", "keygen"]).unwrap();
        match opt.command {
            Command::Keygen { out, force } => {
                assert_eq!(out, PathBuf::from("data/node.key"));
                assert!(!force);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
