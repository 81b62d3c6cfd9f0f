//! DAG node P2P daemon
//!
//! Runs the network layer on top of an in-memory chain.

use clap::{Parser, Subcommand};
use dag_p2p::network::addrman::{AddrManager, PEERS_FILENAME};
use dag_p2p::network::{MemoryChain, Network, Node, NodeConfig};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "dagnode")]
#[command(version = "0.1.0")]
#[command(about = "Peer-to-peer network node for a block DAG", long_about = None)]
struct Cli {
    /// JSON config file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory holding peers.json
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// mainnet, testnet or privnet
    #[arg(short, long)]
    network: Option<Network>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node until Ctrl-C
    Start {
        /// Listen address (repeatable)
        #[arg(short, long)]
        listen: Vec<String>,

        /// Connect only to these peers (repeatable)
        #[arg(long)]
        connect: Vec<String>,

        /// Extra permanent peers (repeatable)
        #[arg(long)]
        add_peer: Vec<String>,

        /// Do not accept inbound connections
        #[arg(long)]
        no_listen: bool,
    },

    /// Summarise the saved address book
    Peers {
        /// Number of addresses to list
        #[arg(short, long, default_value = "20")]
        count: usize,
    },

    /// Print the default configuration as JSON
    DefaultConfig,
}

fn load_config(cli: &Cli) -> Result<NodeConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => NodeConfig::load_from_file(path)?,
        None => NodeConfig::default(),
    };
    if let Some(network) = cli.network {
        config.network = network;
    }
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }
    Ok(config)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = load_config(&cli)?;

    match cli.command {
        Commands::Start {
            listen,
            connect,
            add_peer,
            no_listen,
        } => {
            if !listen.is_empty() {
                config.listen_addrs = listen;
            }
            config.connect_peers.extend(connect);
            config.add_peers.extend(add_peer);
            config.disable_listen |= no_listen;
            config.validate()?;
            run_node(config)?;
        }

        Commands::Peers { count } => {
            cmd_peers(&config, count);
        }

        Commands::DefaultConfig => {
            println!("{}", NodeConfig::default().to_json_pretty()?);
        }
    }

    Ok(())
}

fn run_node(config: NodeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let chain = Arc::new(MemoryChain::new(config.network.genesis_hash()));
        let node = Node::new(config, chain).await?;
        node.start();

        for addr in node.listen_addrs() {
            println!("🌐 Listening on {}", addr);
        }

        tokio::signal::ctrl_c().await?;
        println!("\n📴 Shutting down node...");
        println!(
            "   Traffic: {} bytes sent, {} bytes received",
            node.bytes_sent(),
            node.bytes_received()
        );
        node.stop().await;
        Ok::<_, Box<dyn std::error::Error>>(())
    })
}

fn cmd_peers(config: &NodeConfig, count: usize) {
    let addrman = AddrManager::new(&config.data_dir, config.get_addr_percent, None);
    addrman.load_peers();

    let path = config.data_dir.join(PEERS_FILENAME);
    println!("📒 Address book {}", path.display());
    println!(
        "   {} addresses ({} new, {} tried)",
        addrman.num_addresses(),
        addrman.new_count(),
        addrman.tried_count()
    );

    let mut known = addrman.known_addresses();
    known.sort_by(|a, b| b.na.timestamp.cmp(&a.na.timestamp));
    for ka in known.iter().take(count) {
        let status = if ka.tried { "tried" } else { "new" };
        println!(
            "   {:<48} {:<6} attempts={} last_seen={}",
            ka.na.to_string(),
            status,
            ka.attempts,
            ka.na.timestamp
        );
    }
}
