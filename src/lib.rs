//! DAG-P2P: the peer-to-peer network layer of a block-DAG full node
//!
//! This crate provides:
//! - A bucketed address book with persistence to `peers.json`
//! - Outbound connection management with retries and DNS seeding
//! - Peer sessions with version negotiation, trickled inventory and stall detection
//! - Node-wide policy: ban scores, relay filtering, address gossip and DAG sync answers
//!
//! # Example
//!
//! ```no_run
//! use dag_p2p::network::{MemoryChain, Network, Node, NodeConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = NodeConfig {
//!     network: Network::Privnet,
//!     ..NodeConfig::default()
//! };
//! let chain = Arc::new(MemoryChain::new(config.network.genesis_hash()));
//! let node = Node::new(config, chain).await?;
//! node.start();
//! println!("Peers: {}", node.connection_count().await?);
//! node.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod network;
pub mod storage;

// Re-export commonly used types
pub use network::{ChainView, MemoryChain, Network, Node, NodeConfig, NodeError};
