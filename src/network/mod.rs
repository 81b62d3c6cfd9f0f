//! P2P networking for a DAG full node
//!
//! Layers, bottom up:
//! - `message` and `server`: wire types and the framed codec
//! - `addrman`: the address book with its new/tried buckets
//! - `connmgr`: outbound dialling with retries plus the listeners
//! - `peer`: one session per connection (handshake, queues, stall detection)
//! - `serverpeer` and `node`: node-wide policy and the peer control loop

pub mod addrman;
pub mod banscore;
pub mod chain;
pub mod config;
pub mod connmgr;
pub mod discovery;
pub mod knownaddress;
pub mod message;
pub mod netgroup;
pub mod node;
pub mod params;
pub mod peer;
pub mod registry;
pub mod server;
pub mod serverpeer;

pub use addrman::{AddrError, AddrManager, AddressPriority};
pub use chain::{ChainView, MemoryChain};
pub use config::{ConfigError, NodeConfig};
pub use connmgr::{ConnError, ConnManager, ConnReq};
pub use message::{GraphState, Hash, InvType, InvVect, Message, NetAddress, ServiceFlags};
pub use node::{BannedPeer, Node, NodeError, PeerSelector, RelayInventory};
pub use params::Network;
pub use peer::{Peer, PeerConfig, PeerError, PeerInfo, PeerListener};
pub use server::{CodecError, MessageCodec};
