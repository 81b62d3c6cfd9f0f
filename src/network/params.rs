//! Per-network constants: magic bytes, default port, DNS seeds, genesis

use crate::network::message::Hash;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Oldest protocol version a peer may speak
pub const INITIAL_PROTOCOL_VERSION: u32 = 1;

/// Protocol version that introduced `sendheaders`
pub const SEND_HEADERS_VERSION: u32 = 2;

/// Protocol version that introduced `feefilter`
pub const FEE_FILTER_VERSION: u32 = 3;

/// Newest protocol version this node speaks
pub const MAX_PROTOCOL_VERSION: u32 = 3;

/// Which DAG network the node participates in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
    Privnet,
}

impl Network {
    /// Magic bytes framing every message on this network
    pub fn magic(&self) -> [u8; 4] {
        match self {
            Network::Mainnet => [0x44, 0x41, 0x47, 0x4D], // "DAGM"
            Network::Testnet => [0x44, 0x41, 0x47, 0x54], // "DAGT"
            Network::Privnet => [0x44, 0x41, 0x47, 0x50], // "DAGP"
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Network::Mainnet => 8130,
            Network::Testnet => 18130,
            Network::Privnet => 38130,
        }
    }

    pub fn dns_seeds(&self) -> Vec<String> {
        match self {
            Network::Mainnet => vec![
                "seed1.dagnode.network".to_string(),
                "seed2.dagnode.network".to_string(),
            ],
            Network::Testnet => vec!["testnet-seed.dagnode.network".to_string()],
            Network::Privnet => Vec::new(),
        }
    }

    /// Hash of the network's genesis block
    pub fn genesis_hash(&self) -> Hash {
        Hash::double_sha256(format!("dag-p2p genesis {}", self).as_bytes())
    }

    /// Private networks never gossip or seed addresses
    pub fn is_private(&self) -> bool {
        matches!(self, Network::Privnet)
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Privnet => "privnet",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            "privnet" => Ok(Network::Privnet),
            other => Err(format!("unknown network: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_networks_are_distinct() {
        let nets = [Network::Mainnet, Network::Testnet, Network::Privnet];
        for (i, a) in nets.iter().enumerate() {
            for b in nets.iter().skip(i + 1) {
                assert_ne!(a.magic(), b.magic());
                assert_ne!(a.default_port(), b.default_port());
                assert_ne!(a.genesis_hash(), b.genesis_hash());
            }
        }
    }

    #[test]
    fn test_parse_network() {
        assert_eq!("TestNet".parse::<Network>().unwrap(), Network::Testnet);
        assert!("moonnet".parse::<Network>().is_err());
        assert!(Network::Privnet.dns_seeds().is_empty());
    }
}
