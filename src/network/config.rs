//! Node configuration
//!
//! `NodeConfig` is plain serde data with defaults for every field, so a
//! JSON file only needs the options it changes. The binary layers its
//! command-line flags on top.

use crate::network::addrman::GET_ADDR_PERCENT;
use crate::network::connmgr::{
    ConnManagerConfig, DEFAULT_DIAL_TIMEOUT, DEFAULT_RETRY_DURATION, DEFAULT_TARGET_OUTBOUND,
    MAX_RETRY_DURATION,
};
use crate::network::message::{canonical_ip, ServiceFlags};
use crate::network::params::{Network, INITIAL_PROTOCOL_VERSION, MAX_PROTOCOL_VERSION};
use crate::network::peer::{
    default_user_agent, GraphStateFn, PeerConfig, IDLE_TIMEOUT, NEGOTIATE_TIMEOUT,
    TRICKLE_INTERVAL,
};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_MAX_PEERS: usize = 125;
pub const DEFAULT_MAX_INBOUND_PER_HOST: usize = 3;
pub const DEFAULT_BAN_THRESHOLD: u32 = 100;
pub const DEFAULT_BAN_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),

    #[error("Invalid address {0}")]
    InvalidAddress(String),

    #[error("Invalid whitelist entry {0}")]
    InvalidWhitelist(String),
}

/// Parse a whitelist entry: CIDR notation, or a bare IP as a full-length prefix
pub fn parse_whitelist_entry(entry: &str) -> Result<IpNet, ConfigError> {
    let entry = entry.trim();
    if let Ok(net) = entry.parse::<IpNet>() {
        return Ok(net);
    }
    entry
        .parse::<IpAddr>()
        .map(|ip| IpNet::from(canonical_ip(ip)))
        .map_err(|_| ConfigError::InvalidWhitelist(entry.to_string()))
}

// ============================================================================
// NodeConfig
// ============================================================================

/// Everything the network layer can be configured with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub network: Network,
    pub data_dir: PathBuf,
    /// `host:port` or `:port`; empty means all interfaces on the default port
    pub listen_addrs: Vec<String>,
    pub disable_listen: bool,
    /// Connect only to these peers
    pub connect_peers: Vec<String>,
    /// Extra permanent peers next to automatic ones
    pub add_peers: Vec<String>,
    /// Overrides the network's DNS seeds when not empty
    pub dns_seeds: Vec<String>,
    /// IPs or CIDR networks that are never banned
    pub whitelists: Vec<String>,
    /// Addresses to advertise as our own
    pub external_ips: Vec<String>,
    pub target_outbound: usize,
    pub max_peers: usize,
    pub max_inbound_per_host: usize,
    pub retry_duration_secs: u64,
    pub ban_threshold: u32,
    pub ban_duration_secs: u64,
    pub disable_banning: bool,
    pub get_addr_percent: usize,
    pub trickle_interval_ms: u64,
    pub protocol_version: u32,
    pub disable_relay_tx: bool,
    pub user_agent: String,
    pub negotiate_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub dial_timeout_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            data_dir: PathBuf::from(".dagnode"),
            listen_addrs: Vec::new(),
            disable_listen: false,
            connect_peers: Vec::new(),
            add_peers: Vec::new(),
            dns_seeds: Vec::new(),
            whitelists: Vec::new(),
            external_ips: Vec::new(),
            target_outbound: DEFAULT_TARGET_OUTBOUND,
            max_peers: DEFAULT_MAX_PEERS,
            max_inbound_per_host: DEFAULT_MAX_INBOUND_PER_HOST,
            retry_duration_secs: DEFAULT_RETRY_DURATION.as_secs(),
            ban_threshold: DEFAULT_BAN_THRESHOLD,
            ban_duration_secs: DEFAULT_BAN_DURATION.as_secs(),
            disable_banning: false,
            get_addr_percent: GET_ADDR_PERCENT,
            trickle_interval_ms: TRICKLE_INTERVAL.as_millis() as u64,
            protocol_version: MAX_PROTOCOL_VERSION,
            disable_relay_tx: false,
            user_agent: default_user_agent(),
            negotiate_timeout_secs: NEGOTIATE_TIMEOUT.as_secs(),
            idle_timeout_secs: IDLE_TIMEOUT.as_secs(),
            dial_timeout_secs: DEFAULT_DIAL_TIMEOUT.as_secs(),
        }
    }
}

impl NodeConfig {
    /// Read a JSON config; missing fields keep their defaults
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_peers == 0 {
            return Err(ConfigError::InvalidValue("max_peers", "must be positive".into()));
        }
        if self.target_outbound > self.max_peers {
            return Err(ConfigError::InvalidValue(
                "target_outbound",
                format!("{} exceeds max_peers {}", self.target_outbound, self.max_peers),
            ));
        }
        if self.max_inbound_per_host == 0 {
            return Err(ConfigError::InvalidValue(
                "max_inbound_per_host",
                "must be positive".into(),
            ));
        }
        if self.get_addr_percent > 100 {
            return Err(ConfigError::InvalidValue(
                "get_addr_percent",
                format!("{} is not a percentage", self.get_addr_percent),
            ));
        }
        if !(INITIAL_PROTOCOL_VERSION..=MAX_PROTOCOL_VERSION).contains(&self.protocol_version) {
            return Err(ConfigError::InvalidValue(
                "protocol_version",
                format!(
                    "{} outside {}..={}",
                    self.protocol_version, INITIAL_PROTOCOL_VERSION, MAX_PROTOCOL_VERSION
                ),
            ));
        }
        if self.ban_threshold == 0 {
            return Err(ConfigError::InvalidValue("ban_threshold", "must be positive".into()));
        }
        if self.retry_duration_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "retry_duration_secs",
                "must be positive".into(),
            ));
        }
        if self.trickle_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "trickle_interval_ms",
                "must be positive".into(),
            ));
        }
        self.whitelist()?;
        self.listen_socket_addrs()?;
        Ok(())
    }

    pub fn default_port(&self) -> u16 {
        self.network.default_port()
    }

    pub fn dns_seeds(&self) -> Vec<String> {
        if self.dns_seeds.is_empty() {
            self.network.dns_seeds()
        } else {
            self.dns_seeds.clone()
        }
    }

    pub fn ban_duration(&self) -> Duration {
        Duration::from_secs(self.ban_duration_secs)
    }

    pub fn whitelist(&self) -> Result<Vec<IpNet>, ConfigError> {
        self.whitelists
            .iter()
            .map(|s| parse_whitelist_entry(s))
            .collect()
    }

    /// Listen addresses with the default port filled in
    pub fn listen_socket_addrs(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        if self.disable_listen {
            return Ok(Vec::new());
        }
        if self.listen_addrs.is_empty() {
            return Ok(vec![SocketAddr::new(
                IpAddr::from([0, 0, 0, 0]),
                self.default_port(),
            )]);
        }
        self.listen_addrs
            .iter()
            .map(|addr| self.parse_addr(addr))
            .collect()
    }

    /// Resolve `host[:port]`, using the network's default port when absent
    pub fn parse_addr(&self, addr: &str) -> Result<SocketAddr, ConfigError> {
        let addr = addr.trim();
        if let Ok(socket) = addr.parse::<SocketAddr>() {
            return Ok(socket);
        }
        if let Ok(ip) = addr.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.default_port()));
        }
        if let Some(port) = addr.strip_prefix(':') {
            let port = port
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidAddress(addr.to_string()))?;
            return Ok(SocketAddr::new(IpAddr::from([0, 0, 0, 0]), port));
        }
        let with_port = if addr.contains(':') {
            addr.to_string()
        } else {
            format!("{}:{}", addr, self.default_port())
        };
        with_port
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| ConfigError::InvalidAddress(addr.to_string()))
    }

    pub fn services(&self) -> ServiceFlags {
        ServiceFlags::default_services()
    }

    pub fn peer_config(&self, graph_state: Option<GraphStateFn>) -> PeerConfig {
        PeerConfig {
            magic: self.network.magic(),
            protocol_version: self.protocol_version,
            services: self.services(),
            user_agent: self.user_agent.clone(),
            disable_relay_tx: self.disable_relay_tx,
            negotiate_timeout: Duration::from_secs(self.negotiate_timeout_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            trickle_interval: Duration::from_millis(self.trickle_interval_ms),
            graph_state,
            ..PeerConfig::default()
        }
    }

    /// Supervisor settings; the address source is filled in by the node
    pub fn conn_manager_config(&self) -> ConnManagerConfig {
        ConnManagerConfig {
            target_outbound: self.target_outbound,
            retry_duration: Duration::from_secs(self.retry_duration_secs),
            max_retry_duration: MAX_RETRY_DURATION,
            dial_timeout: Duration::from_secs(self.dial_timeout_secs),
            dial: None,
            get_new_address: None,
        }
    }
}
