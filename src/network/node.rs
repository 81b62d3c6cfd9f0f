//! P2P Node implementation
//!
//! The node ties the address book, the connection manager and the peer
//! sessions together. One control loop owns the peer maps and the ban list;
//! sessions, the connection manager and the public API reach it through a
//! bounded command queue and get answers back on oneshot channels.

use crate::network::addrman::{system_lookup, AddrManager, AddressPriority};
use crate::network::chain::ChainView;
use crate::network::config::{ConfigError, NodeConfig};
use crate::network::connmgr::{AddressSource, ConnError, ConnHandler, ConnManager, ConnReq};
use crate::network::discovery::{seed_from_dns, OnSeed};
use crate::network::message::{
    canonical_ip, GraphState, Hash, HeaderBytes, InvType, InvVect, Message, MsgHeaders, NetAddress,
};
use crate::network::netgroup::{group_key, is_routable};
use crate::network::peer::{GraphStateFn, Peer, PeerConfig, PeerInfo};
use crate::network::registry::PeerRegistry;
use crate::network::serverpeer::ServerPeer;
use chrono::Utc;
use futures::FutureExt;
use ipnet::IpNet;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

// ============================================================================
// Constants
// ============================================================================

const COMMAND_QUEUE_SIZE: usize = 256;

/// Candidates drawn from the address book per outbound slot
const MAX_ADDRESS_TRIES: usize = 100;

/// Addresses attempted this recently are skipped early on
const RECENT_ATTEMPT_SECS: i64 = 10 * 60;
const RECENT_ATTEMPT_TRIES: usize = 30;

/// Tries before addresses on a non-default port are accepted
const NON_DEFAULT_PORT_TRIES: usize = 50;

/// Node errors
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("No valid listen address")]
    NoListeners,

    #[error("Node is stopped")]
    Stopped,

    #[error("Max peers reached")]
    MaxPeers,

    #[error("Peer already connected: {0}")]
    AlreadyConnected(SocketAddr),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),
}

// ============================================================================
// Public request types
// ============================================================================

/// Inventory to announce to every interested peer
#[derive(Debug, Clone)]
pub struct RelayInventory {
    pub inv: InvVect,
    /// Graph state sent with block announcements; the chain's when unset
    pub gs: Option<GraphState>,
    /// Serialized header for peers that prefer `headers` over `inv`
    pub header: Option<Vec<u8>>,
    /// Fee rate of a transaction, checked against each peer's fee filter
    pub fee: Option<i64>,
    pub immediate: bool,
}

impl RelayInventory {
    pub fn block(hash: Hash, header: Option<Vec<u8>>) -> Self {
        Self {
            inv: InvVect::block(hash),
            gs: None,
            header,
            fee: None,
            immediate: true,
        }
    }

    pub fn tx(hash: Hash, fee: Option<i64>) -> Self {
        Self {
            inv: InvVect::tx(hash),
            gs: None,
            header: None,
            fee,
            immediate: false,
        }
    }
}

/// A banned host and how long the ban still lasts
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BannedPeer {
    pub host: String,
    pub remaining: Duration,
}

/// How a control request names a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSelector {
    Id(u32),
    Addr(SocketAddr),
}

impl PeerSelector {
    fn matches(&self, peer: &Peer) -> bool {
        match self {
            PeerSelector::Id(id) => peer.id() == *id,
            PeerSelector::Addr(addr) => peer.addr() == *addr,
        }
    }

    fn describe(&self) -> String {
        match self {
            PeerSelector::Id(id) => format!("id {}", id),
            PeerSelector::Addr(addr) => addr.to_string(),
        }
    }
}

// ============================================================================
// Control loop messages
// ============================================================================

/// A session together with the node's per-peer state
#[derive(Clone)]
pub(crate) struct PeerEntry {
    pub(crate) peer: Peer,
    pub(crate) server_peer: Arc<ServerPeer>,
}

pub(crate) enum NodeQuery {
    ConnectionCount(oneshot::Sender<usize>),
    Peers(oneshot::Sender<Vec<PeerInfo>>),
    OutboundGroupCount(String, oneshot::Sender<usize>),
    BannedPeers(oneshot::Sender<Vec<BannedPeer>>),
    IsBanned(String, oneshot::Sender<bool>),
    ConnectNode {
        addr: SocketAddr,
        permanent: bool,
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
    DisconnectNode(PeerSelector, oneshot::Sender<Result<(), NodeError>>),
    RemoveNode(PeerSelector, oneshot::Sender<Result<(), NodeError>>),
}

pub(crate) enum NodeCommand {
    NewPeer {
        entry: PeerEntry,
        reply: oneshot::Sender<bool>,
    },
    DonePeer(PeerEntry),
    BanPeer(Peer),
    RelayInventory(RelayInventory),
    Broadcast {
        msg: Message,
        exclude: Vec<u32>,
    },
    Misbehaving {
        peer_id: u32,
        persistent: u32,
        transient: u32,
        reason: String,
    },
    Query(NodeQuery),
}

/// Ban list key for an address
fn host_key(ip: &IpAddr) -> String {
    canonical_ip(*ip).to_string()
}

// ============================================================================
// Shared state
// ============================================================================

/// State shared by the node, its sessions and the connection callbacks
pub(crate) struct NodeShared {
    pub(crate) config: NodeConfig,
    pub(crate) whitelist: Vec<IpNet>,
    pub(crate) addrman: Arc<AddrManager>,
    pub(crate) chain: Arc<dyn ChainView>,
    pub(crate) registry: Arc<PeerRegistry>,
    pub(crate) peer_config: PeerConfig,
    commands: mpsc::Sender<NodeCommand>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    shutdown: AtomicBool,
}

impl NodeShared {
    pub(crate) fn new(
        config: NodeConfig,
        chain: Arc<dyn ChainView>,
        addrman: Arc<AddrManager>,
        commands: mpsc::Sender<NodeCommand>,
    ) -> Result<Self, NodeError> {
        let whitelist = config.whitelist()?;
        let view = Arc::clone(&chain);
        let graph_state: GraphStateFn = Arc::new(move || view.graph_state());
        let peer_config = config.peer_config(Some(graph_state));

        Ok(Self {
            config,
            whitelist,
            addrman,
            chain,
            registry: Arc::new(PeerRegistry::new()),
            peer_config,
            commands,
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Queue a command from a context that cannot wait
    pub(crate) fn notify(&self, command: NodeCommand) {
        match self.commands.try_send(command) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(command)) => {
                let commands = self.commands.clone();
                tokio::spawn(async move {
                    let _ = commands.send(command).await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::trace!("Node is stopped, dropping command");
            }
        }
    }

    async fn send(&self, command: NodeCommand) -> Result<(), NodeError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| NodeError::Stopped)
    }

    async fn query<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> NodeQuery,
    ) -> Result<T, NodeError> {
        let (reply, answer) = oneshot::channel();
        self.send(NodeCommand::Query(make(reply))).await?;
        answer.await.map_err(|_| NodeError::Stopped)
    }

    pub(crate) fn add_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub(crate) fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    fn is_whitelisted(&self, ip: &IpAddr) -> bool {
        let ip = canonical_ip(*ip);
        self.whitelist.iter().any(|net| net.contains(&ip))
    }

    fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Whether the connection manager picks outbound addresses itself
    fn automatic_outbound(&self) -> bool {
        self.config.connect_peers.is_empty()
            && !self.config.network.is_private()
            && self.config.target_outbound > 0
    }

    /// Pick the next address for an automatic outbound connection
    async fn next_outbound_address(&self) -> Result<SocketAddr, ConnError> {
        let default_port = self.config.default_port();
        for tries in 0..MAX_ADDRESS_TRIES {
            let Some(candidate) = self.addrman.get_address() else {
                break;
            };
            let na = candidate.na;

            // One outbound connection per network group
            let key = group_key(&na.ip);
            let group_count = self
                .query(|reply| NodeQuery::OutboundGroupCount(key, reply))
                .await
                .map_err(|_| ConnError::Stopped)?;
            if group_count != 0 {
                continue;
            }

            let banned = self
                .query(|reply| NodeQuery::IsBanned(host_key(&na.ip), reply))
                .await
                .map_err(|_| ConnError::Stopped)?;
            if banned {
                continue;
            }

            let now = Utc::now().timestamp();
            if tries < RECENT_ATTEMPT_TRIES && now - candidate.last_attempt < RECENT_ATTEMPT_SECS {
                continue;
            }
            if na.port != default_port && tries < NON_DEFAULT_PORT_TRIES {
                continue;
            }

            self.addrman.attempt(&na);
            return Ok(na.socket_addr());
        }
        Err(ConnError::NoAddress("no valid connect address".to_string()))
    }

    fn new_session(self: &Arc<Self>, conn_req: Option<Arc<ConnReq>>, addr: SocketAddr) -> PeerEntry {
        let server_peer = Arc::new(ServerPeer::new(
            Arc::clone(self),
            conn_req.clone(),
            self.is_whitelisted(&addr.ip()),
        ));
        let config = self.peer_config.clone();
        let registry = Arc::clone(&self.registry);
        let peer = match conn_req {
            Some(_) => Peer::new_outbound(addr, config, registry, server_peer.clone()),
            None => Peer::new_inbound(addr, config, registry, server_peer.clone()),
        };
        PeerEntry { peer, server_peer }
    }

    /// Register the session once negotiated, then report it done
    async fn peer_lifecycle(&self, entry: PeerEntry) {
        let peer = entry.peer.clone();
        let mut added = false;

        if peer.wait_established().await {
            let (reply, accepted) = oneshot::channel();
            if self
                .send(NodeCommand::NewPeer {
                    entry: entry.clone(),
                    reply,
                })
                .await
                .is_ok()
            {
                added = accepted.await.unwrap_or(false);
            }
            if added {
                self.chain.peer_connected(peer.id(), &peer.last_gs());
            } else {
                peer.disconnect();
            }
        }

        peer.wait_for_disconnect().await;
        if self.send(NodeCommand::DonePeer(entry)).await.is_err() {
            log::trace!("Node stopped before {} was done", peer);
        }
        if added {
            self.chain.peer_disconnected(peer.id());
        }
    }
}

/// Turns sockets from the connection manager into peer sessions
struct SessionFactory {
    shared: Arc<NodeShared>,
}

impl ConnHandler for SessionFactory {
    fn on_accept(&self, stream: TcpStream, addr: SocketAddr) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            if shared.shutting_down() {
                return;
            }
            let host = host_key(&addr.ip());
            match shared
                .query(|reply| NodeQuery::IsBanned(host.clone(), reply))
                .await
            {
                Ok(false) => {}
                Ok(true) => {
                    log::debug!("Dropping connection from banned host {}", host);
                    return;
                }
                Err(_) => return,
            }

            let entry = shared.new_session(None, addr);
            entry.peer.associate_connection(stream);
            shared.peer_lifecycle(entry).await;
        });
    }

    fn on_connection(&self, req: Arc<ConnReq>, stream: TcpStream) {
        let Some(addr) = req.addr() else {
            log::warn!("Connection for {} has no address", req);
            return;
        };
        let shared = Arc::clone(&self.shared);
        let entry = shared.new_session(Some(req), addr);
        entry.peer.associate_connection(stream);
        tokio::spawn(async move { shared.peer_lifecycle(entry).await });
    }
}

fn address_source(shared: Arc<NodeShared>) -> AddressSource {
    Arc::new(move || {
        let shared = Arc::clone(&shared);
        async move { shared.next_outbound_address().await }.boxed()
    })
}

// ============================================================================
// Control loop
// ============================================================================

#[derive(Default)]
struct PeerState {
    inbound: HashMap<u32, PeerEntry>,
    outbound: HashMap<u32, PeerEntry>,
    persistent: HashMap<u32, PeerEntry>,
    /// Host to end of ban
    banned: HashMap<String, Instant>,
    outbound_groups: HashMap<String, usize>,
}

impl PeerState {
    fn count(&self) -> usize {
        self.inbound.len() + self.outbound.len() + self.persistent.len()
    }

    fn entries(&self) -> impl Iterator<Item = &PeerEntry> {
        self.inbound
            .values()
            .chain(self.outbound.values())
            .chain(self.persistent.values())
    }

    fn find(&self, id: u32) -> Option<&PeerEntry> {
        self.inbound
            .get(&id)
            .or_else(|| self.outbound.get(&id))
            .or_else(|| self.persistent.get(&id))
    }

    fn inbound_from(&self, host: &str) -> usize {
        self.inbound
            .values()
            .filter(|e| host_key(&e.peer.addr().ip()) == host)
            .count()
    }

    fn select(&self, selector: &PeerSelector) -> Vec<PeerEntry> {
        self.entries()
            .filter(|e| selector.matches(&e.peer))
            .cloned()
            .collect()
    }

    /// Whether `host` is banned; expired bans are lifted
    fn check_ban(&mut self, host: &str) -> Option<Duration> {
        let end = *self.banned.get(host)?;
        let now = Instant::now();
        if now < end {
            return Some(end - now);
        }
        log::info!("Peer {} is no longer banned", host);
        self.banned.remove(host);
        None
    }
}

struct PeerHandler {
    shared: Arc<NodeShared>,
    conn_manager: ConnManager,
    state: PeerState,
}

impl PeerHandler {
    async fn run(mut self, mut commands: mpsc::Receiver<NodeCommand>, mut quit: watch::Receiver<bool>) {
        log::trace!("Starting peer handler");
        loop {
            let command = tokio::select! {
                biased;
                _ = quit.changed() => break,
                command = commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            self.handle(command);
        }

        for entry in self.state.entries() {
            log::trace!("Shutdown peer {}", entry.peer);
            entry.peer.disconnect();
        }

        // Unanswered replies resolve as errors on the waiting side
        commands.close();
        while commands.try_recv().is_ok() {}
        log::trace!("Peer handler done");
    }

    fn handle(&mut self, command: NodeCommand) {
        match command {
            NodeCommand::NewPeer { entry, reply } => {
                let added = self.handle_add_peer(entry);
                let _ = reply.send(added);
            }
            NodeCommand::DonePeer(entry) => self.handle_done_peer(entry),
            NodeCommand::BanPeer(peer) => self.handle_ban_peer(&peer),
            NodeCommand::RelayInventory(relay) => self.handle_relay_inventory(relay),
            NodeCommand::Broadcast { msg, exclude } => self.handle_broadcast(msg, &exclude),
            NodeCommand::Misbehaving {
                peer_id,
                persistent,
                transient,
                reason,
            } => match self.state.find(peer_id) {
                Some(entry) => {
                    entry
                        .server_peer
                        .add_ban_score(&entry.peer, persistent, transient, &reason);
                }
                None => log::debug!("Misbehaving peer {} is not connected", peer_id),
            },
            NodeCommand::Query(query) => self.handle_query(query),
        }
    }

    fn handle_add_peer(&mut self, entry: PeerEntry) -> bool {
        let peer = &entry.peer;
        if self.shared.shutting_down() {
            log::info!("New peer {} ignored - node is shutting down", peer);
            peer.disconnect();
            return false;
        }

        let host = host_key(&peer.addr().ip());
        if let Some(remaining) = self.state.check_ban(&host) {
            log::debug!(
                "Peer {} is banned for another {:?} - disconnecting",
                host,
                remaining
            );
            peer.disconnect();
            return false;
        }

        let config = &self.shared.config;
        if self.state.count() >= config.max_peers {
            log::info!(
                "Max peers reached [{}] - disconnecting peer {}",
                config.max_peers,
                peer
            );
            peer.disconnect();
            return false;
        }

        if peer.inbound() && self.state.inbound_from(&host) >= config.max_inbound_per_host {
            log::info!(
                "Max inbound connections from {} reached [{}] - disconnecting peer {}",
                host,
                config.max_inbound_per_host,
                peer
            );
            peer.disconnect();
            return false;
        }

        log::debug!("New peer {}", peer);
        let id = peer.id();
        if peer.inbound() {
            self.state.inbound.insert(id, entry);
        } else {
            *self
                .state
                .outbound_groups
                .entry(group_key(&peer.addr().ip()))
                .or_insert(0) += 1;
            if entry.server_peer.persistent() {
                self.state.persistent.insert(id, entry);
            } else {
                self.state.outbound.insert(id, entry);
            }
        }
        true
    }

    fn handle_done_peer(&mut self, entry: PeerEntry) {
        let peer = &entry.peer;
        let server_peer = &entry.server_peer;
        let list = if server_peer.persistent() {
            &mut self.state.persistent
        } else if peer.inbound() {
            &mut self.state.inbound
        } else {
            &mut self.state.outbound
        };

        if list.remove(&peer.id()).is_some() {
            if !peer.inbound() {
                let key = group_key(&peer.addr().ip());
                if let Some(count) = self.state.outbound_groups.get_mut(&key) {
                    *count -= 1;
                    if *count == 0 {
                        self.state.outbound_groups.remove(&key);
                    }
                }
            }
            log::debug!("Removed peer {}", peer);
        }

        if let Some(req) = server_peer.conn_req() {
            if !server_peer.removed() {
                let conn_manager = self.conn_manager.clone();
                let id = req.id();
                tokio::spawn(async move { conn_manager.disconnect(id).await });
            }
        }

        if peer.verack_received() && peer.version_known() {
            if let Some(na) = peer.na() {
                self.shared.addrman.connected(&na);
            }
        }
    }

    fn handle_ban_peer(&mut self, peer: &Peer) {
        let host = host_key(&peer.addr().ip());
        let duration = self.shared.config.ban_duration();
        let direction = if peer.inbound() {
            "inbound"
        } else {
            "outbound"
        };
        log::info!("Banned peer {} ({}) for {:?}", host, direction, duration);
        self.state.banned.insert(host, Instant::now() + duration);
    }

    fn handle_relay_inventory(&mut self, relay: RelayInventory) {
        let gs = match &relay.gs {
            Some(gs) => gs.clone(),
            None => self.shared.chain.graph_state(),
        };

        for entry in self.state.entries() {
            let peer = &entry.peer;
            if !peer.connected() {
                continue;
            }

            match relay.inv.inv_type {
                InvType::Block | InvType::FilteredBlock => {
                    if peer.wants_headers() {
                        if let Some(header) = &relay.header {
                            peer.queue_message(Message::Headers(MsgHeaders {
                                headers: vec![HeaderBytes(header.clone())],
                            }));
                            continue;
                        }
                    }
                    peer.queue_inventory_immediate(relay.inv, Some(gs.clone()));
                }
                InvType::Tx => {
                    if peer.disable_relay_tx() {
                        continue;
                    }
                    let min_fee = entry.server_peer.fee_filter();
                    if let Some(fee) = relay.fee {
                        if min_fee > 0 && fee < min_fee {
                            continue;
                        }
                    }
                    if relay.immediate {
                        peer.queue_inventory_immediate(relay.inv, None);
                    } else {
                        peer.queue_inventory(relay.inv);
                    }
                }
            }
        }
    }

    fn handle_broadcast(&mut self, msg: Message, exclude: &[u32]) {
        for entry in self.state.entries() {
            if exclude.contains(&entry.peer.id()) || !entry.peer.connected() {
                continue;
            }
            entry.peer.queue_message(msg.clone());
        }
    }

    fn handle_query(&mut self, query: NodeQuery) {
        match query {
            NodeQuery::ConnectionCount(reply) => {
                let count = self
                    .state
                    .entries()
                    .filter(|e| e.peer.connected())
                    .count();
                let _ = reply.send(count);
            }
            NodeQuery::Peers(reply) => {
                let peers = self
                    .state
                    .entries()
                    .filter(|e| e.peer.connected())
                    .map(|e| e.peer.info())
                    .collect();
                let _ = reply.send(peers);
            }
            NodeQuery::OutboundGroupCount(key, reply) => {
                let count = self.state.outbound_groups.get(&key).copied().unwrap_or(0);
                let _ = reply.send(count);
            }
            NodeQuery::BannedPeers(reply) => {
                let now = Instant::now();
                self.state.banned.retain(|_, end| *end > now);
                let mut banned: Vec<BannedPeer> = self
                    .state
                    .banned
                    .iter()
                    .map(|(host, end)| BannedPeer {
                        host: host.clone(),
                        remaining: end.saturating_duration_since(now),
                    })
                    .collect();
                banned.sort_by(|a, b| a.host.cmp(&b.host));
                let _ = reply.send(banned);
            }
            NodeQuery::IsBanned(host, reply) => {
                let banned = self.state.check_ban(&host).is_some();
                let _ = reply.send(banned);
            }
            NodeQuery::ConnectNode {
                addr,
                permanent,
                reply,
            } => {
                let result = self.connect_node(addr, permanent);
                let _ = reply.send(result);
            }
            NodeQuery::DisconnectNode(selector, reply) => {
                let matches = self.state.select(&selector);
                if matches.is_empty() {
                    let _ = reply.send(Err(NodeError::PeerNotFound(selector.describe())));
                    return;
                }
                for entry in matches {
                    entry.peer.disconnect();
                }
                let _ = reply.send(Ok(()));
            }
            NodeQuery::RemoveNode(selector, reply) => {
                let matches: Vec<PeerEntry> = self
                    .state
                    .persistent
                    .values()
                    .filter(|e| selector.matches(&e.peer))
                    .cloned()
                    .collect();
                if matches.is_empty() {
                    let _ = reply.send(Err(NodeError::PeerNotFound(selector.describe())));
                    return;
                }
                for entry in matches {
                    entry.server_peer.mark_removed();
                    if let Some(req) = entry.server_peer.conn_req() {
                        let conn_manager = self.conn_manager.clone();
                        let id = req.id();
                        tokio::spawn(async move { conn_manager.remove(id).await });
                    }
                    entry.peer.disconnect();
                }
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn connect_node(&self, addr: SocketAddr, permanent: bool) -> Result<(), NodeError> {
        if self.state.count() >= self.shared.config.max_peers {
            return Err(NodeError::MaxPeers);
        }
        if self.state.entries().any(|e| e.peer.addr() == addr) {
            return Err(NodeError::AlreadyConnected(addr));
        }

        let conn_manager = self.conn_manager.clone();
        let req = Arc::new(ConnReq::new(addr, permanent));
        tokio::spawn(async move { conn_manager.connect(req).await });
        Ok(())
    }
}

// ============================================================================
// Node
// ============================================================================

/// The main P2P node
pub struct Node {
    shared: Arc<NodeShared>,
    conn_manager: ConnManager,
    commands: Mutex<Option<mpsc::Receiver<NodeCommand>>>,
    quit: watch::Sender<bool>,
    handler: Mutex<Option<JoinHandle<()>>>,
    seeders: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Create a node and bind its listeners
    pub async fn new(config: NodeConfig, chain: Arc<dyn ChainView>) -> Result<Self, NodeError> {
        config.validate()?;
        let addrman = Arc::new(AddrManager::new(
            &config.data_dir,
            config.get_addr_percent,
            None,
        ));
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let shared = Arc::new(NodeShared::new(config, chain, addrman, commands_tx)?);

        let mut listeners = Vec::new();
        for addr in shared.config.listen_socket_addrs()? {
            match TcpListener::bind(addr).await {
                Ok(listener) => listeners.push(listener),
                Err(e) => log::warn!("Can't listen on {}: {}", addr, e),
            }
        }
        if !shared.config.disable_listen && listeners.is_empty() {
            return Err(NodeError::NoListeners);
        }
        let mut cm_config = shared.config.conn_manager_config();
        if shared.automatic_outbound() {
            cm_config.get_new_address = Some(address_source(Arc::clone(&shared)));
        }
        let factory = Arc::new(SessionFactory {
            shared: Arc::clone(&shared),
        });
        let conn_manager = ConnManager::new(cm_config, listeners, factory);
        let (quit, _) = watch::channel(false);

        Ok(Self {
            shared,
            conn_manager,
            commands: Mutex::new(Some(commands_rx)),
            quit,
            handler: Mutex::new(None),
            seeders: Mutex::new(Vec::new()),
        })
    }

    /// Start the node: address book, control loop, seeding, connections
    pub fn start(&self) {
        let Some(commands) = self.commands.lock().take() else {
            log::warn!("P2P node already started");
            return;
        };
        let config = &self.shared.config;
        log::info!("Starting P2P node on {}", config.network);

        self.shared.addrman.start();
        self.add_local_addresses();

        let handler = PeerHandler {
            shared: Arc::clone(&self.shared),
            conn_manager: self.conn_manager.clone(),
            state: PeerState::default(),
        };
        *self.handler.lock() = Some(tokio::spawn(handler.run(commands, self.quit.subscribe())));

        if !config.network.is_private()
            && config.connect_peers.is_empty()
            && self.shared.addrman.need_more_addresses()
        {
            let addrman = Arc::clone(&self.shared.addrman);
            // Everything a seed returns is attributed to its first address
            let on_seed: OnSeed = Arc::new(move |addrs: Vec<NetAddress>| {
                if let Some(src) = addrs.first().cloned() {
                    addrman.add_addresses(&addrs, &src);
                }
            });
            let seeders = seed_from_dns(
                config.dns_seeds(),
                config.default_port(),
                system_lookup(),
                on_seed,
            );
            self.seeders.lock().extend(seeders);
        }

        self.conn_manager.start();
        self.connect_permanent_peers();
    }

    /// Stop accepting and dialling, disconnect every peer and save the
    /// address book
    pub async fn stop(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            log::warn!("P2P node already stopped");
            return;
        }
        log::warn!("P2P node shutting down");

        for seeder in self.seeders.lock().drain(..) {
            seeder.abort();
        }
        self.conn_manager.stop().await;

        self.quit.send_replace(true);
        let handler = self.handler.lock().take();
        if let Some(handler) = handler {
            if let Err(e) = handler.await {
                log::warn!("Peer handler failed: {}", e);
            }
        }

        self.shared.addrman.stop().await;
        log::info!("P2P node stopped");
    }

    fn add_local_addresses(&self) {
        let config = &self.shared.config;
        let services = config.services();
        let listen_addrs = self.conn_manager.listen_addrs();
        let port = listen_addrs
            .first()
            .map(|a| a.port())
            .unwrap_or_else(|| config.default_port());

        for listen in &listen_addrs {
            if is_routable(&listen.ip()) {
                let na = NetAddress::new(listen.ip(), listen.port(), services);
                if let Err(e) = self.shared.addrman.add_local_address(&na, AddressPriority::Bound) {
                    log::debug!("Skipping local address {}: {}", na, e);
                }
            }
        }

        for external in &config.external_ips {
            let na = match external.parse::<IpAddr>() {
                Ok(ip) => NetAddress::new(ip, port, services),
                Err(_) => match config.parse_addr(external) {
                    Ok(addr) => NetAddress::from_socket_addr(addr, services),
                    Err(e) => {
                        log::warn!("Skipping external IP {}: {}", external, e);
                        continue;
                    }
                },
            };
            match self.shared.addrman.add_local_address(&na, AddressPriority::Manual) {
                Ok(()) => log::info!("Advertising external address {}", na),
                Err(e) => log::warn!("Skipping external IP {}: {}", external, e),
            }
        }
    }

    fn connect_permanent_peers(&self) {
        let config = &self.shared.config;
        let permanent = if config.connect_peers.is_empty() {
            &config.add_peers
        } else {
            &config.connect_peers
        };

        for addr in permanent {
            match config.parse_addr(addr) {
                Ok(addr) => {
                    let conn_manager = self.conn_manager.clone();
                    let req = Arc::new(ConnReq::new(addr, true));
                    tokio::spawn(async move { conn_manager.connect(req).await });
                }
                Err(e) => log::warn!("Skipping permanent peer {}: {}", addr, e),
            }
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn config(&self) -> &NodeConfig {
        &self.shared.config
    }

    /// Addresses the listeners are bound to
    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.conn_manager.listen_addrs()
    }

    pub fn addr_manager(&self) -> Arc<AddrManager> {
        Arc::clone(&self.shared.addrman)
    }

    /// Bytes written to all peers since start
    pub fn bytes_sent(&self) -> u64 {
        self.shared.bytes_sent()
    }

    /// Bytes read from all peers since start
    pub fn bytes_received(&self) -> u64 {
        self.shared.bytes_received()
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub async fn connection_count(&self) -> Result<usize, NodeError> {
        self.shared.query(NodeQuery::ConnectionCount).await
    }

    pub async fn peers(&self) -> Result<Vec<PeerInfo>, NodeError> {
        self.shared.query(NodeQuery::Peers).await
    }

    /// Outbound connections in the network group `key`
    pub async fn outbound_group_count(&self, key: &str) -> Result<usize, NodeError> {
        let key = key.to_string();
        self.shared
            .query(|reply| NodeQuery::OutboundGroupCount(key, reply))
            .await
    }

    pub async fn banned_peers(&self) -> Result<Vec<BannedPeer>, NodeError> {
        self.shared.query(NodeQuery::BannedPeers).await
    }

    pub async fn is_banned(&self, ip: IpAddr) -> Result<bool, NodeError> {
        self.shared
            .query(|reply| NodeQuery::IsBanned(host_key(&ip), reply))
            .await
    }

    /// Dial `addr` (`host[:port]`); permanent requests are retried forever
    pub async fn connect_node(&self, addr: &str, permanent: bool) -> Result<(), NodeError> {
        let addr = self.shared.config.parse_addr(addr)?;
        self.shared
            .query(|reply| NodeQuery::ConnectNode {
                addr,
                permanent,
                reply,
            })
            .await?
    }

    /// Disconnect a peer; permanent peers are redialled
    pub async fn disconnect_node(&self, selector: PeerSelector) -> Result<(), NodeError> {
        self.shared
            .query(|reply| NodeQuery::DisconnectNode(selector, reply))
            .await?
    }

    /// Disconnect a permanent peer and forget its connection request
    pub async fn remove_node(&self, selector: PeerSelector) -> Result<(), NodeError> {
        self.shared
            .query(|reply| NodeQuery::RemoveNode(selector, reply))
            .await?
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    /// Announce inventory to every peer that may want it
    pub async fn relay_inventory(&self, relay: RelayInventory) -> Result<(), NodeError> {
        self.shared.send(NodeCommand::RelayInventory(relay)).await
    }

    /// Send `msg` to every connected peer not in `exclude`
    pub async fn broadcast(&self, msg: Message, exclude: Vec<u32>) -> Result<(), NodeError> {
        self.shared
            .send(NodeCommand::Broadcast { msg, exclude })
            .await
    }

    /// Report misbehaviour the chain engine detected
    pub async fn misbehaving(
        &self,
        peer_id: u32,
        persistent: u32,
        transient: u32,
        reason: &str,
    ) -> Result<(), NodeError> {
        self.shared
            .send(NodeCommand::Misbehaving {
                peer_id,
                persistent,
                transient,
                reason: reason.to_string(),
            })
            .await
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::chain::MemoryChain;
    use crate::network::message::{cmd, MsgFeeFilter, MsgGraphState, MsgInv};
    use crate::network::params::Network;
    use crate::network::peer::{
        AddressListener, HandshakeListener, InventoryListener, PeerListener, SyncListener,
        TrafficListener,
    };
    use std::future::Future;
    use tempfile::TempDir;
    use tokio::time::{sleep, timeout};

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct Recorder {
        commands: Mutex<Vec<String>>,
        invs: Mutex<Vec<MsgInv>>,
    }

    impl Recorder {
        fn count(&self, command: &str) -> usize {
            self.commands.lock().iter().filter(|c| *c == command).count()
        }
    }

    impl HandshakeListener for Recorder {}
    impl AddressListener for Recorder {}
    impl SyncListener for Recorder {}

    impl InventoryListener for Recorder {
        fn on_inv(&self, _peer: &Peer, msg: &MsgInv) {
            self.invs.lock().push(msg.clone());
        }
    }

    impl TrafficListener for Recorder {
        fn on_read(&self, _peer: &Peer, _bytes: usize, command: &str) {
            self.commands.lock().push(command.to_string());
        }
    }

    fn test_config(dir: &TempDir) -> NodeConfig {
        NodeConfig {
            network: Network::Privnet,
            data_dir: dir.path().to_path_buf(),
            listen_addrs: vec!["127.0.0.1:0".to_string()],
            target_outbound: 0,
            retry_duration_secs: 1,
            ..NodeConfig::default()
        }
    }

    async fn test_node(config: NodeConfig) -> (Node, Arc<MemoryChain>) {
        let chain = Arc::new(MemoryChain::new(config.network.genesis_hash()));
        let node = Node::new(config, chain.clone()).await.unwrap();
        node.start();
        (node, chain)
    }

    /// Dial the node from a bare session with its own registry
    async fn dial(node: &Node) -> (Peer, Arc<Recorder>) {
        let addr = node.listen_addrs()[0];
        let stream = TcpStream::connect(addr).await.unwrap();
        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn PeerListener> = recorder.clone();
        let config = PeerConfig {
            magic: Network::Privnet.magic(),
            ..PeerConfig::default()
        };
        let peer = Peer::new_outbound(addr, config, Arc::new(PeerRegistry::new()), listener);
        peer.associate_connection(stream);
        (peer, recorder)
    }

    async fn eventually<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if check().await {
                return true;
            }
            sleep(Duration::from_millis(20)).await;
        }
        check().await
    }

    async fn wait_for_count(node: &Node, count: usize) -> bool {
        eventually(|| async { node.connection_count().await.unwrap_or(usize::MAX) == count }).await
    }

    fn h(n: u8) -> Hash {
        Hash([n; 32])
    }

    #[tokio::test]
    async fn test_ban_threshold_disconnects_and_bans_host() {
        let dir = tempfile::tempdir().unwrap();
        let (node, _chain) = test_node(test_config(&dir)).await;
        let (remote, _recorder) = dial(&node).await;
        assert!(timeout(WAIT, remote.wait_established()).await.unwrap());
        assert!(wait_for_count(&node, 1).await);

        let id = node.peers().await.unwrap()[0].id;
        node.misbehaving(id, 60, 0, "first offence").await.unwrap();
        assert!(wait_for_count(&node, 1).await);
        assert!(node.banned_peers().await.unwrap().is_empty());

        node.misbehaving(id, 60, 0, "second offence").await.unwrap();
        timeout(WAIT, remote.wait_for_disconnect()).await.unwrap();
        assert!(wait_for_count(&node, 0).await);

        assert!(
            eventually(|| async { !node.banned_peers().await.unwrap().is_empty() }).await
        );
        let banned = node.banned_peers().await.unwrap();
        assert_eq!(banned[0].host, "127.0.0.1");
        assert!(banned[0].remaining > Duration::ZERO);
        assert!(node.is_banned("127.0.0.1".parse().unwrap()).await.unwrap());

        // A banned host is dropped before any session starts
        let (again, recorder) = dial(&node).await;
        assert!(!timeout(WAIT, again.wait_established()).await.unwrap());
        assert_eq!(recorder.count(cmd::VERSION), 0);

        node.stop().await;
    }

    #[tokio::test]
    async fn test_whitelisted_peer_is_never_banned() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            whitelists: vec!["127.0.0.0/8".to_string()],
            ..test_config(&dir)
        };
        let (node, _chain) = test_node(config).await;
        let (remote, _recorder) = dial(&node).await;
        assert!(wait_for_count(&node, 1).await);

        let id = node.peers().await.unwrap()[0].id;
        node.misbehaving(id, 1000, 0, "ignored").await.unwrap();
        sleep(Duration::from_millis(100)).await;

        assert_eq!(node.connection_count().await.unwrap(), 1);
        assert!(node.banned_peers().await.unwrap().is_empty());
        remote.disconnect();
        node.stop().await;
    }

    #[tokio::test]
    async fn test_peer_that_stops_reading_is_released() {
        use crate::network::message::{MsgVersion, ServiceFlags};
        use crate::network::params::MAX_PROTOCOL_VERSION;
        use crate::network::server::{Frame, MessageCodec};
        use futures::SinkExt;
        use tokio_util::codec::FramedWrite;

        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            max_peers: 1,
            ..test_config(&dir)
        };
        let (node, _chain) = test_node(config).await;

        let stream = TcpStream::connect(node.listen_addrs()[0]).await.unwrap();
        let (_read, write) = stream.into_split();
        let mut writer = FramedWrite::new(write, MessageCodec::new(Network::Privnet.magic()));
        let version = MsgVersion {
            protocol_version: MAX_PROTOCOL_VERSION,
            services: ServiceFlags::default_services(),
            timestamp: Utc::now().timestamp(),
            addr_you: NetAddress::unspecified(),
            addr_me: NetAddress::unspecified(),
            nonce: 7,
            user_agent: "/stuck/".to_string(),
            last_gs: GraphState::default(),
            disable_relay_tx: false,
        };
        for msg in [Message::Version(version), Message::VerAck] {
            writer.send(Frame::from_message(&msg).unwrap()).await.unwrap();
        }
        assert!(wait_for_count(&node, 1).await);
        let id = node.peers().await.unwrap()[0].id;

        let inv_list: Vec<InvVect> = (0..10_000u32)
            .map(|i| {
                let mut hash = [0u8; 32];
                hash[..4].copy_from_slice(&i.to_le_bytes());
                InvVect::tx(Hash(hash))
            })
            .collect();
        for _ in 0..100 {
            let msg = Message::Inv(MsgInv::new(inv_list.clone()));
            node.broadcast(msg, Vec::new()).await.unwrap();
        }
        sleep(Duration::from_millis(300)).await;
        let _ = node.disconnect_node(PeerSelector::Id(id)).await;

        assert!(wait_for_count(&node, 0).await);

        // The only slot frees up once the stuck session has finished
        let (next, _recorder) = dial(&node).await;
        assert!(timeout(WAIT, next.wait_established()).await.unwrap());
        assert!(wait_for_count(&node, 1).await);
        next.disconnect();
        node.stop().await;
    }

    #[tokio::test]
    async fn test_max_peers_rejects_extra_connections() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            max_peers: 1,
            ..test_config(&dir)
        };
        let (node, _chain) = test_node(config).await;

        let (_first, _r1) = dial(&node).await;
        assert!(wait_for_count(&node, 1).await);

        let (second, _r2) = dial(&node).await;
        timeout(WAIT, second.wait_for_disconnect()).await.unwrap();
        assert_eq!(node.connection_count().await.unwrap(), 1);
        node.stop().await;
    }

    #[tokio::test]
    async fn test_inbound_limit_per_host() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            max_inbound_per_host: 1,
            ..test_config(&dir)
        };
        let (node, _chain) = test_node(config).await;

        let (_first, _r1) = dial(&node).await;
        assert!(wait_for_count(&node, 1).await);
        let (second, _r2) = dial(&node).await;
        timeout(WAIT, second.wait_for_disconnect()).await.unwrap();
        assert_eq!(node.connection_count().await.unwrap(), 1);
        node.stop().await;
    }

    #[tokio::test]
    async fn test_broadcast_skips_excluded_peers() {
        let dir = tempfile::tempdir().unwrap();
        let (node, chain) = test_node(test_config(&dir)).await;

        let (_a, rec_a) = dial(&node).await;
        assert!(wait_for_count(&node, 1).await);
        let id_a = node.peers().await.unwrap()[0].id;
        let (_b, rec_b) = dial(&node).await;
        assert!(wait_for_count(&node, 2).await);

        let msg = Message::GraphState(MsgGraphState {
            gs: chain.graph_state(),
        });
        node.broadcast(msg, vec![id_a]).await.unwrap();

        let b = Arc::clone(&rec_b);
        assert!(eventually(|| {
            let b = Arc::clone(&b);
            async move { b.count(cmd::GRAPHSTATE) == 1 }
        })
        .await);
        sleep(Duration::from_millis(100)).await;
        assert_eq!(rec_a.count(cmd::GRAPHSTATE), 0);
        node.stop().await;
    }

    #[tokio::test]
    async fn test_relay_respects_fee_filter_and_header_preference() {
        let dir = tempfile::tempdir().unwrap();
        let (node, chain) = test_node(test_config(&dir)).await;
        let (remote, recorder) = dial(&node).await;
        assert!(wait_for_count(&node, 1).await);

        remote.queue_message(Message::FeeFilter(MsgFeeFilter { min_fee: 5000 }));
        remote.queue_message(Message::SendHeaders);
        sleep(Duration::from_millis(200)).await;

        let mut cheap = RelayInventory::tx(h(1), Some(1000));
        cheap.immediate = true;
        node.relay_inventory(cheap).await.unwrap();
        let mut rich = RelayInventory::tx(h(2), Some(9000));
        rich.immediate = true;
        node.relay_inventory(rich).await.unwrap();

        let r = Arc::clone(&recorder);
        assert!(eventually(|| {
            let r = Arc::clone(&r);
            async move { r.invs.lock().len() == 1 }
        })
        .await);
        assert_eq!(recorder.invs.lock()[0].inv_list, vec![InvVect::tx(h(2))]);

        node.relay_inventory(RelayInventory::block(h(3), Some(vec![3, 3])))
            .await
            .unwrap();
        node.relay_inventory(RelayInventory::block(h(4), None))
            .await
            .unwrap();
        let r = Arc::clone(&recorder);
        assert!(eventually(|| {
            let r = Arc::clone(&r);
            async move { r.count(cmd::HEADERS) == 1 && r.invs.lock().len() == 2 }
        })
        .await);
        let block_inv = recorder.invs.lock()[1].clone();
        assert_eq!(block_inv.inv_list, vec![InvVect::block(h(4))]);
        assert_eq!(block_inv.gs, Some(chain.graph_state()));
        node.stop().await;
    }

    #[tokio::test]
    async fn test_connect_and_disconnect_node() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let (node_a, _) = test_node(test_config(&dir_a)).await;
        let (node_b, _) = test_node(test_config(&dir_b)).await;
        let b_addr = node_b.listen_addrs()[0];

        node_a
            .connect_node(&b_addr.to_string(), false)
            .await
            .unwrap();
        assert!(wait_for_count(&node_a, 1).await);
        assert!(wait_for_count(&node_b, 1).await);

        let peers = node_a.peers().await.unwrap();
        assert!(!peers[0].inbound);
        assert_eq!(peers[0].addr, b_addr);
        let key = group_key(&b_addr.ip());
        assert_eq!(node_a.outbound_group_count(&key).await.unwrap(), 1);
        assert!(matches!(
            node_a.connect_node(&b_addr.to_string(), false).await,
            Err(NodeError::AlreadyConnected(_))
        ));

        node_a
            .disconnect_node(PeerSelector::Addr(b_addr))
            .await
            .unwrap();
        assert!(wait_for_count(&node_a, 0).await);
        assert!(wait_for_count(&node_b, 0).await);
        assert_eq!(node_a.outbound_group_count(&key).await.unwrap(), 0);
        assert!(matches!(
            node_a.disconnect_node(PeerSelector::Id(999)).await,
            Err(NodeError::PeerNotFound(_))
        ));

        node_a.stop().await;
        node_b.stop().await;
    }

    #[tokio::test]
    async fn test_removed_permanent_peer_stays_gone() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let (node_b, _) = test_node(test_config(&dir_b)).await;
        let b_addr = node_b.listen_addrs()[0];
        let config = NodeConfig {
            add_peers: vec![b_addr.to_string()],
            ..test_config(&dir_a)
        };
        let (node_a, _) = test_node(config).await;
        assert!(wait_for_count(&node_a, 1).await);

        node_a.remove_node(PeerSelector::Addr(b_addr)).await.unwrap();
        assert!(wait_for_count(&node_a, 0).await);
        sleep(Duration::from_millis(1500)).await;
        assert_eq!(node_a.connection_count().await.unwrap(), 0);

        node_a.stop().await;
        node_b.stop().await;
    }

    #[tokio::test]
    async fn test_stop_saves_address_book_and_refuses_queries() {
        let dir = tempfile::tempdir().unwrap();
        let (node, _chain) = test_node(test_config(&dir)).await;
        let src = NetAddress::new("8.8.8.8".parse().unwrap(), 38130, Default::default());
        let na = NetAddress::new("9.9.9.9".parse().unwrap(), 38130, Default::default());
        node.addr_manager().add_address(&na, &src);

        node.stop().await;
        assert!(dir.path().join(crate::network::addrman::PEERS_FILENAME).exists());
        assert!(matches!(
            node.connection_count().await,
            Err(NodeError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_address_source_with_empty_book() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            network: Network::Testnet,
            ..test_config(&dir)
        };
        let chain: Arc<dyn ChainView> = Arc::new(MemoryChain::new(config.network.genesis_hash()));
        let addrman = Arc::new(AddrManager::new(dir.path(), 0, None));
        let (tx, _rx) = mpsc::channel(8);
        let shared = NodeShared::new(config, chain, addrman, tx).unwrap();

        assert!(matches!(
            shared.next_outbound_address().await,
            Err(ConnError::NoAddress(_))
        ));
        assert!(!shared.automatic_outbound());
    }
}
