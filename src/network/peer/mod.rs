//! Peer session
//!
//! One `Peer` per TCP connection. After `associate_connection` the session
//! negotiates the protocol (`version`/`verack`) under a timeout and then
//! runs four tasks until it is disconnected:
//!
//! - input: reads frames, enforces the idle timeout, dispatches to the listener
//! - output: writes queued messages and sends periodic pings
//! - queue: priority messages first, inventory trickled in batches
//! - stall: disconnects peers that leave requests unanswered

mod handlers;
mod handshake;
pub mod listener;

pub use listener::{
    AddressListener, HandshakeListener, InventoryListener, NoopListener, PeerListener,
    SyncListener, TrafficListener,
};

use crate::network::message::{
    GraphState, Hash, InvVect, Message, MessageError, MsgAddr, MsgGetBlocks, MsgGetHeaders, MsgInv,
    MsgReject, MsgSyncDag, NetAddress, RejectCode, ServiceFlags, MAX_ADDR_PER_MSG,
};
use crate::network::params::{Network, MAX_PROTOCOL_VERSION};
use crate::network::registry::PeerRegistry;
use crate::network::server::CodecError;
use chrono::Utc;
use lru::LruCache;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};

// ============================================================================
// Constants
// ============================================================================

pub const NEGOTIATE_TIMEOUT: Duration = Duration::from_secs(30);
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const PING_INTERVAL: Duration = Duration::from_secs(2 * 60);
pub const STALL_TICK_INTERVAL: Duration = Duration::from_secs(15);
pub const STALL_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);
pub const TRICKLE_INTERVAL: Duration = Duration::from_secs(10);

/// Inventory remembered per peer to avoid re-announcing it
pub const MAX_KNOWN_INVENTORY: usize = 1000;

/// Addresses remembered per peer to avoid gossiping them back
pub const MAX_KNOWN_ADDRESSES: usize = 5000;

/// Capacity of the priority output queue
pub const OUTPUT_BUFFER_SIZE: usize = 50;

/// Most inventory entries per trickled `inv`
pub const MAX_INV_TRICKLE_SIZE: usize = 1000;

const INV_QUEUE_SIZE: usize = MAX_INV_TRICKLE_SIZE;

fn cache<K: std::hash::Hash + Eq, V>(capacity: usize) -> LruCache<K, V> {
    LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN))
}

pub fn default_user_agent() -> String {
    format!("/dagnode:{}/", env!("CARGO_PKG_VERSION"))
}

// ============================================================================
// Errors and state
// ============================================================================

/// Peer session errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Protocol negotiation timed out")]
    NegotiationTimeout,

    #[error("Connected to self")]
    SelfConnection,

    #[error("A version message must precede all others, got {0}")]
    VersionFirst(String),

    #[error("Protocol version {0} is obsolete")]
    ObsoleteVersion(u32),

    #[error("Expected verack, got {0}")]
    ExpectedVerAck(String),

    #[error("Version rejected: {0}")]
    Rejected(String),
}

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Created,
    Negotiating,
    Established,
    Disconnected,
}

impl SessionState {
    pub fn can_transition(self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            (Created, Negotiating)
                | (Negotiating, Established)
                | (Created | Negotiating | Established, Disconnected)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Created => "created",
            SessionState::Negotiating => "negotiating",
            SessionState::Established => "established",
            SessionState::Disconnected => "disconnected",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Provides the graph state advertised in our `version`
pub type GraphStateFn = Arc<dyn Fn() -> GraphState + Send + Sync>;

/// Per-session settings
#[derive(Clone)]
pub struct PeerConfig {
    pub magic: [u8; 4],
    /// Highest protocol version we speak
    pub protocol_version: u32,
    pub services: ServiceFlags,
    pub user_agent: String,
    /// Ask the remote not to relay transactions to us
    pub disable_relay_tx: bool,
    pub negotiate_timeout: Duration,
    pub idle_timeout: Duration,
    pub ping_interval: Duration,
    pub stall_tick_interval: Duration,
    pub stall_response_timeout: Duration,
    pub trickle_interval: Duration,
    pub graph_state: Option<GraphStateFn>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            magic: Network::Mainnet.magic(),
            protocol_version: MAX_PROTOCOL_VERSION,
            services: ServiceFlags::default_services(),
            user_agent: default_user_agent(),
            disable_relay_tx: false,
            negotiate_timeout: NEGOTIATE_TIMEOUT,
            idle_timeout: IDLE_TIMEOUT,
            ping_interval: PING_INTERVAL,
            stall_tick_interval: STALL_TICK_INTERVAL,
            stall_response_timeout: STALL_RESPONSE_TIMEOUT,
            trickle_interval: TRICKLE_INTERVAL,
            graph_state: None,
        }
    }
}

impl fmt::Debug for PeerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConfig")
            .field("magic", &self.magic)
            .field("protocol_version", &self.protocol_version)
            .field("services", &self.services)
            .field("user_agent", &self.user_agent)
            .field("disable_relay_tx", &self.disable_relay_tx)
            .field("negotiate_timeout", &self.negotiate_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("trickle_interval", &self.trickle_interval)
            .finish()
    }
}

// ============================================================================
// Session internals
// ============================================================================

/// What we learned from the remote plus ping bookkeeping
#[derive(Debug, Default)]
struct PeerFlags {
    na: Option<NetAddress>,
    version_known: bool,
    verack_received: bool,
    protocol_version: u32,
    advertised_proto_ver: u32,
    services: ServiceFlags,
    user_agent: String,
    time_offset: i64,
    disable_relay_tx: bool,
    wants_headers: bool,
    last_gs: GraphState,
    sync_point: Option<Hash>,
    last_announced_block: Option<Hash>,
    last_ping_nonce: Option<u64>,
    last_ping_time: Option<Instant>,
    last_ping_micros: i64,
    conn_time: i64,
}

/// Previous sync requests, for duplicate suppression
struct RequestFilters {
    prev_get_blocks_gs: Option<GraphState>,
    prev_get_blocks: LruCache<Hash, ()>,
    prev_get_headers: Option<(Option<Hash>, Hash)>,
    prev_sync_dag: Option<(GraphState, Vec<Hash>)>,
}

impl RequestFilters {
    fn new() -> Self {
        Self {
            prev_get_blocks_gs: None,
            prev_get_blocks: cache(MAX_KNOWN_INVENTORY),
            prev_get_headers: None,
            prev_sync_dag: None,
        }
    }
}

/// Message waiting for the output task
struct OutMsg {
    msg: Message,
    done: Option<oneshot::Sender<()>>,
}

/// Events feeding the stall detector
#[derive(Debug)]
enum StallControl {
    Sent(&'static str),
    Received(&'static str),
    HandlerStart,
    HandlerDone,
}

/// Receivers handed to the tasks once negotiation succeeds
struct SessionChannels {
    output_rx: mpsc::Receiver<OutMsg>,
    inv_rx: mpsc::Receiver<InvVect>,
    stall_rx: mpsc::UnboundedReceiver<StallControl>,
}

struct PeerInner {
    id: u32,
    addr: SocketAddr,
    inbound: bool,
    config: PeerConfig,
    registry: Arc<PeerRegistry>,
    listener: Arc<dyn PeerListener>,

    state: Mutex<SessionState>,
    state_tx: watch::Sender<SessionState>,
    done_tx: watch::Sender<bool>,

    flags: Mutex<PeerFlags>,
    filters: Mutex<RequestFilters>,
    known_inventory: Mutex<LruCache<InvVect, ()>>,
    known_addresses: Mutex<LruCache<String, ()>>,

    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    last_send: AtomicI64,
    last_recv: AtomicI64,

    output_tx: mpsc::Sender<OutMsg>,
    inv_tx: mpsc::Sender<InvVect>,
    stall_tx: mpsc::UnboundedSender<StallControl>,
    channels: Mutex<Option<SessionChannels>>,
}

/// Snapshot of a session for status queries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: u32,
    pub addr: SocketAddr,
    pub inbound: bool,
    pub state: SessionState,
    pub services: ServiceFlags,
    pub user_agent: String,
    pub protocol_version: u32,
    pub last_gs: GraphState,
    pub conn_time: i64,
    pub last_send: i64,
    pub last_recv: i64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub time_offset: i64,
    pub ping_micros: i64,
}

// ============================================================================
// Peer
// ============================================================================

/// Handle to one peer session; clones share the session
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl Peer {
    pub fn new_inbound(
        addr: SocketAddr,
        config: PeerConfig,
        registry: Arc<PeerRegistry>,
        listener: Arc<dyn PeerListener>,
    ) -> Self {
        Self::new(addr, true, config, registry, listener)
    }

    pub fn new_outbound(
        addr: SocketAddr,
        config: PeerConfig,
        registry: Arc<PeerRegistry>,
        listener: Arc<dyn PeerListener>,
    ) -> Self {
        let peer = Self::new(addr, false, config, registry, listener);
        peer.inner.flags.lock().na = Some(NetAddress::from_socket_addr(addr, ServiceFlags::empty()));
        peer
    }

    fn new(
        addr: SocketAddr,
        inbound: bool,
        config: PeerConfig,
        registry: Arc<PeerRegistry>,
        listener: Arc<dyn PeerListener>,
    ) -> Self {
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_BUFFER_SIZE);
        let (inv_tx, inv_rx) = mpsc::channel(INV_QUEUE_SIZE);
        let (stall_tx, stall_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(SessionState::Created);
        let (done_tx, _) = watch::channel(false);

        let inner = PeerInner {
            id: registry.next_peer_id(),
            addr,
            inbound,
            config,
            registry,
            listener,
            state: Mutex::new(SessionState::Created),
            state_tx,
            done_tx,
            flags: Mutex::new(PeerFlags::default()),
            filters: Mutex::new(RequestFilters::new()),
            known_inventory: Mutex::new(cache(MAX_KNOWN_INVENTORY)),
            known_addresses: Mutex::new(cache(MAX_KNOWN_ADDRESSES)),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            last_send: AtomicI64::new(0),
            last_recv: AtomicI64::new(0),
            output_tx,
            inv_tx,
            stall_tx,
            channels: Mutex::new(Some(SessionChannels {
                output_rx,
                inv_rx,
                stall_rx,
            })),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Hand the socket to the session and start negotiating
    pub fn associate_connection(&self, stream: TcpStream) {
        if !self.transition(SessionState::Negotiating) {
            log::debug!("Not associating connection with {} in state {}", self, self.state());
            return;
        }
        self.inner.flags.lock().conn_time = Utc::now().timestamp();

        let peer = self.clone();
        tokio::spawn(async move { peer.run(stream).await });
    }

    fn transition(&self, to: SessionState) -> bool {
        let mut state = self.inner.state.lock();
        if !state.can_transition(to) {
            return false;
        }
        *state = to;
        self.inner.state_tx.send_replace(to);
        true
    }

    /// Tear the session down; safe to call any number of times
    pub fn disconnect(&self) {
        let previous = {
            let mut state = self.inner.state.lock();
            let previous = *state;
            if !previous.can_transition(SessionState::Disconnected) {
                return;
            }
            *state = SessionState::Disconnected;
            self.inner.state_tx.send_replace(SessionState::Disconnected);
            previous
        };
        log::trace!("Disconnecting {}", self);

        // Nothing was ever spawned for a session without a socket
        if previous == SessionState::Created {
            self.finish();
        }
    }

    fn finish(&self) {
        self.inner.channels.lock().take();
        self.inner.done_tx.send_replace(true);
    }

    /// Resolves once every session task has exited
    pub async fn wait_for_disconnect(&self) {
        let mut done = self.inner.done_tx.subscribe();
        let _ = done.wait_for(|done| *done).await;
    }

    /// Resolves with `true` once negotiation succeeds, `false` if the
    /// session ends first
    pub async fn wait_established(&self) -> bool {
        let mut state = self.inner.state_tx.subscribe();
        let result = state
            .wait_for(|s| matches!(s, SessionState::Established | SessionState::Disconnected))
            .await
            .map(|s| *s == SessionState::Established)
            .unwrap_or(false);
        result
    }

    fn quit_signal(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    pub fn inbound(&self) -> bool {
        self.inner.inbound
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    pub fn connected(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Negotiating | SessionState::Established
        )
    }

    /// Remote address with the services it advertised, once known
    pub fn na(&self) -> Option<NetAddress> {
        self.inner.flags.lock().na.clone()
    }

    pub fn version_known(&self) -> bool {
        self.inner.flags.lock().version_known
    }

    pub fn verack_received(&self) -> bool {
        self.inner.flags.lock().verack_received
    }

    /// Negotiated protocol version
    pub fn protocol_version(&self) -> u32 {
        self.inner.flags.lock().protocol_version
    }

    /// Protocol version the remote advertised
    pub fn advertised_protocol_version(&self) -> u32 {
        self.inner.flags.lock().advertised_proto_ver
    }

    pub fn services(&self) -> ServiceFlags {
        self.inner.flags.lock().services
    }

    pub fn user_agent(&self) -> String {
        self.inner.flags.lock().user_agent.clone()
    }

    pub fn time_offset(&self) -> i64 {
        self.inner.flags.lock().time_offset
    }

    pub fn disable_relay_tx(&self) -> bool {
        self.inner.flags.lock().disable_relay_tx
    }

    pub fn wants_headers(&self) -> bool {
        self.inner.flags.lock().wants_headers
    }

    pub fn last_gs(&self) -> GraphState {
        self.inner.flags.lock().last_gs.clone()
    }

    pub fn sync_point(&self) -> Option<Hash> {
        self.inner.flags.lock().sync_point
    }

    pub fn last_announced_block(&self) -> Option<Hash> {
        self.inner.flags.lock().last_announced_block
    }

    /// Round trip of the last answered ping in microseconds
    pub fn last_ping_micros(&self) -> i64 {
        self.inner.flags.lock().last_ping_micros
    }

    pub fn bytes_sent(&self) -> u64 {
        self.inner.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.inner.bytes_received.load(Ordering::Relaxed)
    }

    pub fn last_send(&self) -> i64 {
        self.inner.last_send.load(Ordering::Relaxed)
    }

    pub fn last_recv(&self) -> i64 {
        self.inner.last_recv.load(Ordering::Relaxed)
    }

    pub fn info(&self) -> PeerInfo {
        let flags = self.inner.flags.lock();
        PeerInfo {
            id: self.inner.id,
            addr: self.inner.addr,
            inbound: self.inner.inbound,
            state: *self.inner.state.lock(),
            services: flags.services,
            user_agent: flags.user_agent.clone(),
            protocol_version: flags.protocol_version,
            last_gs: flags.last_gs.clone(),
            conn_time: flags.conn_time,
            last_send: self.last_send(),
            last_recv: self.last_recv(),
            bytes_sent: self.bytes_sent(),
            bytes_received: self.bytes_received(),
            time_offset: flags.time_offset,
            ping_micros: flags.last_ping_micros,
        }
    }

    // ------------------------------------------------------------------------
    // Updaters
    // ------------------------------------------------------------------------

    pub fn update_last_gs(&self, gs: GraphState) {
        self.inner.flags.lock().last_gs = gs;
    }

    pub fn update_sync_point(&self, hash: Hash) {
        self.inner.flags.lock().sync_point = Some(hash);
    }

    pub fn update_last_announced_block(&self, hash: Hash) {
        self.inner.flags.lock().last_announced_block = Some(hash);
    }

    pub fn set_wants_headers(&self) {
        self.inner.flags.lock().wants_headers = true;
    }

    pub fn add_known_inventory(&self, inv: InvVect) {
        self.inner.known_inventory.lock().put(inv, ());
    }

    pub fn is_known_inventory(&self, inv: &InvVect) -> bool {
        self.inner.known_inventory.lock().contains(inv)
    }

    pub fn add_known_addresses(&self, addresses: &[NetAddress]) {
        let mut known = self.inner.known_addresses.lock();
        for na in addresses {
            known.put(na.key(), ());
        }
    }

    pub fn is_known_address(&self, na: &NetAddress) -> bool {
        self.inner.known_addresses.lock().contains(&na.key())
    }

    // ------------------------------------------------------------------------
    // Queueing
    // ------------------------------------------------------------------------

    /// Queue a message on the priority queue. A full queue means the peer
    /// is not keeping up and gets disconnected.
    pub fn queue_message(&self, msg: Message) {
        self.queue_message_with_done(msg, None);
    }

    /// Like `queue_message`, signalling `done` once the message was written
    /// or dropped
    pub fn queue_message_with_done(&self, msg: Message, done: Option<oneshot::Sender<()>>) {
        if !self.connected() {
            return;
        }
        match self.inner.output_tx.try_send(OutMsg { msg, done }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(out)) => {
                log::warn!(
                    "Send queue for {} is full dropping {} -- disconnecting",
                    self,
                    out.msg.command()
                );
                self.disconnect();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Queue a message, waiting for room in the priority queue
    pub async fn send_message(&self, msg: Message) -> Result<(), PeerError> {
        if !self.connected() {
            return Err(PeerError::Disconnected);
        }
        let mut quit = self.quit_signal();
        tokio::select! {
            sent = self.inner.output_tx.send(OutMsg { msg, done: None }) => {
                sent.map_err(|_| PeerError::Disconnected)
            }
            _ = handlers::wait_quit(&mut quit) => Err(PeerError::Disconnected),
        }
    }

    /// Trickle an inventory announcement with the next batch
    pub fn queue_inventory(&self, inv: InvVect) {
        if self.is_known_inventory(&inv) || !self.connected() {
            return;
        }
        if self.inner.inv_tx.try_send(inv).is_err() {
            log::trace!("Inventory queue for {} is full, dropping {}", self, inv);
        }
    }

    /// Announce right away as a single-entry `inv`
    pub fn queue_inventory_immediate(&self, inv: InvVect, gs: Option<GraphState>) {
        if self.is_known_inventory(&inv) {
            return;
        }
        self.add_known_inventory(inv);
        self.queue_message(Message::Inv(MsgInv {
            gs,
            inv_list: vec![inv],
        }));
    }

    /// Send addresses the peer does not know yet, at most one message worth.
    /// Returns what was sent.
    pub fn push_addr_msg(&self, addresses: &[NetAddress]) -> Vec<NetAddress> {
        let mut list: Vec<NetAddress> = addresses
            .iter()
            .filter(|na| !self.is_known_address(na))
            .cloned()
            .collect();
        if list.is_empty() {
            return list;
        }
        if list.len() > MAX_ADDR_PER_MSG {
            list.shuffle(&mut rand::thread_rng());
            list.truncate(MAX_ADDR_PER_MSG);
        }
        self.add_known_addresses(&list);
        self.queue_message(Message::Addr(MsgAddr {
            addr_list: list.clone(),
        }));
        list
    }

    /// Send a `reject`, optionally waiting until it hit the wire
    pub async fn push_reject_msg(
        &self,
        command: &str,
        code: RejectCode,
        reason: &str,
        hash: Option<Hash>,
        wait: bool,
    ) {
        let mut reject = MsgReject::new(command, code, reason);
        reject.hash = hash;
        if !wait {
            self.queue_message(Message::Reject(reject));
            return;
        }
        let (tx, rx) = oneshot::channel();
        self.queue_message_with_done(Message::Reject(reject), Some(tx));
        let mut quit = self.quit_signal();
        tokio::select! {
            _ = rx => {}
            _ = handlers::wait_quit(&mut quit) => {}
        }
    }

    /// Request blocks. With hashes only unseen ones are requested; without,
    /// a repeated graph state is a duplicate. Returns whether anything was sent.
    pub fn push_get_blocks_msg(&self, gs: GraphState, blocks: Vec<Hash>) -> bool {
        let block_locator = {
            let mut filters = self.inner.filters.lock();
            let had_hashes = !blocks.is_empty();
            let fresh: Vec<Hash> = blocks
                .into_iter()
                .filter(|h| !filters.prev_get_blocks.contains(h))
                .collect();
            let duplicate = if had_hashes {
                fresh.is_empty()
            } else {
                filters.prev_get_blocks_gs.as_ref() == Some(&gs)
            };
            if duplicate {
                log::trace!("Filtering duplicate [getblocks] with gs {} to {}", gs, self);
                return false;
            }
            for hash in &fresh {
                filters.prev_get_blocks.put(*hash, ());
            }
            filters.prev_get_blocks_gs = Some(gs.clone());
            fresh
        };
        self.queue_message(Message::GetBlocks(MsgGetBlocks { gs, block_locator }));
        true
    }

    /// Request headers; the same begin and stop hash twice is a duplicate
    pub fn push_get_headers_msg(&self, block_locator: Vec<Hash>, hash_stop: Hash) -> bool {
        {
            let mut filters = self.inner.filters.lock();
            let key = (block_locator.first().copied(), hash_stop);
            if filters.prev_get_headers == Some(key) {
                log::trace!(
                    "Filtering duplicate [getheaders] with stop {} to {}",
                    hash_stop,
                    self
                );
                return false;
            }
            filters.prev_get_headers = Some(key);
        }
        self.queue_message(Message::GetHeaders(MsgGetHeaders {
            block_locator,
            hash_stop,
        }));
        true
    }

    pub fn push_sync_dag_msg(&self, gs: GraphState, main_locator: Vec<Hash>) -> bool {
        {
            let mut filters = self.inner.filters.lock();
            if let Some((prev_gs, prev_locator)) = &filters.prev_sync_dag {
                if *prev_gs == gs && *prev_locator == main_locator {
                    log::trace!("Filtering duplicate [syncdag] with gs {} to {}", gs, self);
                    return false;
                }
            }
            filters.prev_sync_dag = Some((gs.clone(), main_locator.clone()));
        }
        self.queue_message(Message::SyncDag(MsgSyncDag { gs, main_locator }));
        true
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = if self.inner.inbound {
            "inbound"
        } else {
            "outbound"
        };
        write!(f, "{} ({})", self.inner.addr, direction)
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.inner.id)
            .field("addr", &self.inner.addr)
            .field("inbound", &self.inner.inbound)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::{cmd, MsgGetData, MsgPing, MsgVersion};
    use crate::network::server::{Frame, MessageCodec};
    use futures::{SinkExt, StreamExt};
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;
    use tokio::time::{sleep, timeout};
    use tokio_util::codec::{FramedRead, FramedWrite};

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct CountingListener {
        versions: AtomicUsize,
        veracks: AtomicUsize,
        reads: AtomicUsize,
        get_addrs: AtomicUsize,
        invs: parking_lot::Mutex<Vec<MsgInv>>,
    }

    impl CountingListener {
        fn callbacks(&self) -> usize {
            self.versions.load(Ordering::SeqCst)
                + self.veracks.load(Ordering::SeqCst)
                + self.reads.load(Ordering::SeqCst)
                + self.get_addrs.load(Ordering::SeqCst)
                + self.invs.lock().len()
        }

        fn inv_entries(&self) -> usize {
            self.invs.lock().iter().map(|m| m.inv_list.len()).sum()
        }
    }

    impl HandshakeListener for CountingListener {
        fn on_version(&self, _peer: &Peer, _msg: &MsgVersion) -> Option<MsgReject> {
            self.versions.fetch_add(1, Ordering::SeqCst);
            None
        }

        fn on_verack(&self, _peer: &Peer) {
            self.veracks.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl AddressListener for CountingListener {
        fn on_get_addr(&self, _peer: &Peer) {
            self.get_addrs.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl InventoryListener for CountingListener {
        fn on_inv(&self, _peer: &Peer, msg: &MsgInv) {
            self.invs.lock().push(msg.clone());
        }
    }

    impl SyncListener for CountingListener {}

    impl TrafficListener for CountingListener {
        fn on_read(&self, _peer: &Peer, _bytes: usize, _command: &str) {
            self.reads.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_config(protocol_version: u32) -> PeerConfig {
        PeerConfig {
            magic: Network::Testnet.magic(),
            protocol_version,
            ..PeerConfig::default()
        }
    }

    async fn socket_pair() -> (TcpStream, TcpStream, SocketAddr, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (server, remote) = accepted.unwrap();
        (client.unwrap(), server, addr, remote)
    }

    struct Side {
        config: PeerConfig,
        registry: Arc<PeerRegistry>,
        listener: Arc<dyn PeerListener>,
    }

    impl Side {
        fn new(config: PeerConfig, listener: Arc<dyn PeerListener>) -> Self {
            Self {
                config,
                registry: Arc::new(PeerRegistry::new()),
                listener,
            }
        }
    }

    /// Connect two sessions over loopback, inbound side associated first
    async fn connected_pair(inbound: Side, outbound: Side) -> (Peer, Peer) {
        let (client, server, listen_addr, remote) = socket_pair().await;
        let in_peer = Peer::new_inbound(remote, inbound.config, inbound.registry, inbound.listener);
        let out_peer = Peer::new_outbound(
            listen_addr,
            outbound.config,
            outbound.registry,
            outbound.listener,
        );
        in_peer.associate_connection(server);
        out_peer.associate_connection(client);
        (in_peer, out_peer)
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            sleep(Duration::from_millis(20)).await;
        }
        check()
    }

    fn raw_codec() -> MessageCodec {
        MessageCodec::new(Network::Testnet.magic())
    }

    #[test]
    fn test_session_state_transitions() {
        use SessionState::*;
        assert!(Created.can_transition(Negotiating));
        assert!(Negotiating.can_transition(Established));
        assert!(Established.can_transition(Disconnected));
        assert!(Created.can_transition(Disconnected));
        assert!(!Created.can_transition(Established));
        assert!(!Disconnected.can_transition(Disconnected));
        assert!(!Disconnected.can_transition(Negotiating));
        assert!(!Established.can_transition(Negotiating));
    }

    #[tokio::test]
    async fn test_loopback_handshake_negotiates_lowest_version() {
        let in_listener = Arc::new(CountingListener::default());
        let out_listener = Arc::new(CountingListener::default());
        let (in_peer, out_peer) = connected_pair(
            Side::new(test_config(3), in_listener.clone()),
            Side::new(test_config(2), out_listener.clone()),
        )
        .await;

        assert!(timeout(WAIT, in_peer.wait_established()).await.unwrap());
        assert!(timeout(WAIT, out_peer.wait_established()).await.unwrap());

        assert_eq!(in_peer.protocol_version(), 2);
        assert_eq!(out_peer.protocol_version(), 2);
        assert_eq!(in_peer.advertised_protocol_version(), 2);
        assert_eq!(out_peer.advertised_protocol_version(), 3);
        assert!(in_peer.version_known() && in_peer.verack_received());
        assert_eq!(in_listener.versions.load(Ordering::SeqCst), 1);
        assert_eq!(out_listener.veracks.load(Ordering::SeqCst), 1);
        assert_eq!(in_peer.user_agent(), default_user_agent());
        assert!(in_peer.bytes_received() > 0);

        out_peer.disconnect();
        timeout(WAIT, out_peer.wait_for_disconnect()).await.unwrap();
        timeout(WAIT, in_peer.wait_for_disconnect()).await.unwrap();
        assert_eq!(in_peer.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_self_connection_is_dropped() {
        let registry = Arc::new(PeerRegistry::new());
        let listener: Arc<dyn PeerListener> = Arc::new(NoopListener);
        let (in_peer, out_peer) = connected_pair(
            Side {
                config: test_config(MAX_PROTOCOL_VERSION),
                registry: registry.clone(),
                listener: listener.clone(),
            },
            Side {
                config: test_config(MAX_PROTOCOL_VERSION),
                registry,
                listener,
            },
        )
        .await;

        assert!(!timeout(WAIT, in_peer.wait_established()).await.unwrap());
        timeout(WAIT, in_peer.wait_for_disconnect()).await.unwrap();
        timeout(WAIT, out_peer.wait_for_disconnect()).await.unwrap();
        assert_eq!(in_peer.state(), SessionState::Disconnected);
        assert!(!out_peer.verack_received());
    }

    #[tokio::test]
    async fn test_negotiation_timeout_invokes_no_listeners() {
        let (_client, server, _, remote) = socket_pair().await;
        let listener = Arc::new(CountingListener::default());
        let config = PeerConfig {
            negotiate_timeout: Duration::from_millis(200),
            ..test_config(MAX_PROTOCOL_VERSION)
        };
        let peer = Peer::new_inbound(remote, config, Arc::new(PeerRegistry::new()), listener.clone());
        peer.associate_connection(server);

        timeout(WAIT, peer.wait_for_disconnect()).await.unwrap();
        assert_eq!(peer.state(), SessionState::Disconnected);
        assert_eq!(listener.callbacks(), 0);
    }

    #[tokio::test]
    async fn test_obsolete_version_is_rejected() {
        let (client, server, _, remote) = socket_pair().await;
        let peer = Peer::new_inbound(
            remote,
            test_config(MAX_PROTOCOL_VERSION),
            Arc::new(PeerRegistry::new()),
            Arc::new(NoopListener),
        );
        peer.associate_connection(server);

        let (read, write) = client.into_split();
        let mut reader = FramedRead::new(read, raw_codec());
        let mut writer = FramedWrite::new(write, raw_codec());
        let version = MsgVersion {
            protocol_version: 0,
            services: ServiceFlags::NODE_NETWORK,
            timestamp: Utc::now().timestamp(),
            addr_you: NetAddress::unspecified(),
            addr_me: NetAddress::unspecified(),
            nonce: 42,
            user_agent: "/old/".to_string(),
            last_gs: GraphState::default(),
            disable_relay_tx: false,
        };
        writer
            .send(Frame::from_message(&Message::Version(version)).unwrap())
            .await
            .unwrap();

        let frame = timeout(WAIT, reader.next()).await.unwrap().unwrap().unwrap();
        match frame.to_message().unwrap() {
            Message::Reject(reject) => {
                assert_eq!(reject.cmd, cmd::VERSION);
                assert_eq!(reject.code, RejectCode::Obsolete);
            }
            other => panic!("expected reject, got {:?}", other),
        }
        timeout(WAIT, peer.wait_for_disconnect()).await.unwrap();
        assert!(!peer.wait_established().await);
    }

    #[tokio::test]
    async fn test_version_must_come_first() {
        let (client, server, _, remote) = socket_pair().await;
        let peer = Peer::new_inbound(
            remote,
            test_config(MAX_PROTOCOL_VERSION),
            Arc::new(PeerRegistry::new()),
            Arc::new(NoopListener),
        );
        peer.associate_connection(server);

        let (read, write) = client.into_split();
        let mut reader = FramedRead::new(read, raw_codec());
        let mut writer = FramedWrite::new(write, raw_codec());
        writer
            .send(Frame::from_message(&Message::Ping(MsgPing { nonce: 1 })).unwrap())
            .await
            .unwrap();

        let frame = timeout(WAIT, reader.next()).await.unwrap().unwrap().unwrap();
        match frame.to_message().unwrap() {
            Message::Reject(reject) => {
                assert_eq!(reject.cmd, cmd::PING);
                assert_eq!(reject.code, RejectCode::Malformed);
            }
            other => panic!("expected reject, got {:?}", other),
        }
        timeout(WAIT, peer.wait_for_disconnect()).await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_completes_while_remote_not_reading() {
        let (client, server, _, remote) = socket_pair().await;
        let peer = Peer::new_inbound(
            remote,
            test_config(MAX_PROTOCOL_VERSION),
            Arc::new(PeerRegistry::new()),
            Arc::new(NoopListener),
        );
        peer.associate_connection(server);

        // Complete the handshake, then never read again
        let (_read, write) = client.into_split();
        let mut writer = FramedWrite::new(write, raw_codec());
        let version = MsgVersion {
            protocol_version: MAX_PROTOCOL_VERSION,
            services: ServiceFlags::NODE_NETWORK,
            timestamp: Utc::now().timestamp(),
            addr_you: NetAddress::unspecified(),
            addr_me: NetAddress::unspecified(),
            nonce: 42,
            user_agent: "/stuck/".to_string(),
            last_gs: GraphState::default(),
            disable_relay_tx: false,
        };
        writer
            .send(Frame::from_message(&Message::Version(version)).unwrap())
            .await
            .unwrap();
        writer
            .send(Frame::from_message(&Message::VerAck).unwrap())
            .await
            .unwrap();
        assert!(timeout(WAIT, peer.wait_established()).await.unwrap());

        let inv_list = (0..10_000u32)
            .map(|i| {
                let mut hash = [0u8; 32];
                hash[..4].copy_from_slice(&i.to_le_bytes());
                InvVect::tx(Hash(hash))
            })
            .collect();
        let inv = MsgInv::new(inv_list);
        let sender = {
            let peer = peer.clone();
            tokio::spawn(async move {
                while peer.send_message(Message::Inv(inv.clone())).await.is_ok() {}
            })
        };
        peer.queue_inventory(InvVect::block(Hash([5; 32])));

        // Long enough for the socket buffers to fill
        sleep(Duration::from_millis(500)).await;
        assert!(peer.connected());
        peer.disconnect();

        timeout(WAIT, peer.wait_for_disconnect()).await.unwrap();
        timeout(WAIT, sender).await.unwrap().unwrap();
        assert_eq!(peer.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_duplicate_requests_are_filtered() {
        let peer = Peer::new_outbound(
            "127.0.0.1:18130".parse().unwrap(),
            test_config(MAX_PROTOCOL_VERSION),
            Arc::new(PeerRegistry::new()),
            Arc::new(NoopListener),
        );
        let gs = GraphState::genesis(Hash([1; 32]));
        let h1 = Hash([2; 32]);
        let h2 = Hash([3; 32]);

        assert!(peer.push_get_blocks_msg(gs.clone(), vec![h1]));
        assert!(!peer.push_get_blocks_msg(gs.clone(), vec![h1]));
        assert!(peer.push_get_blocks_msg(gs.clone(), vec![h1, h2]));
        assert!(!peer.push_get_blocks_msg(gs.clone(), vec![]));
        let mut ahead = gs.clone();
        ahead.main_height = 5;
        assert!(peer.push_get_blocks_msg(ahead, vec![]));

        assert!(peer.push_get_headers_msg(vec![h1], Hash::ZERO));
        assert!(!peer.push_get_headers_msg(vec![h1, h2], Hash::ZERO));
        assert!(peer.push_get_headers_msg(vec![h1], h2));

        assert!(peer.push_sync_dag_msg(gs.clone(), vec![h1]));
        assert!(!peer.push_sync_dag_msg(gs.clone(), vec![h1]));
        assert!(peer.push_sync_dag_msg(gs, vec![h2]));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let peer = Peer::new_outbound(
            "127.0.0.1:18130".parse().unwrap(),
            PeerConfig::default(),
            Arc::new(PeerRegistry::new()),
            Arc::new(NoopListener),
        );
        peer.disconnect();
        peer.disconnect();
        timeout(WAIT, peer.wait_for_disconnect()).await.unwrap();
        assert_eq!(peer.state(), SessionState::Disconnected);
        assert!(!peer.connected());
    }

    #[tokio::test]
    async fn test_messages_reach_listener() {
        let in_listener = Arc::new(CountingListener::default());
        let (in_peer, out_peer) = connected_pair(
            Side::new(test_config(MAX_PROTOCOL_VERSION), in_listener.clone()),
            Side::new(test_config(MAX_PROTOCOL_VERSION), Arc::new(NoopListener)),
        )
        .await;
        assert!(timeout(WAIT, out_peer.wait_established()).await.unwrap());

        let inv = InvVect::block(Hash([9; 32]));
        out_peer.queue_message(Message::GetAddr);
        out_peer.queue_inventory_immediate(inv, Some(GraphState::genesis(Hash([1; 32]))));
        out_peer.queue_inventory_immediate(inv, None);

        assert!(eventually(|| in_listener.get_addrs.load(Ordering::SeqCst) == 1).await);
        assert!(eventually(|| in_listener.inv_entries() == 1).await);
        let first = in_listener.invs.lock()[0].clone();
        assert!(first.gs.is_some());
        assert!(out_peer.is_known_inventory(&inv));

        in_peer.disconnect();
        timeout(WAIT, out_peer.wait_for_disconnect()).await.unwrap();
    }

    #[tokio::test]
    async fn test_trickled_inventory_is_batched() {
        let in_listener = Arc::new(CountingListener::default());
        let out_config = PeerConfig {
            trickle_interval: Duration::from_millis(50),
            ..test_config(MAX_PROTOCOL_VERSION)
        };
        let (_in_peer, out_peer) = connected_pair(
            Side::new(test_config(MAX_PROTOCOL_VERSION), in_listener.clone()),
            Side::new(out_config, Arc::new(NoopListener)),
        )
        .await;
        assert!(timeout(WAIT, out_peer.wait_established()).await.unwrap());

        for i in 0..3u8 {
            out_peer.queue_inventory(InvVect::tx(Hash([i; 32])));
        }
        out_peer.queue_inventory(InvVect::tx(Hash([0; 32])));

        assert!(eventually(|| in_listener.inv_entries() == 3).await);
        sleep(Duration::from_millis(200)).await;
        assert_eq!(in_listener.inv_entries(), 3);

        // Already announced, so never queued again
        out_peer.queue_inventory(InvVect::tx(Hash([1; 32])));
        sleep(Duration::from_millis(200)).await;
        assert_eq!(in_listener.inv_entries(), 3);
    }

    #[tokio::test]
    async fn test_unanswered_request_stalls_peer() {
        let out_config = PeerConfig {
            stall_tick_interval: Duration::from_millis(50),
            stall_response_timeout: Duration::from_millis(150),
            ..test_config(MAX_PROTOCOL_VERSION)
        };
        let (_in_peer, out_peer) = connected_pair(
            Side::new(test_config(MAX_PROTOCOL_VERSION), Arc::new(NoopListener)),
            Side::new(out_config, Arc::new(NoopListener)),
        )
        .await;
        assert!(timeout(WAIT, out_peer.wait_established()).await.unwrap());

        out_peer.queue_message(Message::GetData(MsgGetData {
            inv_list: vec![InvVect::block(Hash([7; 32]))],
        }));
        timeout(WAIT, out_peer.wait_for_disconnect()).await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_peer_is_disconnected() {
        let config = PeerConfig {
            idle_timeout: Duration::from_millis(200),
            ..test_config(MAX_PROTOCOL_VERSION)
        };
        let (in_peer, out_peer) = connected_pair(
            Side::new(config, Arc::new(NoopListener)),
            Side::new(test_config(MAX_PROTOCOL_VERSION), Arc::new(NoopListener)),
        )
        .await;
        assert!(timeout(WAIT, in_peer.wait_established()).await.unwrap());
        timeout(WAIT, in_peer.wait_for_disconnect()).await.unwrap();
        timeout(WAIT, out_peer.wait_for_disconnect()).await.unwrap();
    }

    #[tokio::test]
    async fn test_ping_is_answered() {
        let config = PeerConfig {
            ping_interval: Duration::from_millis(50),
            ..test_config(MAX_PROTOCOL_VERSION)
        };
        let (_in_peer, out_peer) = connected_pair(
            Side::new(test_config(MAX_PROTOCOL_VERSION), Arc::new(NoopListener)),
            Side::new(config, Arc::new(NoopListener)),
        )
        .await;
        assert!(timeout(WAIT, out_peer.wait_established()).await.unwrap());
        assert!(eventually(|| out_peer.last_ping_micros() > 0).await);
    }

    #[test]
    fn test_push_addr_skips_known() {
        let peer = Peer::new_inbound(
            "127.0.0.1:40000".parse().unwrap(),
            PeerConfig::default(),
            Arc::new(PeerRegistry::new()),
            Arc::new(NoopListener),
        );
        let a = NetAddress::from_socket_addr("8.8.8.8:8130".parse().unwrap(), ServiceFlags::NODE_NETWORK);
        let b = NetAddress::from_socket_addr("9.9.9.9:8130".parse().unwrap(), ServiceFlags::NODE_NETWORK);
        peer.add_known_addresses(&[a.clone()]);

        let sent = peer.push_addr_msg(&[a, b.clone()]);
        assert_eq!(sent, vec![b.clone()]);
        assert!(peer.push_addr_msg(&[b]).is_empty());
    }
}
