//! Node-side handling of peer messages
//!
//! A `ServerPeer` is the listener attached to every session the node
//! creates. It answers requests from the chain view and the address book,
//! forwards announcements to the chain, and keeps the peer's ban score.

use crate::network::banscore::{DynamicBanScore, SERIOUS_SCORE};
use crate::network::connmgr::ConnReq;
use crate::network::message::{
    cmd, Hash, HeaderBytes, InvType, InvVect, Message, MsgAddr, MsgBlock, MsgFeeFilter, MsgGetBlocks,
    MsgGetData, MsgGetHeaders, MsgGraphState, MsgHeaders, MsgInv, MsgNotFound, MsgReject,
    MsgSyncDag, MsgSyncPoint, MsgSyncResult, MsgTx, MsgVersion, NetAddress, RejectCode,
    ServiceFlags, SyncMode, MAX_BLOCKS_PER_MSG, MAX_BLOCK_HEADERS_PER_MSG,
    MAX_BLOCK_LOCATORS_PER_MSG, MAX_INV_PER_MSG, MAX_MONEY,
};
use crate::network::netgroup::is_routable;
use crate::network::node::{NodeCommand, NodeShared};
use crate::network::peer::{
    AddressListener, HandshakeListener, InventoryListener, Peer, SyncListener, TrafficListener,
};
use chrono::Utc;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

/// Addresses stamped further than this into the future are distrusted
const MAX_FUTURE_ADDR_SECS: i64 = 10 * 60;

/// Age given to distrusted addresses so they are evicted first
const FUTURE_ADDR_PENALTY_SECS: i64 = 5 * 24 * 60 * 60;

/// The node's view of one peer
pub struct ServerPeer {
    shared: Arc<NodeShared>,
    conn_req: Option<Arc<ConnReq>>,
    persistent: bool,
    whitelisted: bool,
    ban_score: Mutex<DynamicBanScore>,
    fee_filter: AtomicI64,
    addrs_sent: AtomicBool,
    removed: AtomicBool,
}

impl ServerPeer {
    pub(crate) fn new(
        shared: Arc<NodeShared>,
        conn_req: Option<Arc<ConnReq>>,
        whitelisted: bool,
    ) -> Self {
        let persistent = conn_req.as_ref().map(|req| req.permanent()).unwrap_or(false);
        Self {
            shared,
            conn_req,
            persistent,
            whitelisted,
            ban_score: Mutex::new(DynamicBanScore::new()),
            fee_filter: AtomicI64::new(0),
            addrs_sent: AtomicBool::new(false),
            removed: AtomicBool::new(false),
        }
    }

    pub fn conn_req(&self) -> Option<&Arc<ConnReq>> {
        self.conn_req.as_ref()
    }

    pub fn persistent(&self) -> bool {
        self.persistent
    }

    pub fn whitelisted(&self) -> bool {
        self.whitelisted
    }

    /// Minimum fee rate the peer wants announced, 0 when unset
    pub fn fee_filter(&self) -> i64 {
        self.fee_filter.load(Ordering::Relaxed)
    }

    pub fn ban_score(&self) -> u32 {
        self.ban_score.lock().int()
    }

    /// The connection request was removed; nothing must reconnect it
    pub(crate) fn mark_removed(&self) {
        self.removed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    fn is_private(&self) -> bool {
        self.shared.config.network.is_private()
    }

    /// Raise the peer's ban score. Crossing the threshold bans the host and
    /// disconnects the peer; returns whether that happened.
    pub fn add_ban_score(&self, peer: &Peer, persistent: u32, transient: u32, reason: &str) -> bool {
        let config = &self.shared.config;
        if config.disable_banning {
            return false;
        }
        if self.whitelisted {
            log::debug!("Misbehaving whitelisted peer {}: {}", peer, reason);
            return false;
        }

        let warn_threshold = config.ban_threshold >> 1;
        if persistent == 0 && transient == 0 {
            let score = self.ban_score();
            if score > warn_threshold {
                log::warn!(
                    "Misbehaving peer {}: {} -- ban score is {}, it was not increased this time",
                    peer,
                    reason,
                    score
                );
            }
            return false;
        }

        let score = self.ban_score.lock().increase(persistent, transient);
        if score <= warn_threshold {
            return false;
        }
        log::warn!(
            "Misbehaving peer {}: {} -- ban score increased to {}",
            peer,
            reason,
            score
        );
        if score <= config.ban_threshold {
            return false;
        }

        log::warn!("Misbehaving peer {} -- banning and disconnecting", peer);
        self.shared.notify(NodeCommand::BanPeer(peer.clone()));
        peer.disconnect();
        true
    }

    /// Address of the peer as the book knows it
    fn source_address(&self, peer: &Peer) -> NetAddress {
        peer.na()
            .unwrap_or_else(|| NetAddress::from_socket_addr(peer.addr(), ServiceFlags::empty()))
    }

    fn queue_graph_inv(&self, peer: &Peer, hashes: Vec<Hash>) {
        if hashes.is_empty() {
            return;
        }
        let inv_list = hashes.into_iter().map(InvVect::block).collect();
        peer.queue_message(Message::Inv(MsgInv {
            gs: Some(self.shared.chain.graph_state()),
            inv_list,
        }));
    }
}

impl fmt::Debug for ServerPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerPeer")
            .field("persistent", &self.persistent)
            .field("whitelisted", &self.whitelisted)
            .field("fee_filter", &self.fee_filter())
            .finish()
    }
}

// ============================================================================
// Handshake
// ============================================================================

impl HandshakeListener for ServerPeer {
    fn on_version(&self, peer: &Peer, msg: &MsgVersion) -> Option<MsgReject> {
        let addrman = &self.shared.addrman;
        let remote = self.source_address(peer);
        let outbound = !peer.inbound();

        // Services are refreshed before any rejection so the book stays current
        if outbound && !self.is_private() {
            addrman.set_services(&remote, msg.services);
        }

        let required = ServiceFlags::required();
        if outbound && !msg.services.contains(required) {
            let missing = required.difference(msg.services);
            log::debug!(
                "Rejecting peer {} with services {:?} due to not providing desired services {:?}",
                peer,
                msg.services,
                missing
            );
            return Some(MsgReject::new(
                cmd::VERSION,
                RejectCode::Nonstandard,
                format!("required services {:#x} not offered", missing.bits()),
            ));
        }

        if outbound && !self.is_private() {
            if !self.shared.config.disable_listen && self.shared.chain.is_current() {
                let local = addrman.get_best_local_address(&remote);
                if is_routable(&local.ip) {
                    peer.push_addr_msg(&[local]);
                }
            }
            if addrman.need_more_addresses() {
                peer.queue_message(Message::GetAddr);
            }
            addrman.good(&remote);
        }

        if msg.disable_relay_tx {
            log::debug!("Peer {} does not want transactions relayed", peer);
        }
        None
    }

    fn on_reject(&self, peer: &Peer, msg: &MsgReject) {
        log::debug!("Received reject from {}: {}", peer, msg);
    }
}

// ============================================================================
// Addresses
// ============================================================================

impl AddressListener for ServerPeer {
    fn on_get_addr(&self, peer: &Peer) {
        if self.is_private() || !peer.inbound() {
            return;
        }
        if self.addrs_sent.swap(true, Ordering::SeqCst) {
            log::trace!("Ignoring repeated getaddr from {}", peer);
            return;
        }
        let cache = self.shared.addrman.address_cache();
        peer.push_addr_msg(&cache);
    }

    fn on_addr(&self, peer: &Peer, msg: &MsgAddr) {
        if self.is_private() {
            return;
        }
        if msg.addr_list.is_empty() {
            log::error!("Command [{}] from {} does not contain any addresses", cmd::ADDR, peer);
            peer.disconnect();
            return;
        }

        let now = Utc::now().timestamp();
        let mut addresses = msg.addr_list.clone();
        for na in addresses.iter_mut() {
            if na.timestamp > now + MAX_FUTURE_ADDR_SECS {
                na.timestamp = now - FUTURE_ADDR_PENALTY_SECS;
            }
        }
        if !peer.connected() {
            return;
        }

        peer.add_known_addresses(&addresses);
        let src = self.source_address(peer);
        self.shared.addrman.add_addresses(&addresses, &src);
    }
}

// ============================================================================
// Inventory
// ============================================================================

impl InventoryListener for ServerPeer {
    fn on_inv(&self, peer: &Peer, msg: &MsgInv) {
        if msg.inv_list.is_empty() {
            return;
        }
        if self.shared.config.disable_relay_tx
            && msg.inv_list.iter().any(|iv| iv.inv_type == InvType::Tx)
        {
            log::info!("Peer {} is announcing transactions -- disconnecting", peer);
            peer.disconnect();
            return;
        }

        for iv in &msg.inv_list {
            peer.add_known_inventory(*iv);
        }
        if let Some(last_block) = msg
            .inv_list
            .iter()
            .rev()
            .find(|iv| iv.inv_type == InvType::Block)
        {
            peer.update_last_announced_block(last_block.hash);
        }
        if let Some(gs) = &msg.gs {
            peer.update_last_gs(gs.clone());
        }

        let wanted = self
            .shared
            .chain
            .queue_inventory(peer.id(), &msg.inv_list, msg.gs.as_ref());
        for chunk in wanted.chunks(MAX_INV_PER_MSG) {
            peer.queue_message(Message::GetData(MsgGetData {
                inv_list: chunk.to_vec(),
            }));
        }
    }

    fn on_get_data(&self, peer: &Peer, msg: &MsgGetData) {
        if msg.inv_list.is_empty() {
            return;
        }

        // Decaying score keeps huge bursts expensive without punishing IBD
        let transient = (msg.inv_list.len() * 99 / MAX_INV_PER_MSG) as u32;
        if self.add_ban_score(peer, 0, transient, cmd::GETDATA) {
            return;
        }

        let chain = &self.shared.chain;
        let mut responses = Vec::with_capacity(msg.inv_list.len() + 1);
        let mut not_found = Vec::new();
        for iv in &msg.inv_list {
            let found = match iv.inv_type {
                InvType::Tx => chain.fetch_transaction(&iv.hash).map(|tx| {
                    Message::Tx(MsgTx {
                        hash: iv.hash,
                        tx,
                    })
                }),
                InvType::Block | InvType::FilteredBlock => {
                    chain.fetch_block(&iv.hash).map(|block| {
                        Message::Block(MsgBlock {
                            hash: iv.hash,
                            block,
                        })
                    })
                }
            };
            match found {
                Some(message) => responses.push(message),
                None => not_found.push(*iv),
            }
        }
        if !not_found.is_empty() {
            responses.push(Message::NotFound(MsgNotFound { inv_list: not_found }));
        }

        // Large answers wait for room in the send queue instead of overflowing it
        let peer = peer.clone();
        tokio::spawn(async move {
            for message in responses {
                if peer.send_message(message).await.is_err() {
                    break;
                }
            }
        });
    }

    fn on_not_found(&self, peer: &Peer, msg: &MsgNotFound) {
        log::trace!("{} entries not found by {}", msg.inv_list.len(), peer);
    }

    fn on_block(&self, peer: &Peer, msg: &MsgBlock) {
        peer.add_known_inventory(InvVect::block(msg.hash));
        self.shared
            .chain
            .queue_block(peer.id(), msg.hash, msg.block.clone());
    }

    fn on_tx(&self, peer: &Peer, msg: &MsgTx) {
        if self.shared.config.disable_relay_tx {
            log::trace!("Ignoring tx {} from {} in blocks-only mode", msg.hash, peer);
            return;
        }
        peer.add_known_inventory(InvVect::tx(msg.hash));
        self.shared
            .chain
            .queue_transaction(peer.id(), msg.hash, msg.tx.clone());
    }

    fn on_mem_pool(&self, peer: &Peer) {
        let chain = &self.shared.chain;
        let min_fee = self.fee_filter();
        for hash in chain.mempool_hashes() {
            if min_fee > 0 {
                if let Some(fee) = chain.transaction_fee(&hash) {
                    if fee < min_fee {
                        continue;
                    }
                }
            }
            peer.queue_inventory(InvVect::tx(hash));
        }
    }

    fn on_fee_filter(&self, peer: &Peer, msg: &MsgFeeFilter) {
        if !(0..=MAX_MONEY).contains(&msg.min_fee) {
            log::debug!(
                "Peer {} sent an invalid feefilter '{}' -- disconnecting",
                peer,
                msg.min_fee
            );
            peer.disconnect();
            return;
        }
        self.fee_filter.store(msg.min_fee, Ordering::Relaxed);
    }
}

// ============================================================================
// DAG sync
// ============================================================================

impl SyncListener for ServerPeer {
    fn on_get_blocks(&self, peer: &Peer, msg: &MsgGetBlocks) {
        peer.update_last_gs(msg.gs.clone());

        let chain = &self.shared.chain;
        let hashes = if msg.block_locator.is_empty() {
            chain.locate_blocks(&msg.gs, MAX_BLOCKS_PER_MSG)
        } else {
            msg.block_locator
                .iter()
                .filter(|hash| chain.has_block(hash))
                .copied()
                .collect()
        };
        self.queue_graph_inv(peer, hashes);
    }

    fn on_get_headers(&self, peer: &Peer, msg: &MsgGetHeaders) {
        let headers = self.shared.chain.locate_headers(
            &msg.block_locator,
            &msg.hash_stop,
            MAX_BLOCK_HEADERS_PER_MSG,
        );
        peer.queue_message(Message::Headers(MsgHeaders {
            headers: headers.into_iter().map(HeaderBytes).collect(),
        }));
    }

    fn on_headers(&self, peer: &Peer, msg: &MsgHeaders) {
        let headers: Vec<Vec<u8>> = msg.headers.iter().map(|h| h.0.clone()).collect();
        self.shared.chain.queue_headers(peer.id(), &headers);
    }

    fn on_graph_state(&self, peer: &Peer, msg: &MsgGraphState) {
        peer.update_last_gs(msg.gs.clone());
    }

    fn on_sync_dag(&self, peer: &Peer, msg: &MsgSyncDag) {
        let chain = &self.shared.chain;
        let genesis = chain.genesis_hash();
        if msg.gs.is_genesis() && msg.gs.tips != [genesis] {
            self.add_ban_score(peer, 0, SERIOUS_SCORE, cmd::SYNCDAG);
            log::warn!(
                "Wrong genesis {} from peer {}, ours is {}",
                msg.gs.tips.first().map(|h| h.to_string()).unwrap_or_default(),
                peer,
                genesis
            );
            return;
        }

        peer.update_last_gs(msg.gs.clone());
        let gs = chain.graph_state();
        let (point, blocks) =
            chain.calc_sync_blocks(&msg.gs, &msg.main_locator, MAX_BLOCK_LOCATORS_PER_MSG);
        peer.queue_message(Message::SyncPoint(MsgSyncPoint {
            gs,
            sync_point: point,
        }));
        if blocks.is_empty() {
            log::trace!("No blocks to sync for {}", peer);
            return;
        }
        self.queue_graph_inv(peer, blocks);
    }

    fn on_sync_point(&self, peer: &Peer, msg: &MsgSyncPoint) {
        peer.update_last_gs(msg.gs.clone());
        if self.shared.chain.has_block(&msg.sync_point) {
            peer.update_sync_point(msg.sync_point);
        }
    }

    fn on_sync_result(&self, peer: &Peer, msg: &MsgSyncResult) {
        peer.update_last_gs(msg.gs.clone());
        if msg.mode == SyncMode::SubDag {
            let chain = &self.shared.chain;
            peer.push_sync_dag_msg(chain.graph_state(), chain.main_locator());
        }
    }
}

impl TrafficListener for ServerPeer {
    fn on_read(&self, _peer: &Peer, bytes: usize, _command: &str) {
        self.shared.add_bytes_received(bytes as u64);
    }

    fn on_write(&self, _peer: &Peer, bytes: usize, _command: &str) {
        self.shared.add_bytes_sent(bytes as u64);
    }
}

// ============================================================================
// Tests
// ============================================================================
