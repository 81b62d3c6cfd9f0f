//! Message listeners a peer session reports to
//!
//! Each category is its own trait with no-op defaults, so an owner only
//! implements what it cares about. `PeerListener` bundles them all.
//!
//! Listener methods run on the peer's input task and must not block; an
//! owner that needs to do async work should spawn it.

use crate::network::message::{
    MsgAddr, MsgBlock, MsgFeeFilter, MsgGetBlocks, MsgGetData, MsgGetHeaders, MsgGraphState,
    MsgHeaders, MsgInv, MsgNotFound, MsgReject, MsgSyncDag, MsgSyncPoint, MsgSyncResult, MsgTx,
    MsgVersion,
};
use crate::network::peer::Peer;

/// Handshake and protocol-level messages
pub trait HandshakeListener {
    /// Called with the remote `version` during negotiation. Returning a
    /// reject sends it and disconnects the peer.
    fn on_version(&self, _peer: &Peer, _msg: &MsgVersion) -> Option<MsgReject> {
        None
    }

    fn on_verack(&self, _peer: &Peer) {}

    fn on_reject(&self, _peer: &Peer, _msg: &MsgReject) {}
}

/// Address gossip
pub trait AddressListener {
    fn on_get_addr(&self, _peer: &Peer) {}

    fn on_addr(&self, _peer: &Peer, _msg: &MsgAddr) {}
}

/// Inventory, data and relay policy
pub trait InventoryListener {
    fn on_inv(&self, _peer: &Peer, _msg: &MsgInv) {}

    fn on_get_data(&self, _peer: &Peer, _msg: &MsgGetData) {}

    fn on_not_found(&self, _peer: &Peer, _msg: &MsgNotFound) {}

    fn on_block(&self, _peer: &Peer, _msg: &MsgBlock) {}

    fn on_tx(&self, _peer: &Peer, _msg: &MsgTx) {}

    fn on_mem_pool(&self, _peer: &Peer) {}

    fn on_fee_filter(&self, _peer: &Peer, _msg: &MsgFeeFilter) {}
}

/// DAG synchronisation
pub trait SyncListener {
    fn on_get_blocks(&self, _peer: &Peer, _msg: &MsgGetBlocks) {}

    fn on_get_headers(&self, _peer: &Peer, _msg: &MsgGetHeaders) {}

    fn on_headers(&self, _peer: &Peer, _msg: &MsgHeaders) {}

    fn on_graph_state(&self, _peer: &Peer, _msg: &MsgGraphState) {}

    fn on_sync_dag(&self, _peer: &Peer, _msg: &MsgSyncDag) {}

    fn on_sync_point(&self, _peer: &Peer, _msg: &MsgSyncPoint) {}

    fn on_sync_result(&self, _peer: &Peer, _msg: &MsgSyncResult) {}
}

/// Raw traffic accounting
pub trait TrafficListener {
    fn on_read(&self, _peer: &Peer, _bytes: usize, _command: &str) {}

    fn on_write(&self, _peer: &Peer, _bytes: usize, _command: &str) {}
}

/// Everything a session reports
pub trait PeerListener:
    HandshakeListener + AddressListener + InventoryListener + SyncListener + TrafficListener + Send + Sync + 'static
{
}

impl<T> PeerListener for T where
    T: HandshakeListener
        + AddressListener
        + InventoryListener
        + SyncListener
        + TrafficListener
        + Send
        + Sync
        + 'static
{
}

/// Listener that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl HandshakeListener for NoopListener {}
impl AddressListener for NoopListener {}
impl InventoryListener for NoopListener {}
impl SyncListener for NoopListener {}
impl TrafficListener for NoopListener {}
