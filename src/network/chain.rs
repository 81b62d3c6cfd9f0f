//! Narrow view of the consensus engine used by the network layer
//!
//! The network layer never validates or orders blocks. It asks a
//! `ChainView` for the current graph state and for data it already has,
//! and queues whatever it receives for validation. `MemoryChain` is a small
//! in-memory implementation backing the standalone binary and the tests.

use crate::network::message::{GraphState, Hash, InvType, InvVect};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

/// What the network layer needs from the consensus engine
pub trait ChainView: Send + Sync + 'static {
    fn graph_state(&self) -> GraphState;

    fn genesis_hash(&self) -> Hash;

    /// Whether the engine believes it is synced with the network
    fn is_current(&self) -> bool;

    fn has_block(&self, hash: &Hash) -> bool;

    fn fetch_block(&self, hash: &Hash) -> Option<Vec<u8>>;

    fn fetch_header(&self, hash: &Hash) -> Option<Vec<u8>>;

    fn fetch_transaction(&self, hash: &Hash) -> Option<Vec<u8>>;

    /// Blocks a peer at `gs` is missing, oldest first, at most `max`
    fn locate_blocks(&self, gs: &GraphState, max: usize) -> Vec<Hash>;

    /// Headers following the first known locator entry up to `hash_stop`
    fn locate_headers(&self, locator: &[Hash], hash_stop: &Hash, max: usize) -> Vec<Vec<u8>>;

    /// Sync point shared with a peer's main-chain locator plus the blocks
    /// after it, at most `max`
    fn calc_sync_blocks(&self, gs: &GraphState, main_locator: &[Hash], max: usize)
        -> (Hash, Vec<Hash>);

    /// Main-chain locator, newest first
    fn main_locator(&self) -> Vec<Hash>;

    fn mempool_hashes(&self) -> Vec<Hash>;

    /// Fee rate (per kB) of a mempool transaction, if known
    fn transaction_fee(&self, _hash: &Hash) -> Option<i64> {
        None
    }

    fn queue_block(&self, _peer_id: u32, _hash: Hash, _block: Vec<u8>) {}

    fn queue_transaction(&self, _peer_id: u32, _hash: Hash, _tx: Vec<u8>) {}

    /// Inventory announced by a peer; returns the entries worth requesting
    fn queue_inventory(
        &self,
        _peer_id: u32,
        _inv: &[InvVect],
        _gs: Option<&GraphState>,
    ) -> Vec<InvVect> {
        Vec::new()
    }

    fn queue_headers(&self, _peer_id: u32, _headers: &[Vec<u8>]) {}

    fn peer_connected(&self, _peer_id: u32, _gs: &GraphState) {}

    fn peer_disconnected(&self, _peer_id: u32) {}
}

// ============================================================================
// In-memory chain
// ============================================================================

#[derive(Debug, Clone)]
struct StoredBlock {
    block: Vec<u8>,
    header: Vec<u8>,
}

#[derive(Debug)]
struct ChainState {
    /// Main chain in order, genesis first
    main: Vec<Hash>,
    index: HashMap<Hash, usize>,
    blocks: HashMap<Hash, StoredBlock>,
    transactions: HashMap<Hash, (Vec<u8>, i64)>,
    mempool: Vec<Hash>,
    current: bool,
}

/// Linear in-memory chain; every accepted block extends the main chain
#[derive(Debug)]
pub struct MemoryChain {
    genesis: Hash,
    state: RwLock<ChainState>,
}

impl MemoryChain {
    pub fn new(genesis: Hash) -> Self {
        let mut index = HashMap::new();
        index.insert(genesis, 0);
        let mut blocks = HashMap::new();
        blocks.insert(
            genesis,
            StoredBlock {
                block: genesis.0.to_vec(),
                header: genesis.0.to_vec(),
            },
        );
        Self {
            genesis,
            state: RwLock::new(ChainState {
                main: vec![genesis],
                index,
                blocks,
                transactions: HashMap::new(),
                mempool: Vec::new(),
                current: true,
            }),
        }
    }

    /// Append a block; known blocks are ignored. Returns whether it was added.
    pub fn add_block(&self, hash: Hash, block: Vec<u8>, header: Vec<u8>) -> bool {
        let mut state = self.state.write();
        if state.index.contains_key(&hash) {
            return false;
        }
        let height = state.main.len();
        state.main.push(hash);
        state.index.insert(hash, height);
        state.blocks.insert(hash, StoredBlock { block, header });
        true
    }

    /// Put a transaction in the mempool with its fee rate
    pub fn add_transaction(&self, hash: Hash, tx: Vec<u8>, fee: i64) -> bool {
        let mut state = self.state.write();
        if state.transactions.contains_key(&hash) {
            return false;
        }
        state.transactions.insert(hash, (tx, fee));
        state.mempool.push(hash);
        true
    }

    pub fn set_current(&self, current: bool) {
        self.state.write().current = current;
    }

    pub fn height(&self) -> u64 {
        (self.state.read().main.len() - 1) as u64
    }

    fn known_height(state: &ChainState, hashes: &[Hash]) -> Option<usize> {
        hashes.iter().filter_map(|h| state.index.get(h)).max().copied()
    }
}

impl ChainView for MemoryChain {
    fn graph_state(&self) -> GraphState {
        let state = self.state.read();
        let height = (state.main.len() - 1) as u64;
        GraphState {
            tips: state.main.last().copied().into_iter().collect(),
            main_height: height,
            main_order: height,
            layer: height,
            total: state.main.len() as u64,
        }
    }

    fn genesis_hash(&self) -> Hash {
        self.genesis
    }

    fn is_current(&self) -> bool {
        self.state.read().current
    }

    fn has_block(&self, hash: &Hash) -> bool {
        self.state.read().index.contains_key(hash)
    }

    fn fetch_block(&self, hash: &Hash) -> Option<Vec<u8>> {
        self.state.read().blocks.get(hash).map(|b| b.block.clone())
    }

    fn fetch_header(&self, hash: &Hash) -> Option<Vec<u8>> {
        self.state.read().blocks.get(hash).map(|b| b.header.clone())
    }

    fn fetch_transaction(&self, hash: &Hash) -> Option<Vec<u8>> {
        self.state
            .read()
            .transactions
            .get(hash)
            .map(|(tx, _)| tx.clone())
    }

    fn locate_blocks(&self, gs: &GraphState, max: usize) -> Vec<Hash> {
        let state = self.state.read();
        let start = Self::known_height(&state, &gs.tips).unwrap_or(0) + 1;
        state.main.iter().skip(start).take(max).copied().collect()
    }

    fn locate_headers(&self, locator: &[Hash], hash_stop: &Hash, max: usize) -> Vec<Vec<u8>> {
        let state = self.state.read();
        let start = locator
            .iter()
            .find_map(|h| state.index.get(h))
            .map(|height| height + 1)
            .unwrap_or(1);

        let mut headers = Vec::new();
        for hash in state.main.iter().skip(start).take(max) {
            if let Some(stored) = state.blocks.get(hash) {
                headers.push(stored.header.clone());
            }
            if hash == hash_stop {
                break;
            }
        }
        headers
    }

    fn calc_sync_blocks(
        &self,
        _gs: &GraphState,
        main_locator: &[Hash],
        max: usize,
    ) -> (Hash, Vec<Hash>) {
        let state = self.state.read();
        let point = Self::known_height(&state, main_locator).unwrap_or(0);
        let blocks = state.main.iter().skip(point + 1).take(max).copied().collect();
        (state.main[point], blocks)
    }

    fn main_locator(&self) -> Vec<Hash> {
        let state = self.state.read();
        let mut locator = Vec::new();
        let mut step = 1usize;
        let mut height = state.main.len() as isize - 1;
        while height > 0 {
            locator.push(state.main[height as usize]);
            if locator.len() >= 10 {
                step *= 2;
            }
            height -= step as isize;
        }
        locator.push(self.genesis);
        locator
    }

    fn mempool_hashes(&self) -> Vec<Hash> {
        self.state.read().mempool.clone()
    }

    fn transaction_fee(&self, hash: &Hash) -> Option<i64> {
        self.state.read().transactions.get(hash).map(|(_, fee)| *fee)
    }

    fn queue_block(&self, _peer_id: u32, hash: Hash, block: Vec<u8>) {
        let header = hash.0.to_vec();
        self.add_block(hash, block, header);
    }

    fn queue_transaction(&self, _peer_id: u32, hash: Hash, tx: Vec<u8>) {
        self.add_transaction(hash, tx, 0);
    }

    fn queue_inventory(
        &self,
        _peer_id: u32,
        inv: &[InvVect],
        _gs: Option<&GraphState>,
    ) -> Vec<InvVect> {
        let state = self.state.read();
        let mut seen = HashSet::new();
        inv.iter()
            .filter(|iv| match iv.inv_type {
                InvType::Block | InvType::FilteredBlock => !state.index.contains_key(&iv.hash),
                InvType::Tx => !state.transactions.contains_key(&iv.hash),
            })
            .filter(|iv| seen.insert(**iv))
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(n: u8) -> Hash {
        Hash([n; 32])
    }

    fn chain_with(n: u8) -> MemoryChain {
        let chain = MemoryChain::new(h(0));
        for i in 1..=n {
            chain.add_block(h(i), vec![i], vec![i, i]);
        }
        chain
    }

    #[test]
    fn test_graph_state_tracks_tip() {
        let chain = chain_with(3);
        let gs = chain.graph_state();
        assert_eq!(gs.tips, vec![h(3)]);
        assert_eq!(gs.main_height, 3);
        assert_eq!(gs.total, 4);
        assert!(MemoryChain::new(h(0)).graph_state().is_genesis());
        assert!(!chain.add_block(h(2), vec![], vec![]));
    }

    #[test]
    fn test_locate_blocks_after_known_tip() {
        let chain = chain_with(5);
        let mut gs = GraphState::genesis(h(0));
        assert_eq!(chain.locate_blocks(&gs, 2), vec![h(1), h(2)]);

        gs.tips = vec![h(3), h(99)];
        assert_eq!(chain.locate_blocks(&gs, 10), vec![h(4), h(5)]);
    }

    #[test]
    fn test_locate_headers_stops_at_hash() {
        let chain = chain_with(5);
        let headers = chain.locate_headers(&[h(1)], &h(3), 10);
        assert_eq!(headers, vec![vec![2, 2], vec![3, 3]]);
        assert_eq!(chain.locate_headers(&[h(42)], &Hash::ZERO, 2).len(), 2);
    }

    #[test]
    fn test_sync_blocks_and_locator() {
        let chain = chain_with(4);
        let (point, blocks) = chain.calc_sync_blocks(&GraphState::default(), &[h(9), h(2)], 10);
        assert_eq!(point, h(2));
        assert_eq!(blocks, vec![h(3), h(4)]);

        let locator = chain.main_locator();
        assert_eq!(locator.first(), Some(&h(4)));
        assert_eq!(locator.last(), Some(&h(0)));
    }

    #[test]
    fn test_queue_inventory_wants_unknown() {
        let chain = chain_with(1);
        chain.add_transaction(h(50), vec![1], 10);
        let wanted = chain.queue_inventory(
            1,
            &[
                InvVect::block(h(1)),
                InvVect::block(h(7)),
                InvVect::block(h(7)),
                InvVect::tx(h(50)),
                InvVect::tx(h(51)),
            ],
            None,
        );
        assert_eq!(wanted, vec![InvVect::block(h(7)), InvVect::tx(h(51))]);
        assert_eq!(chain.transaction_fee(&h(50)), Some(10));
        assert_eq!(chain.mempool_hashes(), vec![h(50)]);
    }
}
