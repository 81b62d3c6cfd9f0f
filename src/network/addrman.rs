//! Address Manager (AddrMan) for peer discovery
//!
//! Maintains two tables of candidate peer endpoints:
//! - New addresses: heard about from other peers, never connected
//! - Tried addresses: connected to successfully at least once
//!
//! Both tables are split into buckets picked by a keyed hash of the
//! address group and the group of the peer that told us about it, so a
//! single source cannot flood the table. The book is persisted to
//! `peers.json` in the data directory.

use crate::network::knownaddress::KnownAddress;
use crate::network::message::{canonical_ip, Hash, NetAddress, ServiceFlags};
use crate::network::netgroup::{group_key, is_routable, reachability_from, Reachability};
use crate::storage::{JsonFile, StorageError};
use chrono::Utc;
use parking_lot::Mutex;
use rand::seq::{IteratorRandom, SliceRandom};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

// =============================================================================
// Constants
// =============================================================================

/// Entries per tried bucket
pub const TRIED_BUCKET_SIZE: usize = 256;

/// Number of tried buckets
pub const TRIED_BUCKET_COUNT: usize = 64;

/// Entries per new bucket
pub const NEW_BUCKET_SIZE: usize = 64;

/// Number of new buckets
pub const NEW_BUCKET_COUNT: usize = 1024;

/// Tried buckets a single address group may spread over
pub const TRIED_BUCKETS_PER_GROUP: u64 = 8;

/// New buckets a single source group may spread over
pub const NEW_BUCKETS_PER_GROUP: u64 = 64;

/// New buckets a single address may be referenced from
pub const NEW_BUCKETS_PER_ADDRESS: usize = 8;

/// Most addresses returned from `address_cache`
pub const GET_ADDR_MAX: usize = 2500;

/// Percentage of the book returned from `address_cache`
pub const GET_ADDR_PERCENT: usize = 23;

/// Below this many known addresses we keep asking peers for more
pub const NEED_ADDRESS_THRESHOLD: usize = 1000;

/// How often the book is written to disk
pub const DUMP_ADDRESS_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Format version of `peers.json`
pub const SERIALISATION_VERSION: u32 = 1;

/// Name of the persisted address book
pub const PEERS_FILENAME: &str = "peers.json";

/// `connected` only refreshes timestamps older than this
const CONNECTED_REFRESH_SECS: i64 = 20 * 60;

// =============================================================================
// Errors and helpers
// =============================================================================

/// Address book errors
#[derive(Error, Debug)]
pub enum AddrError {
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Unknown peers file version {0}")]
    UnknownVersion(u32),

    #[error("Inconsistent address book: {0}")]
    Inconsistent(String),

    #[error("Invalid address {0}: {1}")]
    InvalidAddress(String, String),

    #[error("Address {0} is not routable")]
    Unroutable(String),

    #[error("Lookup of {0} failed: {1}")]
    LookupFailed(String, String),
}

/// Resolves a host name to IP addresses
pub type LookupFn = Arc<dyn Fn(&str) -> std::io::Result<Vec<IpAddr>> + Send + Sync>;

/// Lookup through the system resolver
pub fn system_lookup() -> LookupFn {
    Arc::new(|host: &str| {
        let addrs = (host, 0u16).to_socket_addrs()?;
        Ok(addrs.map(|a| a.ip()).collect())
    })
}

/// Where a local address came from; later variants are preferred
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AddressPriority {
    /// Found on a local interface
    Interface = 0,
    /// Address we are bound to
    Bound = 1,
    /// Learned from UPnP
    Upnp = 2,
    /// Obtained over HTTP
    Http = 3,
    /// Configured by the operator
    Manual = 4,
}

#[derive(Debug, Clone)]
struct LocalAddress {
    na: NetAddress,
    score: i32,
}

// =============================================================================
// Serialized form
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct SerializedKnownAddress {
    addr: String,
    src: String,
    attempts: u32,
    timestamp: i64,
    last_attempt: i64,
    last_success: i64,
    services: ServiceFlags,
    src_services: ServiceFlags,
}

#[derive(Debug, Serialize, Deserialize)]
struct SerializedAddrBook {
    version: u32,
    key: String,
    addresses: Vec<SerializedKnownAddress>,
    new_buckets: Vec<Vec<String>>,
    tried_buckets: Vec<Vec<String>>,
}

// =============================================================================
// Book state
// =============================================================================

/// State guarded by the manager's lock
struct AddrBook {
    key: [u8; 32],
    index: HashMap<String, KnownAddress>,
    addr_new: Vec<HashSet<String>>,
    addr_tried: Vec<Vec<String>>,
    n_new: usize,
    n_tried: usize,
    local_addresses: HashMap<String, LocalAddress>,
    changed: bool,
}

impl AddrBook {
    fn new() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill(&mut key);
        Self {
            key,
            index: HashMap::new(),
            addr_new: vec![HashSet::new(); NEW_BUCKET_COUNT],
            addr_tried: vec![Vec::new(); TRIED_BUCKET_COUNT],
            n_new: 0,
            n_tried: 0,
            local_addresses: HashMap::new(),
            changed: false,
        }
    }

    /// Drop every address; local addresses survive
    fn reset(&mut self) {
        let locals = std::mem::take(&mut self.local_addresses);
        *self = AddrBook::new();
        self.local_addresses = locals;
    }

    fn keyed_hash(&self, parts: &[&[u8]]) -> u64 {
        let mut data = Vec::with_capacity(32 + parts.iter().map(|p| p.len()).sum::<usize>());
        data.extend_from_slice(&self.key);
        for part in parts {
            data.extend_from_slice(part);
        }
        let hash = Hash::double_sha256(&data);
        let mut first = [0u8; 8];
        first.copy_from_slice(&hash.0[..8]);
        u64::from_le_bytes(first)
    }

    fn new_bucket(&self, na: &NetAddress, src: &NetAddress) -> usize {
        let addr_group = group_key(&na.ip);
        let src_group = group_key(&src.ip);
        let h1 = self.keyed_hash(&[addr_group.as_bytes(), src_group.as_bytes()])
            % NEW_BUCKETS_PER_GROUP;
        let h2 = self.keyed_hash(&[src_group.as_bytes(), &h1.to_le_bytes()]);
        (h2 % NEW_BUCKET_COUNT as u64) as usize
    }

    fn tried_bucket(&self, na: &NetAddress) -> usize {
        let h1 = self.keyed_hash(&[na.key().as_bytes()]) % TRIED_BUCKETS_PER_GROUP;
        let h2 = self.keyed_hash(&[group_key(&na.ip).as_bytes(), &h1.to_le_bytes()]);
        (h2 % TRIED_BUCKET_COUNT as u64) as usize
    }

    fn update_address(&mut self, na: &NetAddress, src: &NetAddress, now: i64) {
        if !is_routable(&na.ip) {
            return;
        }

        let key = na.key();
        match self.index.get_mut(&key) {
            Some(ka) => {
                if na.timestamp > ka.na.timestamp || !ka.na.services.contains(na.services) {
                    let mut updated = ka.na.clone();
                    updated.timestamp = updated.timestamp.max(na.timestamp);
                    updated.services |= na.services;
                    ka.na = updated;
                    self.changed = true;
                }

                if ka.tried || ka.refs >= NEW_BUCKETS_PER_ADDRESS {
                    return;
                }

                // The more buckets an address is already in, the less likely
                // it is to be added to another one.
                let factor = (2 * ka.refs).max(1);
                if rand::thread_rng().gen_range(0..factor) != 0 {
                    return;
                }
            }
            None => {
                self.index
                    .insert(key.clone(), KnownAddress::new(na.clone(), src.clone()));
                self.n_new += 1;
            }
        }

        let bucket = self.new_bucket(na, src);
        if self.addr_new[bucket].contains(&key) {
            return;
        }

        if self.addr_new[bucket].len() >= NEW_BUCKET_SIZE {
            log::trace!("New bucket {} is full, expiring old entries", bucket);
            self.expire_new(bucket, now);
        }

        if let Some(ka) = self.index.get_mut(&key) {
            ka.refs += 1;
        }
        self.addr_new[bucket].insert(key.clone());
        self.changed = true;

        log::trace!(
            "Added new address {} for a total of {} addresses",
            key,
            self.n_tried + self.n_new
        );
    }

    /// Drop one reference to `key` held by new bucket `bucket`
    fn remove_from_new_bucket(&mut self, bucket: usize, key: &str) {
        if !self.addr_new[bucket].remove(key) {
            return;
        }
        let orphaned = match self.index.get_mut(key) {
            Some(ka) => {
                ka.refs = ka.refs.saturating_sub(1);
                ka.refs == 0
            }
            None => false,
        };
        if orphaned {
            self.n_new -= 1;
            self.index.remove(key);
        }
        self.changed = true;
    }

    /// Make room in a new bucket: drop every bad entry, and if the bucket is
    /// still full drop the entry with the oldest timestamp.
    fn expire_new(&mut self, bucket: usize, now: i64) {
        let keys: Vec<String> = self.addr_new[bucket].iter().cloned().collect();
        let mut oldest: Option<(String, i64)> = None;

        for key in keys {
            let (bad, timestamp) = match self.index.get(&key) {
                Some(ka) => (ka.is_bad(now), ka.na.timestamp),
                None => {
                    self.addr_new[bucket].remove(&key);
                    continue;
                }
            };

            if bad {
                log::trace!("Expiring bad address {}", key);
                self.remove_from_new_bucket(bucket, &key);
                continue;
            }

            let older = match &oldest {
                Some((_, ts)) => timestamp < *ts,
                None => true,
            };
            if older {
                oldest = Some((key, timestamp));
            }
        }

        if self.addr_new[bucket].len() >= NEW_BUCKET_SIZE {
            if let Some((key, _)) = oldest {
                log::trace!("Expiring oldest address {}", key);
                self.remove_from_new_bucket(bucket, &key);
            }
        }
    }

    /// Position and key of the oldest entry in a tried bucket
    fn pick_tried(&self, bucket: usize) -> Option<(usize, String)> {
        self.addr_tried[bucket]
            .iter()
            .enumerate()
            .filter_map(|(pos, key)| self.index.get(key).map(|ka| (pos, key, ka.na.timestamp)))
            .min_by_key(|(_, _, ts)| *ts)
            .map(|(pos, key, _)| (pos, key.clone()))
    }

    fn good(&mut self, na: &NetAddress, now: i64) {
        let key = na.key();
        match self.index.get_mut(&key) {
            Some(ka) => {
                ka.last_success = now;
                ka.last_attempt = now;
                ka.attempts = 0;
                self.changed = true;
                if ka.tried {
                    return;
                }
            }
            None => return,
        }

        // Pull the address out of every new bucket it was referenced from,
        // remembering the first one so an evicted entry has somewhere to go.
        let mut old_bucket = None;
        for (i, bucket) in self.addr_new.iter_mut().enumerate() {
            if bucket.remove(&key) && old_bucket.is_none() {
                old_bucket = Some(i);
            }
        }
        let Some(old_bucket) = old_bucket else {
            log::warn!("Address {} is new but not in any new bucket", key);
            return;
        };

        let promoted_na = match self.index.get_mut(&key) {
            Some(ka) => {
                ka.refs = 0;
                ka.na.clone()
            }
            None => return,
        };
        self.n_new -= 1;

        let tried_bucket = self.tried_bucket(&promoted_na);
        if self.addr_tried[tried_bucket].len() < TRIED_BUCKET_SIZE {
            if let Some(ka) = self.index.get_mut(&key) {
                ka.tried = true;
            }
            self.addr_tried[tried_bucket].push(key);
            self.n_tried += 1;
            return;
        }

        // Tried bucket is full: swap out its oldest entry
        let Some((pos, evicted_key)) = self.pick_tried(tried_bucket) else {
            return;
        };
        let (evicted_na, evicted_src) = match self.index.get(&evicted_key) {
            Some(ka) => (ka.na.clone(), ka.src.clone()),
            None => return,
        };

        let mut target = self.new_bucket(&evicted_na, &evicted_src);
        if self.addr_new[target].len() >= NEW_BUCKET_SIZE {
            target = old_bucket;
        }
        if self.addr_new[target].len() >= NEW_BUCKET_SIZE {
            self.expire_new(target, now);
        }

        log::trace!(
            "Replacing {} with {} in tried bucket {}",
            evicted_key,
            key,
            tried_bucket
        );

        self.addr_tried[tried_bucket][pos] = key.clone();
        if let Some(ka) = self.index.get_mut(&key) {
            ka.tried = true;
        }
        if let Some(ka) = self.index.get_mut(&evicted_key) {
            ka.tried = false;
            ka.refs = 1;
        }
        self.addr_new[target].insert(evicted_key);
        self.n_new += 1;
    }

    fn get_address(&self, now: i64) -> Option<KnownAddress> {
        if self.n_tried + self.n_new == 0 {
            return None;
        }

        let mut rng = rand::thread_rng();
        let use_tried = self.n_tried > 0 && (self.n_new == 0 || rng.gen_bool(0.5));

        let candidates: Vec<usize> = if use_tried {
            (0..TRIED_BUCKET_COUNT)
                .filter(|b| !self.addr_tried[*b].is_empty())
                .collect()
        } else {
            (0..NEW_BUCKET_COUNT)
                .filter(|b| !self.addr_new[*b].is_empty())
                .collect()
        };
        if candidates.is_empty() {
            return None;
        }

        let mut factor = 1.0f64;
        loop {
            let bucket = *candidates.choose(&mut rng)?;
            let key = if use_tried {
                self.addr_tried[bucket].choose(&mut rng)?
            } else {
                self.addr_new[bucket].iter().choose(&mut rng)?
            };
            let ka = self.index.get(key)?;
            if rng.gen::<f64>() < factor * ka.chance(now) {
                log::trace!(
                    "Selected {} from {} table",
                    key,
                    if use_tried { "tried" } else { "new" }
                );
                return Some(ka.clone());
            }
            factor *= 1.2;
        }
    }

    fn check_consistency(&self) -> Result<(), AddrError> {
        let mut new_refs: HashMap<&str, usize> = HashMap::new();
        for (i, bucket) in self.addr_new.iter().enumerate() {
            if bucket.len() > NEW_BUCKET_SIZE {
                return Err(AddrError::Inconsistent(format!(
                    "new bucket {} holds {} entries",
                    i,
                    bucket.len()
                )));
            }
            for key in bucket {
                match self.index.get(key) {
                    Some(ka) if !ka.tried => *new_refs.entry(key.as_str()).or_default() += 1,
                    Some(_) => {
                        return Err(AddrError::Inconsistent(format!(
                            "tried address {} in new bucket {}",
                            key, i
                        )))
                    }
                    None => {
                        return Err(AddrError::Inconsistent(format!(
                            "new bucket {} references unknown {}",
                            i, key
                        )))
                    }
                }
            }
        }

        let mut tried_seen: HashSet<&str> = HashSet::new();
        for (i, bucket) in self.addr_tried.iter().enumerate() {
            if bucket.len() > TRIED_BUCKET_SIZE {
                return Err(AddrError::Inconsistent(format!(
                    "tried bucket {} holds {} entries",
                    i,
                    bucket.len()
                )));
            }
            for key in bucket {
                match self.index.get(key) {
                    Some(ka) if ka.tried => {
                        if !tried_seen.insert(key.as_str()) {
                            return Err(AddrError::Inconsistent(format!(
                                "address {} in more than one tried slot",
                                key
                            )));
                        }
                    }
                    _ => {
                        return Err(AddrError::Inconsistent(format!(
                            "tried bucket {} references {} which is not tried",
                            i, key
                        )))
                    }
                }
            }
        }

        let mut n_new = 0;
        let mut n_tried = 0;
        for (key, ka) in &self.index {
            if ka.tried {
                n_tried += 1;
                if ka.refs != 0 || !tried_seen.contains(key.as_str()) {
                    return Err(AddrError::Inconsistent(format!(
                        "tried address {} has refs {} or no tried slot",
                        key, ka.refs
                    )));
                }
            } else {
                n_new += 1;
                let counted = new_refs.get(key.as_str()).copied().unwrap_or(0);
                if ka.refs == 0 || ka.refs != counted || ka.refs > NEW_BUCKETS_PER_ADDRESS {
                    return Err(AddrError::Inconsistent(format!(
                        "new address {} has refs {} but {} bucket references",
                        key, ka.refs, counted
                    )));
                }
            }
        }

        if n_new != self.n_new || n_tried != self.n_tried {
            return Err(AddrError::Inconsistent(format!(
                "counted {} new / {} tried, book says {} / {}",
                n_new, n_tried, self.n_new, self.n_tried
            )));
        }
        Ok(())
    }

    fn serialize(&self) -> SerializedAddrBook {
        let addresses = self
            .index
            .iter()
            .map(|(key, ka)| SerializedKnownAddress {
                addr: key.clone(),
                src: ka.src.key(),
                attempts: ka.attempts,
                timestamp: ka.na.timestamp,
                last_attempt: ka.last_attempt,
                last_success: ka.last_success,
                services: ka.na.services,
                src_services: ka.src.services,
            })
            .collect();

        SerializedAddrBook {
            version: SERIALISATION_VERSION,
            key: hex::encode(self.key),
            addresses,
            new_buckets: self
                .addr_new
                .iter()
                .map(|b| b.iter().cloned().collect())
                .collect(),
            tried_buckets: self.addr_tried.clone(),
        }
    }

    fn deserialize(&mut self, sam: SerializedAddrBook) -> Result<(), AddrError> {
        if sam.version != SERIALISATION_VERSION {
            return Err(AddrError::UnknownVersion(sam.version));
        }
        hex::decode_to_slice(&sam.key, &mut self.key)
            .map_err(|e| AddrError::Inconsistent(format!("bad key: {}", e)))?;

        if sam.new_buckets.len() != NEW_BUCKET_COUNT || sam.tried_buckets.len() != TRIED_BUCKET_COUNT
        {
            return Err(AddrError::Inconsistent(format!(
                "expected {} new and {} tried buckets, found {} and {}",
                NEW_BUCKET_COUNT,
                TRIED_BUCKET_COUNT,
                sam.new_buckets.len(),
                sam.tried_buckets.len()
            )));
        }

        for v in &sam.addresses {
            let na = parse_socket_addr(&v.addr, v.services, v.timestamp)?;
            let src = parse_socket_addr(&v.src, v.src_services, 0)?;
            let mut ka = KnownAddress::new(na, src);
            ka.attempts = v.attempts;
            ka.last_attempt = v.last_attempt;
            ka.last_success = v.last_success;
            self.index.insert(ka.na.key(), ka);
        }

        for (i, bucket) in sam.new_buckets.into_iter().enumerate() {
            for key in bucket {
                let ka = self.index.get_mut(&key).ok_or_else(|| {
                    AddrError::Inconsistent(format!(
                        "new bucket {} contains {} but it is not in the address list",
                        i, key
                    ))
                })?;
                if ka.refs == 0 {
                    self.n_new += 1;
                }
                ka.refs += 1;
                self.addr_new[i].insert(key);
            }
        }

        for (i, bucket) in sam.tried_buckets.into_iter().enumerate() {
            for key in bucket {
                let ka = self.index.get_mut(&key).ok_or_else(|| {
                    AddrError::Inconsistent(format!(
                        "tried bucket {} contains {} but it is not in the address list",
                        i, key
                    ))
                })?;
                ka.tried = true;
                self.n_tried += 1;
                self.addr_tried[i].push(key);
            }
        }

        for (key, ka) in &self.index {
            if ka.refs == 0 && !ka.tried {
                return Err(AddrError::Inconsistent(format!(
                    "address {} after serialisation with no references",
                    key
                )));
            }
            if ka.refs > 0 && ka.tried {
                return Err(AddrError::Inconsistent(format!(
                    "address {} after serialisation which is both new and tried",
                    key
                )));
            }
        }

        self.check_consistency()
    }
}

fn parse_socket_addr(s: &str, services: ServiceFlags, timestamp: i64) -> Result<NetAddress, AddrError> {
    let addr: SocketAddr = s
        .parse()
        .map_err(|e: std::net::AddrParseError| AddrError::InvalidAddress(s.to_string(), e.to_string()))?;
    Ok(NetAddress::with_timestamp(addr.ip(), addr.port(), services, timestamp))
}

// =============================================================================
// Address Manager
// =============================================================================

/// Concurrency-safe address book.
///
/// Every operation takes the single internal lock for its full duration.
pub struct AddrManager {
    book: Mutex<AddrBook>,
    file: JsonFile,
    get_addr_percent: usize,
    lookup: LookupFn,
    quit: watch::Sender<bool>,
    saver: Mutex<Option<JoinHandle<()>>>,
}

impl AddrManager {
    /// Create an empty book persisted under `data_dir`.
    ///
    /// A `get_addr_percent` of 0 selects the default of 23%. Without a
    /// `lookup` function host names go through the system resolver.
    pub fn new(data_dir: &Path, get_addr_percent: usize, lookup: Option<LookupFn>) -> Self {
        let (quit, _) = watch::channel(false);
        Self {
            book: Mutex::new(AddrBook::new()),
            file: JsonFile::new(data_dir, PEERS_FILENAME),
            get_addr_percent: if get_addr_percent == 0 {
                GET_ADDR_PERCENT
            } else {
                get_addr_percent
            },
            lookup: lookup.unwrap_or_else(system_lookup),
            quit,
            saver: Mutex::new(None),
        }
    }

    /// Load the persisted book and start saving it periodically
    pub fn start(self: &Arc<Self>) {
        let mut saver = self.saver.lock();
        if saver.is_some() {
            return;
        }

        log::trace!("Starting address manager");
        self.load_peers();

        let manager = Arc::clone(self);
        let mut quit = self.quit.subscribe();
        *saver = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DUMP_ADDRESS_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.save_and_log(),
                    _ = quit.changed() => break,
                }
            }
            manager.save_and_log();
            log::trace!("Address handler done");
        }));
    }

    /// Stop the periodic saver and write the book one last time
    pub async fn stop(&self) {
        let handle = self.saver.lock().take();
        match handle {
            Some(handle) => {
                self.quit.send_replace(true);
                if let Err(e) = handle.await {
                    log::warn!("Address handler task failed: {}", e);
                }
            }
            None => self.save_and_log(),
        }
    }

    fn save_and_log(&self) {
        if let Err(e) = self.save_peers() {
            log::error!("Failed to save peers file {}: {}", self.file.path().display(), e);
        }
    }

    /// Write the book to disk if it changed since the last save
    pub fn save_peers(&self) -> Result<(), AddrError> {
        let snapshot = {
            let mut book = self.book.lock();
            if !book.changed {
                return Ok(());
            }
            book.changed = false;
            book.serialize()
        };

        if let Err(e) = self.file.save(&snapshot) {
            self.book.lock().changed = true;
            return Err(e.into());
        }
        log::trace!("Saved {} addresses", snapshot.addresses.len());
        Ok(())
    }

    /// Load the book from disk, starting fresh if the file is unusable
    pub fn load_peers(&self) {
        let mut book = self.book.lock();
        match self.deserialize_peers(&mut book) {
            Ok(()) => log::info!(
                "Loaded {} addresses from file '{}'",
                book.n_new + book.n_tried,
                self.file.path().display()
            ),
            Err(e) => {
                log::error!(
                    "Failed to parse file {}: {}",
                    self.file.path().display(),
                    e
                );
                if let Err(e) = self.file.delete() {
                    log::warn!(
                        "Failed to remove corrupt peers file {}: {}",
                        self.file.path().display(),
                        e
                    );
                }
                book.reset();
            }
        }
    }

    fn deserialize_peers(&self, book: &mut AddrBook) -> Result<(), AddrError> {
        let Some(sam) = self.file.load::<SerializedAddrBook>()? else {
            return Ok(());
        };
        book.reset();
        book.deserialize(sam)
    }

    /// Add one address learned from `src`
    pub fn add_address(&self, na: &NetAddress, src: &NetAddress) {
        let now = Utc::now().timestamp();
        self.book.lock().update_address(na, src, now);
    }

    /// Add a batch of addresses learned from `src`
    pub fn add_addresses(&self, list: &[NetAddress], src: &NetAddress) {
        let now = Utc::now().timestamp();
        let mut book = self.book.lock();
        for na in list {
            book.update_address(na, src, now);
        }
    }

    /// Add an `ip:port` string; the address is its own source
    pub fn add_address_by_ip(&self, addr: &str) -> Result<(), AddrError> {
        let na = self.deserialize_net_address(addr, ServiceFlags::NODE_NETWORK)?;
        self.add_address(&na, &na);
        Ok(())
    }

    pub fn num_addresses(&self) -> usize {
        let book = self.book.lock();
        book.n_new + book.n_tried
    }

    pub fn new_count(&self) -> usize {
        self.book.lock().n_new
    }

    pub fn tried_count(&self) -> usize {
        self.book.lock().n_tried
    }

    pub fn need_more_addresses(&self) -> bool {
        self.num_addresses() < NEED_ADDRESS_THRESHOLD
    }

    /// Random sample of good addresses for answering `getaddr`
    pub fn address_cache(&self) -> Vec<NetAddress> {
        let now = Utc::now().timestamp();
        let book = self.book.lock();

        let mut all: Vec<NetAddress> = book
            .index
            .values()
            .filter(|ka| ka.last_success != 0 && !ka.is_bad(now))
            .map(|ka| ka.na.clone())
            .collect();

        let num = if all.len() <= 5 {
            all.len()
        } else {
            (all.len() * self.get_addr_percent / 100).min(GET_ADDR_MAX)
        };

        let (picked, _) = all.partial_shuffle(&mut rand::thread_rng(), num);
        picked.to_vec()
    }

    /// Pick an address to dial, biased toward good entries
    pub fn get_address(&self) -> Option<KnownAddress> {
        let now = Utc::now().timestamp();
        self.book.lock().get_address(now)
    }

    /// Snapshot of every known address
    pub fn known_addresses(&self) -> Vec<KnownAddress> {
        self.book.lock().index.values().cloned().collect()
    }

    /// Record a connection attempt
    pub fn attempt(&self, na: &NetAddress) {
        let now = Utc::now().timestamp();
        let mut book = self.book.lock();
        if let Some(ka) = book.index.get_mut(&na.key()) {
            ka.attempts += 1;
            ka.last_attempt = now;
            book.changed = true;
        }
    }

    /// Mark an address as currently connected; refreshes a stale timestamp
    pub fn connected(&self, na: &NetAddress) {
        let now = Utc::now().timestamp();
        let mut book = self.book.lock();
        if let Some(ka) = book.index.get_mut(&na.key()) {
            if now - ka.na.timestamp > CONNECTED_REFRESH_SECS {
                let mut updated = ka.na.clone();
                updated.timestamp = now;
                ka.na = updated;
                book.changed = true;
            }
        }
    }

    /// Mark an address as good: reset failures and move it to the tried table
    pub fn good(&self, na: &NetAddress) {
        let now = Utc::now().timestamp();
        self.book.lock().good(na, now);
    }

    /// Replace the advertised services of a known address
    pub fn set_services(&self, na: &NetAddress, services: ServiceFlags) {
        let mut book = self.book.lock();
        if let Some(ka) = book.index.get_mut(&na.key()) {
            if ka.na.services != services {
                let mut updated = ka.na.clone();
                updated.services = services;
                ka.na = updated;
                book.changed = true;
            }
        }
    }

    /// Verify the new/tried partition; used after loading and in tests
    pub fn check_consistency(&self) -> Result<(), AddrError> {
        self.book.lock().check_consistency()
    }

    /// Register an address of our own to advertise to peers
    pub fn add_local_address(
        &self,
        na: &NetAddress,
        priority: AddressPriority,
    ) -> Result<(), AddrError> {
        if !is_routable(&na.ip) {
            return Err(AddrError::Unroutable(na.to_string()));
        }

        let priority = priority as i32;
        let mut book = self.book.lock();
        let key = na.key();
        match book.local_addresses.get_mut(&key) {
            Some(la) if la.score < priority => la.score = priority + 1,
            Some(_) => {}
            None => {
                book.local_addresses.insert(
                    key,
                    LocalAddress {
                        na: na.clone(),
                        score: priority,
                    },
                );
            }
        }
        Ok(())
    }

    pub fn has_local_address(&self, na: &NetAddress) -> bool {
        self.book.lock().local_addresses.contains_key(&na.key())
    }

    pub fn local_addresses(&self) -> Vec<NetAddress> {
        self.book
            .lock()
            .local_addresses
            .values()
            .map(|la| la.na.clone())
            .collect()
    }

    /// The local address most reachable from `remote`, or an unroutable
    /// placeholder of the same family when none is usable
    pub fn get_best_local_address(&self, remote: &NetAddress) -> NetAddress {
        let book = self.book.lock();
        let mut best: Option<(Reachability, i32, &NetAddress)> = None;
        for la in book.local_addresses.values() {
            let reach = reachability_from(&la.na.ip, &remote.ip);
            let better = match &best {
                Some((r, s, _)) => reach > *r || (reach == *r && la.score > *s),
                None => true,
            };
            if better {
                best = Some((reach, la.score, &la.na));
            }
        }

        match best {
            Some((reach, _, na)) if reach > Reachability::Unreachable => {
                log::debug!("Suggesting address {} for {}", na, remote);
                na.clone()
            }
            _ => {
                let ip = match remote.ip {
                    IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                    IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                };
                NetAddress::new(ip, 0, ServiceFlags::NODE_NETWORK)
            }
        }
    }

    /// Build a `NetAddress` from an IP literal or a host name
    pub fn host_to_net_address(
        &self,
        host: &str,
        port: u16,
        services: ServiceFlags,
    ) -> Result<NetAddress, AddrError> {
        let trimmed = host.trim_start_matches('[').trim_end_matches(']');
        let ip = match trimmed.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => {
                let ips = (self.lookup)(host)
                    .map_err(|e| AddrError::LookupFailed(host.to_string(), e.to_string()))?;
                *ips.first().ok_or_else(|| {
                    AddrError::LookupFailed(host.to_string(), "no addresses".to_string())
                })?
            }
        };
        Ok(NetAddress::new(canonical_ip(ip), port, services))
    }

    /// Parse `host:port` into a `NetAddress`
    pub fn deserialize_net_address(
        &self,
        addr: &str,
        services: ServiceFlags,
    ) -> Result<NetAddress, AddrError> {
        if let Ok(sa) = addr.parse::<SocketAddr>() {
            return Ok(NetAddress::from_socket_addr(sa, services));
        }
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| AddrError::InvalidAddress(addr.to_string(), "missing port".into()))?;
        let port: u16 = port
            .parse()
            .map_err(|e: std::num::ParseIntError| {
                AddrError::InvalidAddress(addr.to_string(), e.to_string())
            })?;
        self.host_to_net_address(host, port, services)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn addr(s: &str) -> NetAddress {
        let sa: SocketAddr = s.parse().unwrap();
        NetAddress::from_socket_addr(sa, ServiceFlags::NODE_NETWORK)
    }

    fn no_lookup() -> Option<LookupFn> {
        Some(Arc::new(|host: &str| {
            Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no lookup for {}", host),
            ))
        }))
    }

    #[test]
    fn test_new_book_is_empty() {
        let dir = tempdir().unwrap();
        let am = AddrManager::new(dir.path(), 0, no_lookup());
        am.load_peers();
        assert_eq!(am.num_addresses(), 0);
        assert!(am.get_address().is_none());
        assert!(am.need_more_addresses());
        assert!(am.address_cache().is_empty());
    }

    #[test]
    fn test_unroutable_addresses_are_dropped() {
        let dir = tempdir().unwrap();
        let am = AddrManager::new(dir.path(), 0, no_lookup());
        let src = addr("9.9.9.9:8130");

        am.add_address(&addr("8.8.8.8:8130"), &src);
        am.add_address(&addr("192.168.0.1:8130"), &src);

        assert_eq!(am.num_addresses(), 1);
        assert_eq!(am.new_count(), 1);
        assert_eq!(am.tried_count(), 0);
        am.check_consistency().unwrap();
    }

    #[test]
    fn test_good_promotes_and_is_idempotent() {
        let dir = tempdir().unwrap();
        let am = AddrManager::new(dir.path(), 0, no_lookup());
        let na = addr("8.8.8.8:8130");
        am.add_address(&na, &addr("9.9.9.9:8130"));

        am.attempt(&na);
        am.good(&na);
        assert_eq!(am.tried_count(), 1);
        assert_eq!(am.new_count(), 0);
        am.check_consistency().unwrap();

        am.good(&na);
        assert_eq!(am.tried_count(), 1);
        assert_eq!(am.new_count(), 0);
        assert_eq!(am.num_addresses(), 1);
        am.check_consistency().unwrap();

        let ka = am.get_address().unwrap();
        assert!(ka.tried);
        assert_eq!(ka.attempts, 0);
        assert!(ka.last_success > 0);
    }

    #[test]
    fn test_good_on_unknown_address_is_ignored() {
        let dir = tempdir().unwrap();
        let am = AddrManager::new(dir.path(), 0, no_lookup());
        am.good(&addr("8.8.8.8:8130"));
        assert_eq!(am.num_addresses(), 0);
    }

    #[test]
    fn test_attempt_and_connected() {
        let dir = tempdir().unwrap();
        let am = AddrManager::new(dir.path(), 0, no_lookup());
        let mut na = addr("8.8.8.8:8130");
        na.timestamp -= 3600;
        am.add_address(&na, &na);

        am.attempt(&na);
        am.attempt(&na);
        am.connected(&na);

        let ka = am.known_addresses().pop().unwrap();
        assert_eq!(ka.attempts, 2);
        assert!(ka.last_attempt > 0);
        assert!(ka.na.timestamp > na.timestamp);
    }

    #[test]
    fn test_set_services() {
        let dir = tempdir().unwrap();
        let am = AddrManager::new(dir.path(), 0, no_lookup());
        let na = addr("8.8.8.8:8130");
        am.add_address(&na, &na);
        am.set_services(&na, ServiceFlags::NODE_NETWORK | ServiceFlags::NODE_BLOOM);
        let ka = am.known_addresses().pop().unwrap();
        assert!(ka.na.services.contains(ServiceFlags::NODE_BLOOM));
    }

    #[test]
    fn test_address_cache_only_returns_successful() {
        let dir = tempdir().unwrap();
        let am = AddrManager::new(dir.path(), 0, no_lookup());
        let src = addr("9.9.9.9:8130");
        for i in 1..=20 {
            am.add_address(&addr(&format!("8.{}.1.1:8130", i)), &src);
        }
        assert!(am.address_cache().is_empty());

        for i in 1..=3 {
            am.good(&addr(&format!("8.{}.1.1:8130", i)));
        }
        let cache = am.address_cache();
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_full_new_bucket_expires_entries() {
        let dir = tempdir().unwrap();
        let am = AddrManager::new(dir.path(), 0, no_lookup());
        // Same address group and same source land in one new bucket
        let src = addr("9.9.9.9:8130");
        for i in 0..(NEW_BUCKET_SIZE * 2) {
            am.add_address(&addr(&format!("8.8.{}.{}:8130", i / 200, i % 200 + 1)), &src);
        }
        assert_eq!(am.num_addresses(), NEW_BUCKET_SIZE);
        am.check_consistency().unwrap();
    }

    #[test]
    fn test_tried_eviction_keeps_addresses() {
        let dir = tempdir().unwrap();
        let am = AddrManager::new(dir.path(), 0, no_lookup());
        let total = 600;
        let mut added = Vec::new();
        for i in 0..total {
            let na = addr(&format!("8.8.{}.{}:8130", i / 250, i % 250 + 1));
            let src = addr(&format!("9.{}.1.1:8130", i % 250));
            am.add_address(&na, &src);
            added.push(na);
        }
        assert_eq!(am.num_addresses(), total);

        for na in &added {
            am.good(na);
        }

        am.check_consistency().unwrap();
        assert_eq!(am.num_addresses(), total);
        // One address group spreads over at most eight tried buckets
        assert!(am.tried_count() <= TRIED_BUCKETS_PER_GROUP as usize * TRIED_BUCKET_SIZE);
        assert!(am.tried_count() > 0);
        assert_eq!(am.tried_count() + am.new_count(), total);
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempdir().unwrap();
        let am = AddrManager::new(dir.path(), 0, no_lookup());
        let src = addr("9.9.9.9:8130");
        for i in 1..=30 {
            am.add_address(&addr(&format!("8.{}.2.2:8130", i)), &src);
        }
        for i in 1..=10 {
            am.good(&addr(&format!("8.{}.2.2:8130", i)));
        }
        am.save_peers().unwrap();
        assert!(dir.path().join(PEERS_FILENAME).exists());

        let restored = AddrManager::new(dir.path(), 0, no_lookup());
        restored.load_peers();
        assert_eq!(restored.num_addresses(), am.num_addresses());
        assert_eq!(restored.tried_count(), 10);
        assert_eq!(restored.new_count(), 20);
        restored.check_consistency().unwrap();

        let mut before: Vec<String> = am.known_addresses().iter().map(|k| k.na.key()).collect();
        let mut after: Vec<String> =
            restored.known_addresses().iter().map(|k| k.na.key()).collect();
        before.sort();
        after.sort();
        assert_eq!(before, after);
    }

    #[test]
    fn test_corrupt_peers_file_resets() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(PEERS_FILENAME);
        fs::write(&path, b"this is not json").unwrap();

        let am = AddrManager::new(dir.path(), 0, no_lookup());
        am.load_peers();
        assert_eq!(am.num_addresses(), 0);
        assert!(!path.exists());
    }

    #[test]
    fn test_wrong_version_resets() {
        let dir = tempdir().unwrap();
        let am = AddrManager::new(dir.path(), 0, no_lookup());
        am.add_address(&addr("8.8.8.8:8130"), &addr("9.9.9.9:8130"));
        am.save_peers().unwrap();

        let path = dir.path().join(PEERS_FILENAME);
        let mut doc: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        doc["version"] = serde_json::json!(99);
        fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();

        let restored = AddrManager::new(dir.path(), 0, no_lookup());
        restored.load_peers();
        assert_eq!(restored.num_addresses(), 0);
    }

    #[test]
    fn test_local_addresses() {
        let dir = tempdir().unwrap();
        let am = AddrManager::new(dir.path(), 0, no_lookup());

        assert!(am
            .add_local_address(&addr("10.0.0.1:8130"), AddressPriority::Manual)
            .is_err());

        let remote = addr("8.8.8.8:8130");
        let fallback = am.get_best_local_address(&remote);
        assert!(fallback.ip.is_unspecified());
        assert_eq!(fallback.port, 0);

        am.add_local_address(&addr("1.2.3.4:8130"), AddressPriority::Bound)
            .unwrap();
        am.add_local_address(&addr("[2a00:1450::1]:8130"), AddressPriority::Manual)
            .unwrap();
        assert!(am.has_local_address(&addr("1.2.3.4:8130")));
        assert_eq!(am.local_addresses().len(), 2);

        // An IPv4 remote can only reach our IPv4 address
        assert_eq!(am.get_best_local_address(&remote), addr("1.2.3.4:8130"));
    }

    #[test]
    fn test_host_to_net_address() {
        let dir = tempdir().unwrap();
        let lookup: LookupFn = Arc::new(|host: &str| {
            if host == "seed.example" {
                Ok(vec!["5.6.7.8".parse().unwrap()])
            } else {
                Ok(Vec::new())
            }
        });
        let am = AddrManager::new(dir.path(), 0, Some(lookup));

        let na = am
            .host_to_net_address("seed.example", 8130, ServiceFlags::NODE_NETWORK)
            .unwrap();
        assert_eq!(na.key(), "5.6.7.8:8130");

        let na = am
            .deserialize_net_address("[2a01:4f8::1]:9000", ServiceFlags::NODE_NETWORK)
            .unwrap();
        assert_eq!(na.port, 9000);

        assert!(matches!(
            am.host_to_net_address("nowhere.example", 1, ServiceFlags::empty()),
            Err(AddrError::LookupFailed(..))
        ));
        assert!(am
            .deserialize_net_address("8.8.8.8", ServiceFlags::empty())
            .is_err());
    }

    #[tokio::test]
    async fn test_start_and_stop_persist() {
        let dir = tempdir().unwrap();
        let am = Arc::new(AddrManager::new(dir.path(), 0, no_lookup()));
        am.start();
        am.add_address(&addr("8.8.8.8:8130"), &addr("9.9.9.9:8130"));
        am.stop().await;

        let restored = Arc::new(AddrManager::new(dir.path(), 0, no_lookup()));
        restored.start();
        assert_eq!(restored.num_addresses(), 1);
        restored.stop().await;
    }
}
