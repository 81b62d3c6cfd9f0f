//! Network message types for P2P communication
//!
//! Defines the wire vocabulary spoken between DAG nodes. Every message is
//! identified by a short ASCII command string and carries a JSON payload
//! (empty for the signalling messages such as `verack`).

use bitflags::bitflags;
use chrono::Utc;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use thiserror::Error;

// ============================================================================
// Limits
// ============================================================================

/// Maximum number of bytes a single payload may carry
pub const MAX_MESSAGE_PAYLOAD: usize = 32 * 1024 * 1024;

/// Maximum addresses in one `addr` message
pub const MAX_ADDR_PER_MSG: usize = 1000;

/// Maximum inventory vectors in one `inv`, `getdata` or `notfound`
pub const MAX_INV_PER_MSG: usize = 50000;

/// Maximum locator hashes in `getblocks`, `getheaders` and `syncdag`
pub const MAX_BLOCK_LOCATORS_PER_MSG: usize = 500;

/// Maximum headers returned by one `headers` reply
pub const MAX_BLOCK_HEADERS_PER_MSG: usize = 2000;

/// Maximum block hashes announced in one `getblocks` reply
pub const MAX_BLOCKS_PER_MSG: usize = 500;

/// Maximum length of the user agent string
pub const MAX_USER_AGENT_LEN: usize = 256;

/// Maximum number of tips carried by a graph state
pub const MAX_GRAPH_TIPS: usize = 100;

/// Upper bound on the fee rate a peer may ask for in `feefilter`
pub const MAX_MONEY: i64 = 21_000_000 * 100_000_000;

/// Headroom for a serialized graph state inside any payload
const GRAPH_STATE_PAYLOAD: usize = 128 + MAX_GRAPH_TIPS * 72;

/// Length of a command string on the wire
pub const COMMAND_SIZE: usize = 12;

// ============================================================================
// Primitive types
// ============================================================================

/// 32-byte hash identifying blocks and transactions
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; 32]);

    /// SHA-256 applied twice
    pub fn double_sha256(data: &[u8]) -> Self {
        let first = Sha256::digest(data);
        let second = Sha256::digest(first);
        let mut out = [0u8; 32];
        out.copy_from_slice(&second);
        Hash(out)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out)?;
        Ok(Hash(out))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hash::from_hex(&s).map_err(D::Error::custom)
    }
}

/// Serde helper that writes opaque byte blobs as hex strings
pub mod hex_bytes {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(D::Error::custom)
    }
}

bitflags! {
    /// Services a node advertises in its `version` message
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ServiceFlags: u64 {
        /// Full node serving the whole DAG
        const NODE_NETWORK = 1;
        /// Supports bloom filtering
        const NODE_BLOOM = 1 << 1;
        /// Supports committed filters
        const NODE_CF = 1 << 2;
    }
}

impl ServiceFlags {
    /// Services a node offers when nothing else is configured
    pub fn default_services() -> Self {
        ServiceFlags::NODE_NETWORK | ServiceFlags::NODE_CF
    }

    /// Services an outbound peer must offer to be kept
    pub fn required() -> Self {
        ServiceFlags::NODE_NETWORK
    }
}

impl Serialize for ServiceFlags {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.bits())
    }
}

impl<'de> Deserialize<'de> for ServiceFlags {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u64::deserialize(deserializer)?;
        Ok(ServiceFlags::from_bits_retain(bits))
    }
}

/// A network endpoint together with the last time it was seen and the
/// services it offers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetAddress {
    pub ip: IpAddr,
    pub port: u16,
    /// Unix seconds
    pub timestamp: i64,
    pub services: ServiceFlags,
}

impl NetAddress {
    pub fn new(ip: IpAddr, port: u16, services: ServiceFlags) -> Self {
        Self {
            ip: canonical_ip(ip),
            port,
            timestamp: Utc::now().timestamp(),
            services,
        }
    }

    pub fn with_timestamp(ip: IpAddr, port: u16, services: ServiceFlags, timestamp: i64) -> Self {
        Self {
            ip: canonical_ip(ip),
            port,
            timestamp,
            services,
        }
    }

    pub fn from_socket_addr(addr: SocketAddr, services: ServiceFlags) -> Self {
        Self::new(addr.ip(), addr.port(), services)
    }

    /// The unspecified IPv4 address, used where no better address is known
    pub fn unspecified() -> Self {
        Self::with_timestamp(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            0,
            ServiceFlags::empty(),
            0,
        )
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Lookup key used by the address book (`ip:port`, IPv6 bracketed)
    pub fn key(&self) -> String {
        self.socket_addr().to_string()
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// IPv4-mapped IPv6 addresses are folded back to plain IPv4
pub fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// Kind of object an inventory vector refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvType {
    Tx,
    Block,
    FilteredBlock,
}

/// Announcement of a single object by type and hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvVect {
    #[serde(rename = "type")]
    pub inv_type: InvType,
    pub hash: Hash,
}

impl InvVect {
    pub fn new(inv_type: InvType, hash: Hash) -> Self {
        Self { inv_type, hash }
    }

    pub fn block(hash: Hash) -> Self {
        Self::new(InvType::Block, hash)
    }

    pub fn tx(hash: Hash) -> Self {
        Self::new(InvType::Tx, hash)
    }
}

impl fmt::Display for InvVect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.inv_type {
            InvType::Tx => "tx",
            InvType::Block => "block",
            InvType::FilteredBlock => "filtered_block",
        };
        write!(f, "{} {}", kind, self.hash)
    }
}

/// Summary of a node's view of the block DAG
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GraphState {
    pub tips: Vec<Hash>,
    pub main_height: u64,
    pub main_order: u64,
    pub layer: u64,
    pub total: u64,
}

impl GraphState {
    /// Graph state of a node that only knows the given genesis block
    pub fn genesis(genesis: Hash) -> Self {
        Self {
            tips: vec![genesis],
            main_height: 0,
            main_order: 0,
            layer: 0,
            total: 1,
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.tips.len() == 1 && self.total <= 1 && self.main_height == 0
    }

    /// True when this state is strictly ahead of `other`
    pub fn is_excellent(&self, other: &GraphState) -> bool {
        (self.main_height, self.total, self.main_order)
            > (other.main_height, other.total, other.main_order)
    }
}

impl fmt::Display for GraphState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(tips={} main_height={} main_order={} layer={} total={})",
            self.tips.len(),
            self.main_height,
            self.main_order,
            self.layer,
            self.total
        )
    }
}

/// Reject codes carried by `reject`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectCode {
    Malformed,
    Invalid,
    Obsolete,
    Duplicate,
    Nonstandard,
    Dust,
    InsufficientFee,
    Checkpoint,
}

impl RejectCode {
    pub fn as_u8(self) -> u8 {
        match self {
            RejectCode::Malformed => 0x01,
            RejectCode::Invalid => 0x10,
            RejectCode::Obsolete => 0x11,
            RejectCode::Duplicate => 0x12,
            RejectCode::Nonstandard => 0x40,
            RejectCode::Dust => 0x41,
            RejectCode::InsufficientFee => 0x42,
            RejectCode::Checkpoint => 0x43,
        }
    }

    pub fn from_u8(code: u8) -> Option<Self> {
        Some(match code {
            0x01 => RejectCode::Malformed,
            0x10 => RejectCode::Invalid,
            0x11 => RejectCode::Obsolete,
            0x12 => RejectCode::Duplicate,
            0x40 => RejectCode::Nonstandard,
            0x41 => RejectCode::Dust,
            0x42 => RejectCode::InsufficientFee,
            0x43 => RejectCode::Checkpoint,
            _ => return None,
        })
    }
}

impl fmt::Display for RejectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RejectCode::Malformed => "REJECT_MALFORMED",
            RejectCode::Invalid => "REJECT_INVALID",
            RejectCode::Obsolete => "REJECT_OBSOLETE",
            RejectCode::Duplicate => "REJECT_DUPLICATE",
            RejectCode::Nonstandard => "REJECT_NONSTANDARD",
            RejectCode::Dust => "REJECT_DUST",
            RejectCode::InsufficientFee => "REJECT_INSUFFICIENTFEE",
            RejectCode::Checkpoint => "REJECT_CHECKPOINT",
        };
        write!(f, "{} (0x{:02x})", name, self.as_u8())
    }
}

impl Serialize for RejectCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for RejectCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        RejectCode::from_u8(code)
            .ok_or_else(|| D::Error::custom(format!("unknown reject code 0x{:02x}", code)))
    }
}

/// Synchronisation mode reported by `syncresult`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Sync completed
    Full,
    /// Only a sub-DAG was sent; the receiver should continue with `syncdag`
    SubDag,
}

// ============================================================================
// Message payloads
// ============================================================================

/// Handshake announcement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgVersion {
    pub protocol_version: u32,
    pub services: ServiceFlags,
    /// Unix seconds at the sender
    pub timestamp: i64,
    pub addr_you: NetAddress,
    pub addr_me: NetAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub last_gs: GraphState,
    pub disable_relay_tx: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgAddr {
    pub addr_list: Vec<NetAddress>,
}

/// Inventory announcement; the graph state rides along for immediate blocks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgInv {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gs: Option<GraphState>,
    pub inv_list: Vec<InvVect>,
}

impl MsgInv {
    pub fn new(inv_list: Vec<InvVect>) -> Self {
        Self { gs: None, inv_list }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgGetData {
    pub inv_list: Vec<InvVect>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgNotFound {
    pub inv_list: Vec<InvVect>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgGetBlocks {
    pub gs: GraphState,
    pub block_locator: Vec<Hash>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgGetHeaders {
    pub block_locator: Vec<Hash>,
    pub hash_stop: Hash,
}

/// Serialized block headers, opaque to the network layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgHeaders {
    pub headers: Vec<HeaderBytes>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderBytes(#[serde(with = "hex_bytes")] pub Vec<u8>);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgBlock {
    pub hash: Hash,
    #[serde(with = "hex_bytes")]
    pub block: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgTx {
    pub hash: Hash,
    #[serde(with = "hex_bytes")]
    pub tx: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgGraphState {
    pub gs: GraphState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgSyncDag {
    pub gs: GraphState,
    pub main_locator: Vec<Hash>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgSyncPoint {
    pub gs: GraphState,
    pub sync_point: Hash,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgSyncResult {
    pub gs: GraphState,
    pub mode: SyncMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgFeeFilter {
    pub min_fee: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgPing {
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgPong {
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgReject {
    /// Command of the message being rejected
    pub cmd: String,
    pub code: RejectCode,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<Hash>,
}

impl MsgReject {
    pub fn new(cmd: &str, code: RejectCode, reason: impl Into<String>) -> Self {
        Self {
            cmd: cmd.to_string(),
            code,
            reason: reason.into(),
            hash: None,
        }
    }
}

impl fmt::Display for MsgReject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cmd {}, code {}, reason {}", self.cmd, self.code, self.reason)?;
        if let Some(hash) = &self.hash {
            write!(f, ", hash {}", hash)?;
        }
        Ok(())
    }
}

// ============================================================================
// Message
// ============================================================================

pub mod cmd {
    pub const VERSION: &str = "version";
    pub const VERACK: &str = "verack";
    pub const GETADDR: &str = "getaddr";
    pub const ADDR: &str = "addr";
    pub const INV: &str = "inv";
    pub const GETDATA: &str = "getdata";
    pub const NOTFOUND: &str = "notfound";
    pub const GETBLOCKS: &str = "getblocks";
    pub const GETHEADERS: &str = "getheaders";
    pub const HEADERS: &str = "headers";
    pub const BLOCK: &str = "block";
    pub const TX: &str = "tx";
    pub const GRAPHSTATE: &str = "graphstate";
    pub const SYNCDAG: &str = "syncdag";
    pub const SYNCPOINT: &str = "syncpoint";
    pub const SYNCRESULT: &str = "syncresult";
    pub const MEMPOOL: &str = "mempool";
    pub const FEEFILTER: &str = "feefilter";
    pub const SENDHEADERS: &str = "sendheaders";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const REJECT: &str = "reject";

    pub const ALL: [&str; 22] = [
        VERSION, VERACK, GETADDR, ADDR, INV, GETDATA, NOTFOUND, GETBLOCKS, GETHEADERS, HEADERS,
        BLOCK, TX, GRAPHSTATE, SYNCDAG, SYNCPOINT, SYNCRESULT, MEMPOOL, FEEFILTER, SENDHEADERS,
        PING, PONG, REJECT,
    ];
}

/// Errors turning payload bytes into messages
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Payload for {command} is {size} bytes, max is {max}")]
    PayloadTooLarge {
        command: String,
        size: usize,
        max: usize,
    },

    #[error("Malformed {command} payload: {source}")]
    Malformed {
        command: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unexpected payload for {0}")]
    UnexpectedPayload(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Every message the network layer exchanges
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Version(MsgVersion),
    VerAck,
    GetAddr,
    Addr(MsgAddr),
    Inv(MsgInv),
    GetData(MsgGetData),
    NotFound(MsgNotFound),
    GetBlocks(MsgGetBlocks),
    GetHeaders(MsgGetHeaders),
    Headers(MsgHeaders),
    Block(MsgBlock),
    Tx(MsgTx),
    GraphState(MsgGraphState),
    SyncDag(MsgSyncDag),
    SyncPoint(MsgSyncPoint),
    SyncResult(MsgSyncResult),
    MemPool,
    FeeFilter(MsgFeeFilter),
    SendHeaders,
    Ping(MsgPing),
    Pong(MsgPong),
    Reject(MsgReject),
}

impl Message {
    /// Wire command for this message
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => cmd::VERSION,
            Message::VerAck => cmd::VERACK,
            Message::GetAddr => cmd::GETADDR,
            Message::Addr(_) => cmd::ADDR,
            Message::Inv(_) => cmd::INV,
            Message::GetData(_) => cmd::GETDATA,
            Message::NotFound(_) => cmd::NOTFOUND,
            Message::GetBlocks(_) => cmd::GETBLOCKS,
            Message::GetHeaders(_) => cmd::GETHEADERS,
            Message::Headers(_) => cmd::HEADERS,
            Message::Block(_) => cmd::BLOCK,
            Message::Tx(_) => cmd::TX,
            Message::GraphState(_) => cmd::GRAPHSTATE,
            Message::SyncDag(_) => cmd::SYNCDAG,
            Message::SyncPoint(_) => cmd::SYNCPOINT,
            Message::SyncResult(_) => cmd::SYNCRESULT,
            Message::MemPool => cmd::MEMPOOL,
            Message::FeeFilter(_) => cmd::FEEFILTER,
            Message::SendHeaders => cmd::SENDHEADERS,
            Message::Ping(_) => cmd::PING,
            Message::Pong(_) => cmd::PONG,
            Message::Reject(_) => cmd::REJECT,
        }
    }

    /// Serialize the payload part of the message
    pub fn encode_payload(&self) -> Result<Vec<u8>, MessageError> {
        let payload = match self {
            Message::VerAck | Message::GetAddr | Message::MemPool | Message::SendHeaders => {
                Vec::new()
            }
            Message::Version(m) => serde_json::to_vec(m)?,
            Message::Addr(m) => serde_json::to_vec(m)?,
            Message::Inv(m) => serde_json::to_vec(m)?,
            Message::GetData(m) => serde_json::to_vec(m)?,
            Message::NotFound(m) => serde_json::to_vec(m)?,
            Message::GetBlocks(m) => serde_json::to_vec(m)?,
            Message::GetHeaders(m) => serde_json::to_vec(m)?,
            Message::Headers(m) => serde_json::to_vec(m)?,
            Message::Block(m) => serde_json::to_vec(m)?,
            Message::Tx(m) => serde_json::to_vec(m)?,
            Message::GraphState(m) => serde_json::to_vec(m)?,
            Message::SyncDag(m) => serde_json::to_vec(m)?,
            Message::SyncPoint(m) => serde_json::to_vec(m)?,
            Message::SyncResult(m) => serde_json::to_vec(m)?,
            Message::FeeFilter(m) => serde_json::to_vec(m)?,
            Message::Ping(m) => serde_json::to_vec(m)?,
            Message::Pong(m) => serde_json::to_vec(m)?,
            Message::Reject(m) => serde_json::to_vec(m)?,
        };

        let max = max_payload_length(self.command());
        if payload.len() > max {
            return Err(MessageError::PayloadTooLarge {
                command: self.command().to_string(),
                size: payload.len(),
                max,
            });
        }
        Ok(payload)
    }

    /// Build a message from its command and payload
    pub fn decode(command: &str, payload: &[u8]) -> Result<Self, MessageError> {
        fn parse<T: serde::de::DeserializeOwned>(
            command: &str,
            payload: &[u8],
        ) -> Result<T, MessageError> {
            serde_json::from_slice(payload).map_err(|source| MessageError::Malformed {
                command: command.to_string(),
                source,
            })
        }

        let empty = |msg: Message| {
            if payload.is_empty() {
                Ok(msg)
            } else {
                Err(MessageError::UnexpectedPayload(command.to_string()))
            }
        };

        match command {
            cmd::VERSION => Ok(Message::Version(parse(command, payload)?)),
            cmd::VERACK => empty(Message::VerAck),
            cmd::GETADDR => empty(Message::GetAddr),
            cmd::ADDR => Ok(Message::Addr(parse(command, payload)?)),
            cmd::INV => Ok(Message::Inv(parse(command, payload)?)),
            cmd::GETDATA => Ok(Message::GetData(parse(command, payload)?)),
            cmd::NOTFOUND => Ok(Message::NotFound(parse(command, payload)?)),
            cmd::GETBLOCKS => Ok(Message::GetBlocks(parse(command, payload)?)),
            cmd::GETHEADERS => Ok(Message::GetHeaders(parse(command, payload)?)),
            cmd::HEADERS => Ok(Message::Headers(parse(command, payload)?)),
            cmd::BLOCK => Ok(Message::Block(parse(command, payload)?)),
            cmd::TX => Ok(Message::Tx(parse(command, payload)?)),
            cmd::GRAPHSTATE => Ok(Message::GraphState(parse(command, payload)?)),
            cmd::SYNCDAG => Ok(Message::SyncDag(parse(command, payload)?)),
            cmd::SYNCPOINT => Ok(Message::SyncPoint(parse(command, payload)?)),
            cmd::SYNCRESULT => Ok(Message::SyncResult(parse(command, payload)?)),
            cmd::MEMPOOL => empty(Message::MemPool),
            cmd::FEEFILTER => Ok(Message::FeeFilter(parse(command, payload)?)),
            cmd::SENDHEADERS => empty(Message::SendHeaders),
            cmd::PING => Ok(Message::Ping(parse(command, payload)?)),
            cmd::PONG => Ok(Message::Pong(parse(command, payload)?)),
            cmd::REJECT => Ok(Message::Reject(parse(command, payload)?)),
            other => Err(MessageError::UnknownCommand(other.to_string())),
        }
    }

    /// Short human readable summary for logs
    pub fn summary(&self) -> String {
        match self {
            Message::Version(m) => format!(
                "agent {}, pver {}, services {:#x}",
                m.user_agent,
                m.protocol_version,
                m.services.bits()
            ),
            Message::Addr(m) => format!("{} addr", m.addr_list.len()),
            Message::Inv(m) => format!("{} inv", m.inv_list.len()),
            Message::GetData(m) => format!("{} inv", m.inv_list.len()),
            Message::NotFound(m) => format!("{} inv", m.inv_list.len()),
            Message::GetBlocks(m) => format!("gs {}, {} locators", m.gs, m.block_locator.len()),
            Message::GetHeaders(m) => {
                format!("{} locators, stop {}", m.block_locator.len(), m.hash_stop)
            }
            Message::Headers(m) => format!("{} headers", m.headers.len()),
            Message::Block(m) => format!("hash {}", m.hash),
            Message::Tx(m) => format!("hash {}", m.hash),
            Message::GraphState(m) => format!("gs {}", m.gs),
            Message::SyncDag(m) => format!("gs {}, {} locators", m.gs, m.main_locator.len()),
            Message::SyncPoint(m) => format!("gs {}, point {}", m.gs, m.sync_point),
            Message::SyncResult(m) => format!("gs {}, mode {:?}", m.gs, m.mode),
            Message::FeeFilter(m) => format!("min fee {}", m.min_fee),
            Message::Ping(m) => format!("nonce {}", m.nonce),
            Message::Pong(m) => format!("nonce {}", m.nonce),
            Message::Reject(m) => m.to_string(),
            Message::VerAck | Message::GetAddr | Message::MemPool | Message::SendHeaders => {
                String::new()
            }
        }
    }
}

/// Largest payload accepted for a command
pub fn max_payload_length(command: &str) -> usize {
    match command {
        cmd::VERACK | cmd::GETADDR | cmd::MEMPOOL | cmd::SENDHEADERS => 0,
        cmd::PING | cmd::PONG | cmd::FEEFILTER => 64,
        cmd::REJECT => 1024 + MAX_USER_AGENT_LEN,
        cmd::VERSION => 1024 + MAX_USER_AGENT_LEN + GRAPH_STATE_PAYLOAD,
        cmd::ADDR => 64 + MAX_ADDR_PER_MSG * 160,
        cmd::INV | cmd::GETDATA | cmd::NOTFOUND => {
            64 + MAX_INV_PER_MSG * 96 + GRAPH_STATE_PAYLOAD
        }
        cmd::GETBLOCKS | cmd::GETHEADERS | cmd::SYNCDAG => {
            128 + MAX_BLOCK_LOCATORS_PER_MSG * 72 + GRAPH_STATE_PAYLOAD
        }
        cmd::GRAPHSTATE | cmd::SYNCPOINT | cmd::SYNCRESULT => 128 + GRAPH_STATE_PAYLOAD,
        _ => MAX_MESSAGE_PAYLOAD,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_version() -> MsgVersion {
        let addr = NetAddress::new("8.8.8.8".parse().unwrap(), 8130, ServiceFlags::NODE_NETWORK);
        MsgVersion {
            protocol_version: 3,
            services: ServiceFlags::default_services(),
            timestamp: 1_700_000_000,
            addr_you: addr.clone(),
            addr_me: addr,
            nonce: 42,
            user_agent: "/dagnode:0.1.0/".to_string(),
            last_gs: GraphState::genesis(Hash::double_sha256(b"genesis")),
            disable_relay_tx: false,
        }
    }

    #[test]
    fn test_commands_fit_wire_field() {
        let mut seen = std::collections::HashSet::new();
        for command in cmd::ALL {
            assert!(command.len() <= COMMAND_SIZE, "{} too long", command);
            assert!(seen.insert(command), "{} duplicated", command);
        }
    }

    #[test]
    fn test_version_payload_decodes() {
        let msg = Message::Version(sample_version());
        let payload = msg.encode_payload().unwrap();
        let decoded = Message::decode(msg.command(), &payload).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_signal_messages_have_empty_payload() {
        for msg in [Message::VerAck, Message::GetAddr, Message::MemPool, Message::SendHeaders] {
            assert!(msg.encode_payload().unwrap().is_empty());
        }
        assert!(matches!(
            Message::decode(cmd::VERACK, b"{}"),
            Err(MessageError::UnexpectedPayload(_))
        ));
    }

    #[test]
    fn test_unknown_command() {
        assert!(matches!(
            Message::decode("bogus", b""),
            Err(MessageError::UnknownCommand(_))
        ));
    }

    #[test]
    fn test_malformed_payload() {
        let err = Message::decode(cmd::PING, b"{\"nonce\":\"x\"}").unwrap_err();
        assert!(matches!(err, MessageError::Malformed { .. }));
    }

    #[test]
    fn test_reject_code_values() {
        assert_eq!(RejectCode::Malformed.as_u8(), 0x01);
        assert_eq!(RejectCode::Obsolete.as_u8(), 0x11);
        assert_eq!(RejectCode::Checkpoint.as_u8(), 0x43);
        assert_eq!(RejectCode::from_u8(0x12), Some(RejectCode::Duplicate));
        assert_eq!(RejectCode::from_u8(0x02), None);
    }

    #[test]
    fn test_oversized_addr_rejected() {
        let addr = NetAddress::new("8.8.8.8".parse().unwrap(), 8130, ServiceFlags::NODE_NETWORK);
        let msg = Message::Addr(MsgAddr {
            addr_list: vec![addr; MAX_ADDR_PER_MSG * 5],
        });
        assert!(matches!(
            msg.encode_payload(),
            Err(MessageError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_mapped_ipv6_is_canonical() {
        let na = NetAddress::new("::ffff:1.2.3.4".parse().unwrap(), 1, ServiceFlags::empty());
        assert_eq!(na.ip, "1.2.3.4".parse::<IpAddr>().unwrap());
        assert_eq!(na.key(), "1.2.3.4:1");
    }

    #[test]
    fn test_service_flags_serialize_as_bits() {
        let json = serde_json::to_string(&ServiceFlags::default_services()).unwrap();
        assert_eq!(json, "5");
    }
}
