//! Tandem wire format: the fixed 20-byte packet header plus payload.
//!
//! These types ARE the protocol. Every node built against this crate must
//! agree bit-for-bit on the layout below, so the enums carry explicit wire
//! codes instead of relying on declaration order.
//!
//! Layout (big-endian):
//!
//! ```text
//! bits 0-1   type          bits 2-4   priority     bits 5-8  module
//! bits 9-11  connType      bit  12    broadcast    bits 13-15 reserved
//! bytes 2-5   IPv4 destination address
//! bytes 6-7   destination port
//! bytes 8-11  messageId
//! bytes 12-15 chunkNum
//! bytes 16-19 chunkLength
//! bytes 20..  payload
//! ```
//!
//! Bit 0 is the most significant bit of the first 16-bit word.

use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Header ───────────────────────────────────────────────────────────────────

/// Raw on-wire header. Field access goes through [`PacketInfo`]; this struct
/// only exists so the layout is checked at compile time.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
struct WireHeader {
    /// type | priority | module | connType | broadcast | reserved
    flags: U16<BigEndian>,
    ip: [u8; 4],
    port: U16<BigEndian>,
    message_id: U32<BigEndian>,
    chunk_num: U32<BigEndian>,
    chunk_length: U32<BigEndian>,
}

assert_eq_size!(WireHeader, [u8; HEADER_LEN]);

const TYPE_SHIFT: u16 = 14;
const PRIORITY_SHIFT: u16 = 11;
const MODULE_SHIFT: u16 = 7;
const CONN_SHIFT: u16 = 4;
const BROADCAST_SHIFT: u16 = 3;

// ── Constants ────────────────────────────────────────────────────────────────

/// Size of the fixed header in bytes.
pub const HEADER_LEN: usize = 20;

/// Size of the transport read buffer. No frame may exceed it.
pub const READ_BUFFER_SIZE: usize = 15 * 1024;

/// Largest payload a single fragment can carry and still fit the read buffer.
pub const MAX_FRAGMENT_PAYLOAD: usize = READ_BUFFER_SIZE - HEADER_LEN;

/// Highest value the 3-bit priority field can hold.
pub const MAX_PRIORITY: u8 = 7;

/// Upper bound on the number of clusters in one overlay.
pub const MAX_CLUSTERS: usize = 8;

// ── Enums ────────────────────────────────────────────────────────────────────

/// Routing class of a packet (2 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Addressed to a cluster server for its own consumption.
    ClusterServer = 0,
    /// Route within the receiving server's cluster.
    SameCluster = 1,
    /// Route to a cluster other than the sender's.
    OtherCluster = 2,
    /// Final hop: consume at the receiving node.
    Use = 3,
}

impl TryFrom<u8> for PacketType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketType::ClusterServer),
            1 => Ok(PacketType::SameCluster),
            2 => Ok(PacketType::OtherCluster),
            3 => Ok(PacketType::Use),
            other => Err(WireError::UnknownPacketType(other)),
        }
    }
}

/// Application module a payload belongs to (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ModuleType {
    Networking = 0,
    ScreenSharing = 1,
    Canvas = 2,
    UiUx = 3,
    Controller = 4,
    Ai = 5,
    Cloud = 6,
    Chat = 7,
}

impl TryFrom<u8> for ModuleType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ModuleType::Networking),
            1 => Ok(ModuleType::ScreenSharing),
            2 => Ok(ModuleType::Canvas),
            3 => Ok(ModuleType::UiUx),
            4 => Ok(ModuleType::Controller),
            5 => Ok(ModuleType::Ai),
            6 => Ok(ModuleType::Cloud),
            7 => Ok(ModuleType::Chat),
            other => Err(WireError::UnknownModule(other)),
        }
    }
}

impl From<ModuleType> for u8 {
    fn from(m: ModuleType) -> u8 {
        m as u8
    }
}

/// Control sub-type (3 bits). Only interpreted when the module is
/// [`ModuleType::Networking`]; application packets carry [`ConnectionType::Data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionType {
    Hello = 0,
    Alive = 1,
    Add = 2,
    Remove = 3,
    Network = 4,
    Close = 5,
    /// A batch of sub-packets produced by the send-side coalescer.
    Coalesced = 6,
    Data = 7,
}

impl TryFrom<u8> for ConnectionType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ConnectionType::Hello),
            1 => Ok(ConnectionType::Alive),
            2 => Ok(ConnectionType::Add),
            3 => Ok(ConnectionType::Remove),
            4 => Ok(ConnectionType::Network),
            5 => Ok(ConnectionType::Close),
            6 => Ok(ConnectionType::Coalesced),
            7 => Ok(ConnectionType::Data),
            other => Err(WireError::UnknownConnectionType(other)),
        }
    }
}

// ── PacketInfo ───────────────────────────────────────────────────────────────

/// The decoded unit of transmission: header fields plus payload.
///
/// `payload` is an immutable [`Bytes`]; clones share the buffer but nobody can
/// mutate it through another holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketInfo {
    pub packet_type: PacketType,
    pub priority: u8,
    pub module: ModuleType,
    pub connection_type: ConnectionType,
    pub broadcast: bool,
    pub ip_address: Ipv4Addr,
    pub port: u16,
    pub message_id: u32,
    /// 0-based fragment index.
    pub chunk_num: u32,
    /// Total fragment count. 1 means unfragmented.
    pub chunk_length: u32,
    pub payload: Bytes,
}

impl PacketInfo {
    /// A single-fragment packet at priority 0 with no broadcast flag.
    pub fn new(
        packet_type: PacketType,
        module: ModuleType,
        connection_type: ConnectionType,
        destination: SocketAddrV4,
        payload: Bytes,
    ) -> Self {
        Self {
            packet_type,
            priority: 0,
            module,
            connection_type,
            broadcast: false,
            ip_address: *destination.ip(),
            port: destination.port(),
            message_id: 0,
            chunk_num: 0,
            chunk_length: 1,
            payload,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_broadcast(mut self, broadcast: bool) -> Self {
        self.broadcast = broadcast;
        self
    }

    /// Destination address carried in the header.
    pub fn destination(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip_address, self.port)
    }

    pub fn is_fragmented(&self) -> bool {
        self.chunk_length > 1
    }

    /// Encode header and payload into one buffer.
    ///
    /// Priority is masked to its 3-bit width.
    pub fn encode(&self) -> Bytes {
        debug_assert!(self.priority <= MAX_PRIORITY, "priority out of range");

        let flags = ((self.packet_type as u16) << TYPE_SHIFT)
            | ((u16::from(self.priority) & 0x7) << PRIORITY_SHIFT)
            | ((self.module as u16) << MODULE_SHIFT)
            | ((self.connection_type as u16) << CONN_SHIFT)
            | (u16::from(self.broadcast) << BROADCAST_SHIFT);

        let header = WireHeader {
            flags: U16::new(flags),
            ip: self.ip_address.octets(),
            port: U16::new(self.port),
            message_id: U32::new(self.message_id),
            chunk_num: U32::new(self.chunk_num),
            chunk_length: U32::new(self.chunk_length),
        };

        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_slice(header.as_bytes());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode a packet. Everything after the header is the payload.
    ///
    /// Never panics: a short buffer or an unknown enum code is an error.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let header = WireHeader::read_from_prefix(buf).ok_or(WireError::Truncated(buf.len()))?;
        let flags = header.flags.get();

        Ok(Self {
            packet_type: PacketType::try_from(((flags >> TYPE_SHIFT) & 0x3) as u8)?,
            priority: ((flags >> PRIORITY_SHIFT) & 0x7) as u8,
            module: ModuleType::try_from(((flags >> MODULE_SHIFT) & 0xF) as u8)?,
            connection_type: ConnectionType::try_from(((flags >> CONN_SHIFT) & 0x7) as u8)?,
            broadcast: (flags >> BROADCAST_SHIFT) & 0x1 == 1,
            ip_address: Ipv4Addr::from(header.ip),
            port: header.port.get(),
            message_id: header.message_id.get(),
            chunk_num: header.chunk_num.get(),
            chunk_length: header.chunk_length.get(),
            payload: Bytes::copy_from_slice(&buf[HEADER_LEN..]),
        })
    }
}

/// Copy of `raw` with only the packet type bits replaced.
///
/// Used by relaying servers on the last hop; the payload is never touched.
pub fn retarget(raw: &[u8], packet_type: PacketType) -> Result<Bytes, WireError> {
    if raw.len() < HEADER_LEN {
        return Err(WireError::Truncated(raw.len()));
    }
    let mut buf = BytesMut::from(raw);
    buf[0] = (buf[0] & 0b0011_1111) | ((packet_type as u8) << 6);
    Ok(buf.freeze())
}

/// Priority field of an encoded packet, without decoding the rest.
pub fn peek_priority(raw: &[u8]) -> Result<u8, WireError> {
    if raw.len() < HEADER_LEN {
        return Err(WireError::Truncated(raw.len()));
    }
    Ok((raw[0] >> 3) & 0x7)
}

// ── Errors ───────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("buffer of {0} bytes is shorter than the {HEADER_LEN}-byte header")]
    Truncated(usize),

    #[error("unknown packet type: {0}")]
    UnknownPacketType(u8),

    #[error("unknown module id: {0}")]
    UnknownModule(u8),

    #[error("unknown connection type: {0}")]
    UnknownConnectionType(u8),

    #[error("host name of {0} bytes does not fit a 1-byte length prefix")]
    HostTooLong(usize),

    #[error("host is not valid UTF-8")]
    InvalidHost,

    #[error("cannot resolve {0} to an IPv4 address")]
    UnresolvableHost(String),

    #[error("port {0} out of range")]
    InvalidPort(u32),

    #[error("record truncated: needed {needed} bytes, {remaining} remaining")]
    RecordTruncated { needed: usize, remaining: usize },

    #[error("network structure has {0} clusters, limit is {MAX_CLUSTERS}")]
    TooManyClusters(usize),

    #[error("network structure has {clusters} clusters but {servers} servers")]
    ServerCountMismatch { clusters: usize, servers: usize },

    #[error("server of cluster {0} is not one of its members")]
    ServerNotMember(usize),
}

// ── Tests ────────────────────────────────────────────────────────────────────
