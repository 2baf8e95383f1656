//! # Frame Codec
//!
//! Gives the opaque request "shape" a concrete byte form, and encodes the
//! handful of control messages the runtime itself sends.
//!
//! Every frame starts with a one-byte tag and the correlation id:
//!
//! ```text
//! Request:  0x01 | corr u64 | type u16 | body bytes
//! ReplyOk:  0x02 | corr u64 | body bytes
//! ReplyErr: 0x03 | corr u64 | code u16 | message str
//! Event:    0x04 | corr u64 | body bytes
//! ```
//!
//! Integers are big-endian. `bytes` and `str` are a `u32` length followed by
//! the data. Decoding never panics; truncated or trailing input is an error.

use std::fmt;

use crate::address::Address;
use crate::address::Member;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The buffer ended before a field was complete.
    UnexpectedEnd { needed: usize, remaining: usize },
    /// A string field was not valid UTF-8.
    InvalidUtf8,
    /// The frame or event tag is not one we know.
    UnknownTag(u8),
    /// Bytes were left over after the frame was fully decoded.
    TrailingBytes(usize),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEnd { needed, remaining } => {
                write!(f, "Unexpected end of frame: needed {} bytes, {} remaining", needed, remaining)
            }
            Self::InvalidUtf8 => write!(f, "Invalid UTF-8 in string field"),
            Self::UnknownTag(tag) => write!(f, "Unknown tag: {:#04x}", tag),
            Self::TrailingBytes(n) => write!(f, "{} trailing bytes after frame", n),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Append-only big-endian writer.
#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.u32(v.len() as u32);
        self.buf.extend_from_slice(v);
        self
    }

    pub fn str(&mut self, v: &str) -> &mut Self {
        self.bytes(v.as_bytes())
    }

    pub fn address(&mut self, v: &Address) -> &mut Self {
        self.str(v.host()).u16(v.port())
    }

    pub fn member(&mut self, v: &Member) -> &mut Self {
        self.address(v.address()).str(v.uuid())
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a borrowed frame.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let remaining = self.buf.len() - self.pos;
        if remaining < n {
            return Err(Error::UnexpectedEnd { needed: n, remaining });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    pub fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    pub fn str(&mut self) -> Result<&'a str> {
        std::str::from_utf8(self.bytes()?).map_err(|_| Error::InvalidUtf8)
    }

    pub fn address(&mut self) -> Result<Address> {
        let host = self.str()?;
        let port = self.u16()?;
        Ok(Address::new(host, port))
    }

    pub fn member(&mut self) -> Result<Member> {
        let address = self.address()?;
        let uuid = self.str()?;
        Ok(Member::new(address, uuid))
    }

    /// Fails if any input is left unread.
    pub fn finish(self) -> Result<()> {
        match self.buf.len() - self.pos {
            0 => Ok(()),
            n => Err(Error::TrailingBytes(n)),
        }
    }
}

/// Kind of request carried by a frame.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum MessageType {
    CreateProxy,
    DestroyProxy,
    Ping,
    MemberList,
    AddMembershipListener,
    PartitionTable,
    /// Data-structure operations owned by the proxy layer.
    Custom(u16),
}

impl MessageType {
    pub fn code(self) -> u16 {
        match self {
            Self::CreateProxy => 0x0001,
            Self::DestroyProxy => 0x0002,
            Self::Ping => 0x0003,
            Self::MemberList => 0x0004,
            Self::AddMembershipListener => 0x0005,
            Self::PartitionTable => 0x0006,
            Self::Custom(code) => code,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            0x0001 => Self::CreateProxy,
            0x0002 => Self::DestroyProxy,
            0x0003 => Self::Ping,
            0x0004 => Self::MemberList,
            0x0005 => Self::AddMembershipListener,
            0x0006 => Self::PartitionTable,
            other => Self::Custom(other),
        }
    }
}

/// An outbound request before it is stamped with a correlation id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub message_type: MessageType,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(message_type: MessageType, body: Vec<u8>) -> Self {
        Self { message_type, body }
    }
}

/// The error side of a reply: the member rejected or failed the request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteFailure {
    pub code: u16,
    pub message: String,
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

const TAG_REQUEST: u8 = 0x01;
const TAG_REPLY_OK: u8 = 0x02;
const TAG_REPLY_ERR: u8 = 0x03;
const TAG_EVENT: u8 = 0x04;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Request {
        correlation_id: u64,
        message_type: MessageType,
        body: Vec<u8>,
    },
    Reply {
        correlation_id: u64,
        status: std::result::Result<Vec<u8>, RemoteFailure>,
    },
    /// Server-pushed event for the listener registered under `correlation_id`.
    Event {
        correlation_id: u64,
        body: Vec<u8>,
    },
}

impl Frame {
    pub fn request(correlation_id: u64, request: &Request) -> Self {
        Self::Request {
            correlation_id,
            message_type: request.message_type,
            body: request.body.clone(),
        }
    }

    pub fn correlation_id(&self) -> u64 {
        match self {
            Self::Request { correlation_id, .. }
            | Self::Reply { correlation_id, .. }
            | Self::Event { correlation_id, .. } => *correlation_id,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        match self {
            Self::Request { correlation_id, message_type, body } => {
                enc.u8(TAG_REQUEST)
                    .u64(*correlation_id)
                    .u16(message_type.code())
                    .bytes(body);
            }
            Self::Reply { correlation_id, status: Ok(body) } => {
                enc.u8(TAG_REPLY_OK).u64(*correlation_id).bytes(body);
            }
            Self::Reply { correlation_id, status: Err(failure) } => {
                enc.u8(TAG_REPLY_ERR)
                    .u64(*correlation_id)
                    .u16(failure.code)
                    .str(&failure.message);
            }
            Self::Event { correlation_id, body } => {
                enc.u8(TAG_EVENT).u64(*correlation_id).bytes(body);
            }
        }
        enc.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(bytes);
        let tag = dec.u8()?;
        let correlation_id = dec.u64()?;

        let frame = match tag {
            TAG_REQUEST => {
                let message_type = MessageType::from_code(dec.u16()?);
                let body = dec.bytes()?.to_vec();
                Self::Request { correlation_id, message_type, body }
            }
            TAG_REPLY_OK => {
                let body = dec.bytes()?.to_vec();
                Self::Reply { correlation_id, status: Ok(body) }
            }
            TAG_REPLY_ERR => {
                let code = dec.u16()?;
                let message = dec.str()?.to_string();
                Self::Reply {
                    correlation_id,
                    status: Err(RemoteFailure { code, message }),
                }
            }
            TAG_EVENT => {
                let body = dec.bytes()?.to_vec();
                Self::Event { correlation_id, body }
            }
            other => return Err(Error::UnknownTag(other)),
        };

        dec.finish()?;
        Ok(frame)
    }
}

// --- Control messages ---

/// Asks `target` to register the distributed object on the cluster.
pub fn encode_create_proxy(object_name: &str, service_name: &str, target: &Address) -> Request {
    let mut enc = Encoder::new();
    enc.str(object_name).str(service_name).address(target);
    Request::new(MessageType::CreateProxy, enc.into_bytes())
}

/// Returns `(object_name, service_name, target)`.
pub fn decode_create_proxy(body: &[u8]) -> Result<(String, String, Address)> {
    let mut dec = Decoder::new(body);
    let object_name = dec.str()?.to_string();
    let service_name = dec.str()?.to_string();
    let target = dec.address()?;
    dec.finish()?;
    Ok((object_name, service_name, target))
}

pub fn encode_destroy_proxy(object_name: &str, service_name: &str) -> Request {
    let mut enc = Encoder::new();
    enc.str(object_name).str(service_name);
    Request::new(MessageType::DestroyProxy, enc.into_bytes())
}

/// Returns `(object_name, service_name)`.
pub fn decode_destroy_proxy(body: &[u8]) -> Result<(String, String)> {
    let mut dec = Decoder::new(body);
    let object_name = dec.str()?.to_string();
    let service_name = dec.str()?.to_string();
    dec.finish()?;
    Ok((object_name, service_name))
}

pub fn encode_ping() -> Request {
    Request::new(MessageType::Ping, Vec::new())
}

/// Member-list request; the member rejects it if `cluster_name` is not its own.
pub fn encode_member_list(cluster_name: &str) -> Request {
    let mut enc = Encoder::new();
    enc.str(cluster_name);
    Request::new(MessageType::MemberList, enc.into_bytes())
}

pub fn decode_member_list(body: &[u8]) -> Result<String> {
    let mut dec = Decoder::new(body);
    let cluster_name = dec.str()?.to_string();
    dec.finish()?;
    Ok(cluster_name)
}

pub fn encode_members(members: &[Member]) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.u32(members.len() as u32);
    for member in members {
        enc.member(member);
    }
    enc.into_bytes()
}

pub fn decode_members(body: &[u8]) -> Result<Vec<Member>> {
    let mut dec = Decoder::new(body);
    let count = dec.u32()?;
    let mut members = Vec::new();
    for _ in 0..count {
        members.push(dec.member()?);
    }
    dec.finish()?;
    Ok(members)
}

pub fn encode_add_membership_listener() -> Request {
    Request::new(MessageType::AddMembershipListener, Vec::new())
}

/// Membership change pushed to a registered membership listener.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MembershipEvent {
    Added(Member),
    Removed(Member),
}

const EVENT_MEMBER_ADDED: u8 = 1;
const EVENT_MEMBER_REMOVED: u8 = 2;

impl MembershipEvent {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        match self {
            Self::Added(member) => enc.u8(EVENT_MEMBER_ADDED).member(member),
            Self::Removed(member) => enc.u8(EVENT_MEMBER_REMOVED).member(member),
        };
        enc.into_bytes()
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(body);
        let event = match dec.u8()? {
            EVENT_MEMBER_ADDED => Self::Added(dec.member()?),
            EVENT_MEMBER_REMOVED => Self::Removed(dec.member()?),
            other => return Err(Error::UnknownTag(other)),
        };
        dec.finish()?;
        Ok(event)
    }
}

pub fn encode_partition_table() -> Request {
    Request::new(MessageType::PartitionTable, Vec::new())
}

/// Reply body for a partition-table request: `(partition id, owner)` pairs.
pub fn encode_partitions(owners: &[(u32, Address)]) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.u32(owners.len() as u32);
    for (partition_id, owner) in owners {
        enc.u32(*partition_id).address(owner);
    }
    enc.into_bytes()
}

pub fn decode_partitions(body: &[u8]) -> Result<Vec<(u32, Address)>> {
    let mut dec = Decoder::new(body);
    let count = dec.u32()?;
    let mut owners = Vec::new();
    for _ in 0..count {
        let partition_id = dec.u32()?;
        let owner = dec.address()?;
        owners.push((partition_id, owner));
    }
    dec.finish()?;
    Ok(owners)
}
