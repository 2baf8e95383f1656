//! # Transport Abstraction
//!
//! A minimal, async interface for moving frames between the client and the
//! cluster members.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: The Transport knows nothing about frames, correlation
//!   ids or proxies. It moves opaque buffers to an address.
//! - **Split Send/Receive**: Sends are addressed; everything coming back is
//!   multiplexed onto a single inbound stream that the invocation service pumps.

use std::fmt;

use crate::address::Address;

/// Errors that occur at the network/transport layer.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// The member is unreachable or the connection was dropped.
    ConnectionLost(String),
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Something arriving from the cluster.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// An encoded frame from some member.
    Frame(Vec<u8>),
    /// The connection to this member is gone; anything in flight to it is lost.
    Disconnected(Address),
}

/// A mechanism to send frames to members and receive whatever comes back.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends a payload to the member at `address`.
    ///
    /// # invariants
    /// - Must return `Err` if the member cannot be reached.
    /// - Should not interpret the payload content.
    async fn send(&self, address: &Address, payload: &[u8]) -> Result<()>;

    /// Receives the next inbound item.
    ///
    /// Returns `Ok(None)` once the transport is closed for good.
    async fn recv(&self) -> Result<Option<Inbound>>;
}
