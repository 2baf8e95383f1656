//! # Error Definitions
//!
//! The failures surfaced to callers of the runtime. Every variant is fatal to
//! the single operation that produced it, never to the runtime itself.

use std::fmt;
use std::time::Duration;

use crate::codec;
use crate::codec::RemoteFailure;
use crate::config::ConfigError;
use crate::transport::TransportError;

#[derive(Debug, Clone)]
pub enum Error {
    /// The member failed or rejected the request.
    Invocation(RemoteFailure),
    /// No response arrived before the invocation deadline.
    Timeout { correlation_id: u64, after: Duration },
    /// The transport is unavailable, the target went away, or the client is shutting down.
    Connection(String),
    /// No proxy kind is registered for the service name.
    UnknownService(String),
    /// The member list is empty, there is nothing to route to.
    NoAvailableMember,
    /// Startup could not obtain the initial member list.
    ClusterConnect(String),
    /// A reply body could not be decoded.
    Codec(codec::Error),
    Config(ConfigError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invocation(failure) => write!(f, "Invocation failed: {}", failure),
            Self::Timeout { correlation_id, after } => {
                write!(f, "Invocation {} timed out after {:?}", correlation_id, after)
            }
            Self::Connection(msg) => write!(f, "Connection error: {}", msg),
            Self::UnknownService(name) => write!(f, "Unknown service: {}", name),
            Self::NoAvailableMember => write!(f, "No available member to route to"),
            Self::ClusterConnect(msg) => write!(f, "Could not connect to cluster: {}", msg),
            Self::Codec(e) => write!(f, "Codec error: {}", e),
            Self::Config(e) => write!(f, "Configuration error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Codec(e) => Some(e),
            Self::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<codec::Error> for Error {
    fn from(e: codec::Error) -> Self {
        Self::Codec(e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Connection(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
