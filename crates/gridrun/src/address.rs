//! # Addresses and Members
//!
//! Value types naming routable cluster endpoints. Both are immutable once
//! constructed and cheap to clone.

use std::fmt;
use std::str::FromStr;

/// A reachable `(host, port)` endpoint.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Address {
    host: String,
    port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Failure to parse a `host:port` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseAddressError(pub String);

impl fmt::Display for ParseAddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid address '{}', expected host:port", self.0)
    }
}

impl std::error::Error for ParseAddressError {}

impl FromStr for Address {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ParseAddressError(s.to_string()))?;

        if host.is_empty() {
            return Err(ParseAddressError(s.to_string()));
        }

        let port = port
            .parse::<u16>()
            .map_err(|_| ParseAddressError(s.to_string()))?;

        Ok(Self::new(host, port))
    }
}

/// One node of the cluster, as reported by the member list.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Member {
    address: Address,
    uuid: String,
}

impl Member {
    pub fn new(address: Address, uuid: impl Into<String>) -> Self {
        Self {
            address,
            uuid: uuid.into(),
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Member[{}]({})", self.address, self.uuid)
    }
}
