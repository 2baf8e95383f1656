pub mod address;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod invocation;
pub mod lifecycle;
pub mod listener;
pub mod load_balancer;
pub mod logging;
#[cfg(any(test, feature = "test-util"))]
pub mod mock_transport;
pub mod partition;
pub mod proxy;
pub mod registry;
pub mod runtime;
pub mod transport;

pub use config::ClientConfig;
pub use error::Error;
pub use error::Result;
pub use runtime::ClientRuntime;

#[cfg(test)]
mod tests;
