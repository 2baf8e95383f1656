//! # Client Configuration
//!
//! `ClientConfig` is immutable once built. Use `ClientConfig::builder()` to
//! start from the defaults and override what you need; `build()` validates.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::address::Address;
use crate::lifecycle::LifecycleEvent;

pub const DEFAULT_CLUSTER_NAME: &str = "dev";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5701;
pub const DEFAULT_INVOCATION_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_CONNECTION_ATTEMPT_LIMIT: u32 = 2;
pub const DEFAULT_CONNECTION_ATTEMPT_PERIOD: Duration = Duration::from_secs(3);
pub const DEFAULT_PARTITION_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// No seed address was configured.
    NoAddresses,
    /// A seed address could not be parsed as `host:port`.
    InvalidAddress(String),
    /// A duration that must be positive was zero.
    ZeroDuration(&'static str),
    /// The connection attempt limit must be at least one.
    ZeroAttemptLimit,
    /// The heartbeat timeout must not be shorter than the interval.
    HeartbeatTimeoutTooShort { interval: Duration, timeout: Duration },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoAddresses => write!(f, "At least one cluster address is required"),
            Self::InvalidAddress(addr) => write!(f, "Invalid cluster address: {}", addr),
            Self::ZeroDuration(field) => write!(f, "{} must be greater than zero", field),
            Self::ZeroAttemptLimit => write!(f, "Connection attempt limit must be at least 1"),
            Self::HeartbeatTimeoutTooShort { interval, timeout } => write!(
                f,
                "Heartbeat timeout {:?} is shorter than heartbeat interval {:?}",
                timeout, interval
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Which member-selection policy the runtime uses.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum LoadBalancerKind {
    #[default]
    Random,
    RoundRobin,
}

pub type LifecycleListener = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

#[derive(Clone)]
pub struct ClientConfig {
    pub(crate) cluster_name: String,
    pub(crate) addresses: Vec<Address>,
    pub(crate) invocation_timeout: Duration,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) heartbeat_timeout: Duration,
    pub(crate) connection_attempt_limit: u32,
    pub(crate) connection_attempt_period: Duration,
    pub(crate) partition_refresh_interval: Duration,
    pub(crate) load_balancer: LoadBalancerKind,
    pub(crate) lifecycle_listeners: Vec<LifecycleListener>,
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn addresses(&self) -> &[Address] {
        &self.addresses
    }

    pub fn invocation_timeout(&self) -> Duration {
        self.invocation_timeout
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    pub fn connection_attempt_limit(&self) -> u32 {
        self.connection_attempt_limit
    }

    pub fn connection_attempt_period(&self) -> Duration {
        self.connection_attempt_period
    }

    pub fn partition_refresh_interval(&self) -> Duration {
        self.partition_refresh_interval
    }

    pub fn load_balancer(&self) -> LoadBalancerKind {
        self.load_balancer
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("cluster_name", &self.cluster_name)
            .field("addresses", &self.addresses)
            .field("invocation_timeout", &self.invocation_timeout)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .field("connection_attempt_limit", &self.connection_attempt_limit)
            .field("connection_attempt_period", &self.connection_attempt_period)
            .field("partition_refresh_interval", &self.partition_refresh_interval)
            .field("load_balancer", &self.load_balancer)
            .field("lifecycle_listeners", &self.lifecycle_listeners.len())
            .finish()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            cluster_name: DEFAULT_CLUSTER_NAME.to_string(),
            addresses: vec![Address::new(DEFAULT_HOST, DEFAULT_PORT)],
            invocation_timeout: DEFAULT_INVOCATION_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            connection_attempt_limit: DEFAULT_CONNECTION_ATTEMPT_LIMIT,
            connection_attempt_period: DEFAULT_CONNECTION_ATTEMPT_PERIOD,
            partition_refresh_interval: DEFAULT_PARTITION_REFRESH_INTERVAL,
            load_balancer: LoadBalancerKind::Random,
            lifecycle_listeners: Vec::new(),
        }
    }
}

/// Fluent builder for `ClientConfig`.
pub struct ClientConfigBuilder {
    config: ClientConfig,
    addresses: Vec<String>,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            addresses: Vec::new(),
        }
    }

    pub fn cluster_name(mut self, name: impl Into<String>) -> Self {
        self.config.cluster_name = name.into();
        self
    }

    /// Adds a seed address in `host:port` form. Replaces the default address.
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.addresses.push(address.into());
        self
    }

    pub fn invocation_timeout(mut self, timeout: Duration) -> Self {
        self.config.invocation_timeout = timeout;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.config.heartbeat_timeout = timeout;
        self
    }

    pub fn connection_attempt_limit(mut self, limit: u32) -> Self {
        self.config.connection_attempt_limit = limit;
        self
    }

    pub fn connection_attempt_period(mut self, period: Duration) -> Self {
        self.config.connection_attempt_period = period;
        self
    }

    pub fn partition_refresh_interval(mut self, interval: Duration) -> Self {
        self.config.partition_refresh_interval = interval;
        self
    }

    pub fn load_balancer(mut self, kind: LoadBalancerKind) -> Self {
        self.config.load_balancer = kind;
        self
    }

    /// Registers a listener before startup so it also observes `Starting`.
    pub fn lifecycle_listener(
        mut self,
        listener: impl Fn(&LifecycleEvent) + Send + Sync + 'static,
    ) -> Self {
        self.config.lifecycle_listeners.push(Arc::new(listener));
        self
    }

    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        let mut config = self.config;

        if !self.addresses.is_empty() {
            config.addresses = self
                .addresses
                .iter()
                .map(|raw| {
                    raw.parse::<Address>()
                        .map_err(|_| ConfigError::InvalidAddress(raw.clone()))
                })
                .collect::<Result<Vec<_>, _>>()?;
        }

        if config.addresses.is_empty() {
            return Err(ConfigError::NoAddresses);
        }

        let durations = [
            ("invocation_timeout", config.invocation_timeout),
            ("heartbeat_interval", config.heartbeat_interval),
            ("heartbeat_timeout", config.heartbeat_timeout),
            ("partition_refresh_interval", config.partition_refresh_interval),
        ];
        for (field, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(field));
            }
        }

        if config.connection_attempt_limit == 0 {
            return Err(ConfigError::ZeroAttemptLimit);
        }

        if config.heartbeat_timeout < config.heartbeat_interval {
            return Err(ConfigError::HeartbeatTimeoutTooShort {
                interval: config.heartbeat_interval,
                timeout: config.heartbeat_timeout,
            });
        }

        Ok(config)
    }
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
