//! # Load Balancing
//!
//! Picks the member that receives a request which is not bound to a specific
//! address. Policies read the live member list on every call and never block
//! beyond a short read lock on it.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use rand::seq::SliceRandom;

use crate::address::Address;
use crate::cluster::ClusterService;
use crate::config::LoadBalancerKind;
use crate::error::Error;
use crate::error::Result;

pub trait LoadBalancer: Send + Sync + 'static {
    /// Returns an address drawn from the current member list.
    ///
    /// Fails with `NoAvailableMember` when the list is empty; never falls back
    /// to a stale or default address.
    fn next_address(&self) -> Result<Address>;
}

/// Builds the policy selected in the configuration.
pub fn from_kind(kind: LoadBalancerKind, cluster: Arc<ClusterService>) -> Arc<dyn LoadBalancer> {
    match kind {
        LoadBalancerKind::Random => Arc::new(RandomLoadBalancer::new(cluster)),
        LoadBalancerKind::RoundRobin => Arc::new(RoundRobinLoadBalancer::new(cluster)),
    }
}

/// Uniform random choice over the members.
pub struct RandomLoadBalancer {
    cluster: Arc<ClusterService>,
}

impl RandomLoadBalancer {
    pub fn new(cluster: Arc<ClusterService>) -> Self {
        Self { cluster }
    }
}

impl LoadBalancer for RandomLoadBalancer {
    fn next_address(&self) -> Result<Address> {
        self.cluster
            .member_addresses()
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(Error::NoAvailableMember)
    }
}

/// Cycles through the members in list order.
pub struct RoundRobinLoadBalancer {
    cluster: Arc<ClusterService>,
    index: AtomicUsize,
}

impl RoundRobinLoadBalancer {
    pub fn new(cluster: Arc<ClusterService>) -> Self {
        Self {
            cluster,
            index: AtomicUsize::new(0),
        }
    }
}

impl LoadBalancer for RoundRobinLoadBalancer {
    fn next_address(&self) -> Result<Address> {
        let addresses = self.cluster.member_addresses();
        if addresses.is_empty() {
            return Err(Error::NoAvailableMember);
        }
        let index = self.index.fetch_add(1, Ordering::Relaxed) % addresses.len();
        Ok(addresses[index].clone())
    }
}
