//! # Proxy Registry
//!
//! Caches one proxy per distributed-object identity and talks to the cluster
//! to create and destroy the objects behind them.
//!
//! Reads go straight to a concurrent map. Creation and destruction of the same
//! identity are serialized by a per-identity async mutex (single flight): the
//! first caller to miss performs the remote create while later callers for the
//! same identity wait, then find the cached proxy. Unrelated identities never
//! wait on each other.
//!
//! The remote create and destroy run in a spawned task that owns the
//! per-identity lock. A caller that gives up stops waiting for the result, but
//! the round trip and the cache update still complete before the next caller
//! for that identity gets in.
//!
//! ## Invariants
//!
//! - At most one cache entry per identity.
//! - Concurrent first-time callers cause exactly one remote create and all get
//!   the same instance.
//! - An object is requested for creation at most once more than it has been
//!   destroyed, even when callers are cancelled.
//! - An unknown service name never reaches the cluster and never touches the cache.

use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;

use crate::codec;
use crate::error::Error;
use crate::error::Result;
use crate::invocation::InvocationService;
use crate::load_balancer::LoadBalancer;
use crate::proxy;
use crate::proxy::Constructor;
use crate::proxy::Identity;
use crate::proxy::Proxy;
use crate::proxy::ProxyBase;

pub struct ProxyRegistry {
    inner: Arc<Inner>,
    reference_id: AtomicI64,
}

/// State the detached create and destroy tasks need.
struct Inner {
    invocation: Arc<InvocationService>,
    load_balancer: Arc<dyn LoadBalancer>,
    proxies: DashMap<Identity, Proxy>,
    in_flight: DashMap<Identity, Arc<Mutex<()>>>,
}

/// Exclusive section for one identity. Dropping it releases the section and
/// forgets the mutex once nobody else holds or waits on it.
struct Flight {
    inner: Arc<Inner>,
    identity: Identity,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Flight {
    async fn enter(inner: &Arc<Inner>, identity: Identity) -> Self {
        let lock = {
            let entry = inner
                .in_flight
                .entry(identity.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())));
            Arc::clone(&*entry)
        };

        Self {
            inner: Arc::clone(inner),
            identity,
            guard: Some(lock.lock_owned().await),
        }
    }

    async fn create(&self, construct: Constructor) -> Result<Proxy> {
        if let Some(proxy) = self.inner.cached(&self.identity) {
            return Ok(proxy);
        }

        let identity = &self.identity;
        let target = self.inner.load_balancer.next_address()?;
        let request = codec::encode_create_proxy(identity.object_name(), identity.service_name(), &target);
        self.inner.invocation.invoke_on_target(request, target.clone()).await?;

        let base = ProxyBase::new(
            identity.clone(),
            Arc::clone(&self.inner.invocation),
            Arc::clone(&self.inner.load_balancer),
        );
        let proxy = construct(base);
        self.inner.proxies.insert(identity.clone(), proxy.clone());

        debug!(identity = %identity, target = %target, "created distributed object");
        Ok(proxy)
    }

    async fn destroy(&self) -> Result<bool> {
        let identity = &self.identity;
        if self.inner.proxies.remove(identity).is_none() {
            return Ok(false);
        }

        let request = codec::encode_destroy_proxy(identity.object_name(), identity.service_name());
        self.inner.invocation.invoke_on_random_target(request).await?;
        info!(identity = %identity, "destroyed distributed object");
        Ok(true)
    }
}

impl Drop for Flight {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.inner
            .in_flight
            .remove_if(&self.identity, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl Inner {
    fn cached(&self, identity: &Identity) -> Option<Proxy> {
        self.proxies.get(identity).map(|entry| entry.value().clone())
    }
}

impl ProxyRegistry {
    pub fn new(invocation: Arc<InvocationService>, load_balancer: Arc<dyn LoadBalancer>) -> Self {
        Self {
            inner: Arc::new(Inner {
                invocation,
                load_balancer,
                proxies: DashMap::new(),
                in_flight: DashMap::new(),
            }),
            reference_id: AtomicI64::new(0),
        }
    }

    /// Strictly increasing, starting at 1, never reused.
    pub fn next_reference_id(&self) -> i64 {
        self.reference_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn proxy_count(&self) -> usize {
        self.inner.proxies.len()
    }

    pub fn contains(&self, service_name: &str, object_name: &str) -> bool {
        self.inner
            .proxies
            .contains_key(&Identity::new(service_name, object_name))
    }

    /// Returns the cached proxy, or registers the object on the cluster and
    /// caches a new one.
    ///
    /// Fails with `UnknownService` before any remote call if no proxy kind
    /// matches `service_name`; otherwise surfaces the error of the remote create.
    pub async fn get_or_create_proxy(&self, service_name: &str, object_name: &str) -> Result<Proxy> {
        let identity = Identity::new(service_name, object_name);
        if let Some(proxy) = self.inner.cached(&identity) {
            return Ok(proxy);
        }

        let construct = proxy::constructor_for(service_name)
            .ok_or_else(|| Error::UnknownService(service_name.to_string()))?;

        let flight = Flight::enter(&self.inner, identity).await;
        detached(tokio::spawn(async move { flight.create(construct).await })).await
    }

    /// Evicts the proxy and destroys the object on the cluster.
    ///
    /// Returns `false` without any remote call if nothing is cached. If the
    /// remote destroy fails the error is returned, but the entry stays evicted:
    /// the local handle is no longer valid either way.
    pub async fn destroy_proxy(&self, service_name: &str, object_name: &str) -> Result<bool> {
        let identity = Identity::new(service_name, object_name);
        if !self.inner.proxies.contains_key(&identity) {
            return Ok(false);
        }

        let flight = Flight::enter(&self.inner, identity).await;
        detached(tokio::spawn(async move { flight.destroy().await })).await
    }
}

/// Awaits a task holding a `Flight`. Dropping this future leaves the task running.
async fn detached<T>(task: JoinHandle<Result<T>>) -> Result<T> {
    task.await
        .map_err(|e| Error::Connection(format!("proxy task did not complete: {}", e)))?
}
