//! # Client Runtime
//!
//! The composition root. Builds every service in dependency order, connects to
//! the cluster, and hands out distributed-object proxies.
//!
//! A runtime is only returned once it is fully `Started`; if any startup step
//! fails, whatever was already running is torn down and the error is returned.
//! Shutdown is idempotent: only the caller that moves the lifecycle from
//! `Started` to `ShuttingDown` does the work.

use std::sync::Arc;

use tracing::error;
use tracing::info;

use crate::address::Member;
use crate::cluster::ClusterService;
use crate::config::ClientConfig;
use crate::error::Error;
use crate::error::Result;
use crate::heartbeat::HeartbeatService;
use crate::invocation::InvocationService;
use crate::lifecycle::LifecycleService;
use crate::lifecycle::LifecycleState;
use crate::listener::ListenerService;
use crate::load_balancer;
use crate::partition::PartitionService;
use crate::proxy::FlakeIdGeneratorProxy;
use crate::proxy::ListProxy;
use crate::proxy::MapProxy;
use crate::proxy::MultiMapProxy;
use crate::proxy::PNCounterProxy;
use crate::proxy::Proxy;
use crate::proxy::ProxyKind;
use crate::proxy::QueueProxy;
use crate::proxy::ReplicatedMapProxy;
use crate::proxy::RingbufferProxy;
use crate::proxy::SetProxy;
use crate::proxy::TopicProxy;
use crate::registry::ProxyRegistry;
use crate::transport::Transport;

pub struct ClientRuntime {
    cluster_name: String,
    lifecycle: Arc<LifecycleService>,
    cluster: Arc<ClusterService>,
    listeners: Arc<ListenerService>,
    invocation: Arc<InvocationService>,
    heartbeat: Arc<HeartbeatService>,
    partitions: Arc<PartitionService>,
    registry: ProxyRegistry,
}

impl ClientRuntime {
    /// Builds the services, connects to the cluster and fires `Started`.
    ///
    /// Listeners from the configuration are registered before `Starting` fires,
    /// so they see every transition.
    pub async fn start(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let lifecycle = Arc::new(LifecycleService::new());
        for listener in &config.lifecycle_listeners {
            lifecycle.add_shared_listener(Arc::clone(listener));
        }
        lifecycle.fire_lifecycle_event(LifecycleState::Starting);

        let cluster = Arc::new(ClusterService::new(&config, Arc::clone(&lifecycle)));
        let load_balancer = load_balancer::from_kind(config.load_balancer, Arc::clone(&cluster));
        let listeners = Arc::new(ListenerService::new());
        let invocation = Arc::new(InvocationService::new(
            &config,
            transport,
            Arc::clone(&load_balancer),
            Arc::clone(&listeners),
        ));
        let heartbeat = Arc::new(HeartbeatService::new(
            &config,
            Arc::clone(&invocation),
            Arc::clone(&cluster),
            Arc::clone(&lifecycle),
        ));
        let partitions = Arc::new(PartitionService::new(&config, Arc::clone(&invocation)));
        let registry = ProxyRegistry::new(Arc::clone(&invocation), load_balancer);

        if let Err(e) = cluster.start(&invocation).await {
            error!(cluster = %config.cluster_name, error = %e, "client failed to start");
            invocation.shutdown();
            return Err(e);
        }

        heartbeat.start();
        partitions.start();
        lifecycle.fire_lifecycle_event(LifecycleState::Started);
        info!(cluster = %config.cluster_name, members = cluster.member_count(), "client started");

        Ok(Self {
            cluster_name: config.cluster_name,
            lifecycle,
            cluster,
            listeners,
            invocation,
            heartbeat,
            partitions,
            registry,
        })
    }

    /// Stops every service. Calls after the first, or concurrent with it, do nothing.
    pub fn shutdown(&self) {
        if !self.lifecycle.is_live() {
            return;
        }
        if !self.lifecycle.fire_lifecycle_event(LifecycleState::ShuttingDown) {
            return;
        }

        self.partitions.shutdown();
        self.invocation.shutdown();
        self.heartbeat.shutdown();

        self.lifecycle.fire_lifecycle_event(LifecycleState::Shutdown);
        info!(cluster = %self.cluster_name, "client shut down");
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleService> {
        &self.lifecycle
    }

    pub fn members(&self) -> Vec<Member> {
        self.cluster.members()
    }

    pub fn listeners(&self) -> &Arc<ListenerService> {
        &self.listeners
    }

    pub fn registry(&self) -> &ProxyRegistry {
        &self.registry
    }

    pub fn invocation(&self) -> &Arc<InvocationService> {
        &self.invocation
    }

    pub fn partitions(&self) -> &Arc<PartitionService> {
        &self.partitions
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatService> {
        &self.heartbeat
    }

    pub async fn get_distributed_object(&self, service_name: &str, object_name: &str) -> Result<Proxy> {
        self.registry.get_or_create_proxy(service_name, object_name).await
    }

    pub async fn destroy_distributed_object(&self, service_name: &str, object_name: &str) -> Result<bool> {
        self.registry.destroy_proxy(service_name, object_name).await
    }

    pub async fn get_map(&self, name: &str) -> Result<Arc<MapProxy>> {
        self.get_typed(name).await
    }

    pub async fn get_list(&self, name: &str) -> Result<Arc<ListProxy>> {
        self.get_typed(name).await
    }

    pub async fn get_set(&self, name: &str) -> Result<Arc<SetProxy>> {
        self.get_typed(name).await
    }

    pub async fn get_multi_map(&self, name: &str) -> Result<Arc<MultiMapProxy>> {
        self.get_typed(name).await
    }

    pub async fn get_replicated_map(&self, name: &str) -> Result<Arc<ReplicatedMapProxy>> {
        self.get_typed(name).await
    }

    pub async fn get_queue(&self, name: &str) -> Result<Arc<QueueProxy>> {
        self.get_typed(name).await
    }

    pub async fn get_topic(&self, name: &str) -> Result<Arc<TopicProxy>> {
        self.get_typed(name).await
    }

    pub async fn get_ringbuffer(&self, name: &str) -> Result<Arc<RingbufferProxy>> {
        self.get_typed(name).await
    }

    pub async fn get_pn_counter(&self, name: &str) -> Result<Arc<PNCounterProxy>> {
        self.get_typed(name).await
    }

    pub async fn get_flake_id_generator(&self, name: &str) -> Result<Arc<FlakeIdGeneratorProxy>> {
        self.get_typed(name).await
    }

    async fn get_typed<P: ProxyKind>(&self, name: &str) -> Result<Arc<P>> {
        let proxy = self.registry.get_or_create_proxy(P::SERVICE_NAME, name).await?;
        // The registry keys by service name, so the kind always matches.
        P::from_proxy(proxy).ok_or_else(|| Error::UnknownService(P::SERVICE_NAME.to_string()))
    }
}

