//! # Distributed Object Proxies
//!
//! A proxy is the local handle for one named object living on the cluster.
//! Every kind shares the same plumbing (`ProxyBase`): its identity, and the
//! invocation service and load balancer it routes calls through.
//!
//! The set of kinds is closed. `constructor_for` is the dispatch table from a
//! service name to the routine building that kind; a name it does not know
//! has no proxy.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::address::Address;
use crate::codec::Request;
use crate::error::Result;
use crate::invocation::InvocationService;
use crate::load_balancer::LoadBalancer;

pub const MAP_SERVICE: &str = "hz:impl:mapService";
pub const LIST_SERVICE: &str = "hz:impl:listService";
pub const SET_SERVICE: &str = "hz:impl:setService";
pub const MULTI_MAP_SERVICE: &str = "hz:impl:multiMapService";
pub const REPLICATED_MAP_SERVICE: &str = "hz:impl:replicatedMapService";
pub const QUEUE_SERVICE: &str = "hz:impl:queueService";
pub const TOPIC_SERVICE: &str = "hz:impl:topicService";
pub const RINGBUFFER_SERVICE: &str = "hz:impl:ringbufferService";
pub const PN_COUNTER_SERVICE: &str = "hz:impl:PNCounterService";
pub const FLAKE_ID_GENERATOR_SERVICE: &str = "hz:impl:flakeIdGeneratorService";

/// `(service name, object name)`: names one distributed object for the
/// lifetime of the client.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Identity {
    service_name: String,
    object_name: String,
}

impl Identity {
    pub fn new(service_name: impl Into<String>, object_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            object_name: object_name.into(),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn object_name(&self) -> &str {
        &self.object_name
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service_name, self.object_name)
    }
}

/// State shared by every proxy kind.
pub struct ProxyBase {
    identity: Identity,
    invocation: Arc<InvocationService>,
    load_balancer: Arc<dyn LoadBalancer>,
}

impl ProxyBase {
    pub(crate) fn new(
        identity: Identity,
        invocation: Arc<InvocationService>,
        load_balancer: Arc<dyn LoadBalancer>,
    ) -> Self {
        Self {
            identity,
            invocation,
            load_balancer,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn name(&self) -> &str {
        self.identity.object_name()
    }

    pub fn service_name(&self) -> &str {
        self.identity.service_name()
    }

    /// Sends an operation to a member chosen by the load balancer.
    pub async fn invoke(&self, request: Request) -> Result<Vec<u8>> {
        let target = self.load_balancer.next_address()?;
        self.invocation.invoke_on_target(request, target).await
    }

    /// Sends an operation to a specific member.
    pub async fn invoke_on(&self, request: Request, target: Address) -> Result<Vec<u8>> {
        self.invocation.invoke_on_target(request, target).await
    }
}

impl fmt::Debug for ProxyBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyBase")
            .field("identity", &self.identity)
            .finish()
    }
}

/// A proxy kind with a fixed service name.
pub trait ProxyKind: Sized {
    const SERVICE_NAME: &'static str;

    /// Narrows a `Proxy` to this kind.
    fn from_proxy(proxy: Proxy) -> Option<Arc<Self>>;
}

/// Builds one proxy kind around its base.
pub(crate) type Constructor = fn(ProxyBase) -> Proxy;

macro_rules! proxy_kinds {
    ($( $(#[$meta:meta])* $variant:ident => $ty:ident, $service:ident; )*) => {
        $(
            $(#[$meta])*
            #[derive(Debug)]
            pub struct $ty(ProxyBase);

            impl $ty {
                fn wrap(base: ProxyBase) -> Proxy {
                    Proxy::$variant(Arc::new(Self(base)))
                }
            }

            impl Deref for $ty {
                type Target = ProxyBase;

                fn deref(&self) -> &ProxyBase {
                    &self.0
                }
            }

            impl ProxyKind for $ty {
                const SERVICE_NAME: &'static str = $service;

                fn from_proxy(proxy: Proxy) -> Option<Arc<Self>> {
                    match proxy {
                        Proxy::$variant(inner) => Some(inner),
                        _ => None,
                    }
                }
            }
        )*

        /// Any distributed object handed out by the registry.
        #[derive(Clone, Debug)]
        pub enum Proxy {
            $( $variant(Arc<$ty>), )*
        }

        impl Proxy {
            pub fn base(&self) -> &ProxyBase {
                match self {
                    $( Self::$variant(inner) => &inner.0, )*
                }
            }
        }

        /// Every service name that has a proxy kind.
        pub const SERVICE_NAMES: &[&str] = &[ $( $service, )* ];

        /// The dispatch table: exactly one constructor per known service name.
        pub(crate) fn constructor_for(service_name: &str) -> Option<Constructor> {
            match service_name {
                $( $service => Some($ty::wrap as Constructor), )*
                _ => None,
            }
        }
    };
}

proxy_kinds! {
    /// Distributed key-value map.
    Map => MapProxy, MAP_SERVICE;
    List => ListProxy, LIST_SERVICE;
    Set => SetProxy, SET_SERVICE;
    /// Map holding several values per key.
    MultiMap => MultiMapProxy, MULTI_MAP_SERVICE;
    /// Map fully replicated to every member.
    ReplicatedMap => ReplicatedMapProxy, REPLICATED_MAP_SERVICE;
    Queue => QueueProxy, QUEUE_SERVICE;
    /// Publish/subscribe channel.
    Topic => TopicProxy, TOPIC_SERVICE;
    Ringbuffer => RingbufferProxy, RINGBUFFER_SERVICE;
    /// Conflict-free replicated counter.
    PNCounter => PNCounterProxy, PN_COUNTER_SERVICE;
    /// Cluster-wide unique id generator.
    FlakeIdGenerator => FlakeIdGeneratorProxy, FLAKE_ID_GENERATOR_SERVICE;
}

impl Proxy {
    pub fn identity(&self) -> &Identity {
        self.base().identity()
    }

    pub fn name(&self) -> &str {
        self.base().name()
    }

    pub fn service_name(&self) -> &str {
        self.base().service_name()
    }

    /// True if both handles refer to the same cached instance.
    pub fn same_instance(&self, other: &Proxy) -> bool {
        std::ptr::eq(self.base(), other.base())
    }

    pub async fn invoke(&self, request: Request) -> Result<Vec<u8>> {
        self.base().invoke(request).await
    }
}
