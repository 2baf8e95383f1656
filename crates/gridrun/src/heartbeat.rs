//! # Heartbeat Service
//!
//! Pings every member on a fixed interval. A member that has not answered for
//! the heartbeat timeout is marked stopped: its pending invocations fail with
//! `Connection` and `Disconnected` is broadcast. A stopped member that answers
//! again is marked alive and `Connected` is broadcast.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::Weak;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::address::Address;
use crate::cluster::ClusterService;
use crate::codec;
use crate::config::ClientConfig;
use crate::error::Error;
use crate::invocation::InvocationService;
use crate::lifecycle::LifecycleEvent;
use crate::lifecycle::LifecycleService;

struct MemberHealth {
    last_seen: Instant,
    alive: bool,
}

/// What a ping outcome did to a member's health.
enum Transition {
    Unchanged,
    Restored,
    Stopped,
}

pub struct HeartbeatService {
    interval: Duration,
    timeout: Duration,
    invocation: Arc<InvocationService>,
    cluster: Arc<ClusterService>,
    lifecycle: Arc<LifecycleService>,
    health: DashMap<Address, MemberHealth>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatService {
    pub fn new(
        config: &ClientConfig,
        invocation: Arc<InvocationService>,
        cluster: Arc<ClusterService>,
        lifecycle: Arc<LifecycleService>,
    ) -> Self {
        Self {
            interval: config.heartbeat_interval,
            timeout: config.heartbeat_timeout,
            invocation,
            cluster,
            lifecycle,
            health: DashMap::new(),
            task: Mutex::new(None),
        }
    }

    /// Whether `address` answered recently enough. Unknown addresses are not alive.
    pub fn is_alive(&self, address: &Address) -> bool {
        self.health.get(address).is_some_and(|health| health.alive)
    }

    /// Spawns the heartbeat loop. Calling it again while running does nothing.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }

        let now = Instant::now();
        for address in self.cluster.member_addresses() {
            self.health.insert(address, MemberHealth { last_seen: now, alive: true });
        }

        *task = Some(tokio::spawn(run(Arc::downgrade(self))));
        info!(interval = ?self.interval, timeout = ?self.timeout, "heartbeat started");
    }

    /// Stops the heartbeat loop. Idempotent.
    pub fn shutdown(&self) {
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            task.abort();
            info!("heartbeat stopped");
        }
    }

    async fn beat(&self) {
        let addresses = self.cluster.member_addresses();
        self.health.retain(|address, _| addresses.contains(address));

        // A ping may not outlive the tick that sent it.
        let pings = addresses.iter().map(|address| {
            let ping = self.invocation.invoke_on_target(codec::encode_ping(), address.clone());
            tokio::time::timeout(self.interval, ping)
        });
        let outcomes = join_all(pings).await;

        for (address, outcome) in addresses.into_iter().zip(outcomes) {
            match outcome {
                Ok(Ok(_)) => self.on_reply(address),
                Ok(Err(e)) => self.on_miss(address, &e),
                Err(_) => self.on_miss(address, &Error::Connection("no heartbeat reply within interval".into())),
            }
        }
    }

    fn on_reply(&self, address: Address) {
        let transition = {
            let now = Instant::now();
            let mut health = self
                .health
                .entry(address.clone())
                .or_insert(MemberHealth { last_seen: now, alive: true });
            health.last_seen = now;
            if health.alive {
                Transition::Unchanged
            } else {
                health.alive = true;
                Transition::Restored
            }
        };

        if let Transition::Restored = transition {
            info!(address = %address, "heartbeat restored");
            self.lifecycle.emit(LifecycleEvent::Connected(address));
        }
    }

    fn on_miss(&self, address: Address, error: &Error) {
        debug!(address = %address, error = %error, "heartbeat missed");

        let transition = {
            let now = Instant::now();
            let mut health = self
                .health
                .entry(address.clone())
                .or_insert(MemberHealth { last_seen: now, alive: true });
            if health.alive && now.duration_since(health.last_seen) >= self.timeout {
                health.alive = false;
                Transition::Stopped
            } else {
                Transition::Unchanged
            }
        };

        if let Transition::Stopped = transition {
            let failed = self.invocation.fail_target(&address, "heartbeat timed out");
            warn!(address = %address, timeout = ?self.timeout, failed, "heartbeat stopped");
            self.lifecycle.emit(LifecycleEvent::Disconnected(address));
        }
    }
}

async fn run(service: Weak<HeartbeatService>) {
    let interval = match service.upgrade() {
        Some(service) => service.interval,
        None => return,
    };

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(service) = service.upgrade() else {
            return;
        };
        service.beat().await;
    }
}
