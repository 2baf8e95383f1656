//! # Partition Service
//!
//! Keeps a copy of the partition-owner table, refreshed from a random member
//! right after start and then on a fixed interval. A failed refresh keeps the
//! previous table.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::address::Address;
use crate::codec;
use crate::config::ClientConfig;
use crate::error::Result;
use crate::invocation::InvocationService;

pub struct PartitionService {
    refresh_interval: Duration,
    invocation: Arc<InvocationService>,
    owners: RwLock<HashMap<u32, Address>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PartitionService {
    pub fn new(config: &ClientConfig, invocation: Arc<InvocationService>) -> Self {
        Self {
            refresh_interval: config.partition_refresh_interval,
            invocation,
            owners: RwLock::new(HashMap::new()),
            task: Mutex::new(None),
        }
    }

    pub fn owner(&self, partition_id: u32) -> Option<Address> {
        self.owners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&partition_id)
            .cloned()
    }

    pub fn partition_count(&self) -> usize {
        self.owners.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Spawns the refresh loop. Calling it again while running does nothing.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_none() {
            *task = Some(tokio::spawn(run(Arc::downgrade(self))));
            info!(interval = ?self.refresh_interval, "partition service started");
        }
    }

    /// Stops the refresh loop. Idempotent.
    pub fn shutdown(&self) {
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            task.abort();
            info!("partition service stopped");
        }
    }

    /// Fetches the table once and replaces the local copy.
    pub async fn refresh(&self) -> Result<()> {
        let body = self
            .invocation
            .invoke_on_random_target(codec::encode_partition_table())
            .await?;
        let owners = codec::decode_partitions(&body)?;
        let count = owners.len();

        *self.owners.write().unwrap_or_else(PoisonError::into_inner) = owners.into_iter().collect();
        debug!(partitions = count, "partition table refreshed");
        Ok(())
    }
}

async fn run(service: Weak<PartitionService>) {
    let interval = match service.upgrade() {
        Some(service) => service.refresh_interval,
        None => return,
    };

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(service) = service.upgrade() else {
            return;
        };
        if let Err(e) = service.refresh().await {
            warn!(error = %e, "partition table refresh failed");
        }
    }
}
