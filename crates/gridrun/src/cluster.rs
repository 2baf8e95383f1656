//! # Cluster Service
//!
//! Owns the current member list. At startup it asks the configured seed
//! addresses for the list, then subscribes to membership events so the list
//! follows the cluster as members join and leave.

use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::time::Duration;

use tracing::info;
use tracing::warn;

use crate::address::Address;
use crate::address::Member;
use crate::codec;
use crate::codec::MembershipEvent;
use crate::config::ClientConfig;
use crate::error::Error;
use crate::error::Result;
use crate::invocation::InvocationService;
use crate::lifecycle::LifecycleEvent;
use crate::lifecycle::LifecycleService;

pub struct ClusterService {
    cluster_name: String,
    seeds: Vec<Address>,
    attempt_limit: u32,
    attempt_period: Duration,
    members: RwLock<Vec<Member>>,
    lifecycle: Arc<LifecycleService>,
}

impl ClusterService {
    pub fn new(config: &ClientConfig, lifecycle: Arc<LifecycleService>) -> Self {
        Self {
            cluster_name: config.cluster_name.clone(),
            seeds: config.addresses.clone(),
            attempt_limit: config.connection_attempt_limit,
            attempt_period: config.connection_attempt_period,
            members: RwLock::new(Vec::new()),
            lifecycle,
        }
    }

    pub fn members(&self) -> Vec<Member> {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn member_addresses(&self) -> Vec<Address> {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|member| member.address().clone())
            .collect()
    }

    pub fn member_count(&self) -> usize {
        self.members.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Fetches the initial member list and subscribes to membership events.
    ///
    /// Tries every seed address once per round, for up to the configured number
    /// of rounds, sleeping the attempt period between rounds. Fails with
    /// `ClusterConnect` carrying the last error once all rounds are spent.
    pub async fn start(self: &Arc<Self>, invocation: &InvocationService) -> Result<()> {
        let mut last_error = None;

        for attempt in 1..=self.attempt_limit {
            for seed in &self.seeds {
                match self.connect_via(invocation, seed).await {
                    Ok(()) => {
                        info!(
                            cluster = %self.cluster_name,
                            seed = %seed,
                            members = self.member_count(),
                            "connected to cluster"
                        );
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(seed = %seed, attempt, error = %e, "cluster connection attempt failed");
                        last_error = Some(e);
                    }
                }
            }

            if attempt < self.attempt_limit {
                tokio::time::sleep(self.attempt_period).await;
            }
        }

        let reason = match last_error {
            Some(e) => format!("{} attempt(s) exhausted, last error: {}", self.attempt_limit, e),
            None => "no seed addresses".to_string(),
        };
        Err(Error::ClusterConnect(reason))
    }

    /// The member list is installed, and announced, only once the seed has also
    /// accepted the membership listener.
    async fn connect_via(self: &Arc<Self>, invocation: &InvocationService, seed: &Address) -> Result<()> {
        let request = codec::encode_member_list(&self.cluster_name);
        let body = invocation.invoke_on_target(request, seed.clone()).await?;
        let members = codec::decode_members(&body)?;

        let cluster = Arc::clone(self);
        invocation
            .invoke_listener(
                codec::encode_add_membership_listener(),
                seed.clone(),
                Arc::new(move |body: &[u8]| cluster.handle_event(body)),
            )
            .await?;

        self.apply_member_list(members);
        Ok(())
    }

    /// Replaces the member list, announcing joins and departures.
    pub(crate) fn apply_member_list(&self, members: Vec<Member>) {
        let (added, removed) = {
            let mut current = self.members.write().unwrap_or_else(PoisonError::into_inner);
            let added: Vec<Member> = members
                .iter()
                .filter(|member| !current.contains(member))
                .cloned()
                .collect();
            let removed: Vec<Member> = current
                .iter()
                .filter(|member| !members.contains(member))
                .cloned()
                .collect();
            *current = members;
            (added, removed)
        };

        for member in removed {
            self.lifecycle.emit(LifecycleEvent::MemberRemoved(member));
        }
        for member in added {
            self.lifecycle.emit(LifecycleEvent::MemberAdded(member));
        }
    }

    fn handle_event(&self, body: &[u8]) {
        let event = match MembershipEvent::decode(body) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "malformed membership event");
                return;
            }
        };

        let mut members = self.members();
        match &event {
            MembershipEvent::Added(member) if !members.contains(member) => {
                members.push(member.clone());
            }
            MembershipEvent::Removed(member) => members.retain(|m| m != member),
            MembershipEvent::Added(_) => return,
        }

        info!(event = ?event, "membership changed");
        self.apply_member_list(members);
    }
}
