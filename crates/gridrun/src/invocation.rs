//! # Invocation Service
//!
//! Turns requests into correlated, address-targeted round trips.
//!
//! A receive task pumps the transport and forwards every reply, event and
//! disconnect notice as a message on a channel. A single completion task
//! consumes that channel and is the only place replies touch the correlation
//! table.
//!
//! ## Invariants
//!
//! - Correlation ids start at 1 and are never reused within a service.
//! - Removing an entry from the pending table is the claim that grants the
//!   right to resolve it. Replies, the deadline timer, target loss and shutdown
//!   all go through that claim, so every invocation resolves exactly once.
//! - Replies for ids that are no longer pending are ignored.
//! - Once shut down, every pending and every later invocation fails with
//!   `Connection`; later invocations are never sent.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::address::Address;
use crate::codec::Frame;
use crate::codec::Request;
use crate::config::ClientConfig;
use crate::error::Error;
use crate::error::Result;
use crate::listener::EventHandler;
use crate::listener::ListenerService;
use crate::load_balancer::LoadBalancer;
use crate::transport::Inbound;
use crate::transport::Transport;

/// An outstanding request waiting for its reply.
struct Pending {
    target: Address,
    tx: oneshot::Sender<Result<Vec<u8>>>,
    deadline: Option<AbortHandle>,
}

/// Messages from the receive path to the completion task.
enum Completion {
    Reply { correlation_id: u64, outcome: Result<Vec<u8>> },
    Event { correlation_id: u64, body: Vec<u8> },
    TargetLost(Address),
    TransportClosed(String),
}

pub struct InvocationService {
    transport: Arc<dyn Transport>,
    load_balancer: Arc<dyn LoadBalancer>,
    listeners: Arc<ListenerService>,
    pending: Arc<DashMap<u64, Pending>>,
    next_correlation_id: AtomicU64,
    timeout: Duration,
    closed: AtomicBool,
    completions: mpsc::UnboundedSender<Completion>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl InvocationService {
    /// Creates the service and spawns its receive and completion tasks.
    pub fn new(
        config: &ClientConfig,
        transport: Arc<dyn Transport>,
        load_balancer: Arc<dyn LoadBalancer>,
        listeners: Arc<ListenerService>,
    ) -> Self {
        let pending = Arc::new(DashMap::new());
        let (completions, completion_rx) = mpsc::unbounded_channel();

        let receive = tokio::spawn(receive_loop(Arc::clone(&transport), completions.clone()));
        let complete = tokio::spawn(completion_loop(
            completion_rx,
            Arc::clone(&pending),
            Arc::clone(&listeners),
        ));

        Self {
            transport,
            load_balancer,
            listeners,
            pending,
            next_correlation_id: AtomicU64::new(1),
            timeout: config.invocation_timeout,
            closed: AtomicBool::new(false),
            completions,
            tasks: Mutex::new(vec![receive, complete]),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of invocations still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Sends `request` to `target` and resolves with the reply body.
    ///
    /// Fails with `Timeout` if no reply arrives within the configured timeout,
    /// `Connection` if the target cannot be reached or goes away first, and
    /// `Invocation` if the member answers with an error.
    ///
    /// Dropping the returned future abandons the result; the invocation itself
    /// is still cleaned up by its reply, its deadline, or shutdown.
    pub async fn invoke_on_target(&self, request: Request, target: Address) -> Result<Vec<u8>> {
        let (correlation_id, rx) = self.register(target.clone())?;
        self.send_and_await(correlation_id, &request, &target, rx).await
    }

    /// Lets the load balancer pick the target, then behaves as `invoke_on_target`.
    pub async fn invoke_on_random_target(&self, request: Request) -> Result<Vec<u8>> {
        let target = self.load_balancer.next_address()?;
        self.invoke_on_target(request, target).await
    }

    /// Sends a listener registration request and routes every event the member
    /// pushes for it to `handler`.
    ///
    /// The handler is registered before the request leaves, so events that race
    /// ahead of the reply are not lost. Returns the registration id.
    pub async fn invoke_listener(
        &self,
        request: Request,
        target: Address,
        handler: EventHandler,
    ) -> Result<u64> {
        let (correlation_id, rx) = self.register(target.clone())?;
        self.listeners.register(correlation_id, handler);

        match self.send_and_await(correlation_id, &request, &target, rx).await {
            Ok(_) => Ok(correlation_id),
            Err(e) => {
                self.listeners.deregister(correlation_id);
                Err(e)
            }
        }
    }

    /// Entry point for an external receive path delivering a completion.
    pub fn complete(&self, correlation_id: u64, outcome: Result<Vec<u8>>) {
        // Closed channel means the service is shut down; the id is gone anyway.
        let _ = self.completions.send(Completion::Reply { correlation_id, outcome });
    }

    /// Fails every pending invocation aimed at `target` with `Connection`.
    ///
    /// Returns the number of invocations failed.
    pub fn fail_target(&self, target: &Address, reason: &str) -> usize {
        let error = Error::Connection(format!("{}: {}", target, reason));
        fail_where(&self.pending, |pending| pending.target == *target, &error)
    }

    /// Stops the service. Idempotent.
    ///
    /// Marks the service closed first, then fails everything still pending, so
    /// an invocation registering concurrently either sees the flag or is drained.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let error = Error::Connection("client is shutting down".into());
        let failed = fail_where(&self.pending, |_| true, &error);

        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }

        info!(failed, "invocation service stopped");
    }

    /// Allocates a correlation id and a pending entry with its deadline timer.
    ///
    /// Fails with `Connection`, leaving nothing pending, once the service is
    /// closed; the request must then not be sent.
    fn register(&self, target: Address) -> Result<(u64, oneshot::Receiver<Result<Vec<u8>>>)> {
        let correlation_id = self.next_correlation_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        self.pending.insert(correlation_id, Pending {
            target,
            tx,
            deadline: None,
        });

        let pending = Arc::clone(&self.pending);
        let after = self.timeout;
        let deadline = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let error = Error::Timeout { correlation_id, after };
            if resolve(&pending, correlation_id, Err(error)) {
                debug!(correlation_id, ?after, "invocation timed out");
            }
        })
        .abort_handle();

        match self.pending.get_mut(&correlation_id) {
            Some(mut entry) => entry.deadline = Some(deadline),
            None => deadline.abort(),
        }

        // Checked after inserting so a concurrent shutdown either drains the
        // entry or is seen here.
        if self.closed.load(Ordering::SeqCst) {
            let error = Error::Connection("client is shut down".into());
            resolve(&self.pending, correlation_id, Err(error.clone()));
            return Err(error);
        }

        Ok((correlation_id, rx))
    }

    async fn send_and_await(
        &self,
        correlation_id: u64,
        request: &Request,
        target: &Address,
        rx: oneshot::Receiver<Result<Vec<u8>>>,
    ) -> Result<Vec<u8>> {
        let payload = Frame::request(correlation_id, request).encode();

        if let Err(e) = self.transport.send(target, &payload).await {
            warn!(correlation_id, target = %target, error = %e, "send failed");
            let error = Error::Connection(format!("send to {} failed: {}", target, e));
            resolve(&self.pending, correlation_id, Err(error));
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Connection("invocation was dropped".into())),
        }
    }
}

impl Drop for InvocationService {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

/// Claims and resolves one invocation. Returns false if it was already gone.
fn resolve(pending: &DashMap<u64, Pending>, correlation_id: u64, outcome: Result<Vec<u8>>) -> bool {
    let Some((_, entry)) = pending.remove(&correlation_id) else {
        return false;
    };

    if let Some(deadline) = entry.deadline {
        deadline.abort();
    }

    // The caller may have given up and dropped the receiver.
    let _ = entry.tx.send(outcome);
    true
}

fn fail_where(pending: &DashMap<u64, Pending>, matches: impl Fn(&Pending) -> bool, error: &Error) -> usize {
    let ids: Vec<u64> = pending
        .iter()
        .filter(|entry| matches(entry.value()))
        .map(|entry| *entry.key())
        .collect();

    ids.into_iter()
        .filter(|id| resolve(pending, *id, Err(error.clone())))
        .count()
}

async fn receive_loop(transport: Arc<dyn Transport>, completions: mpsc::UnboundedSender<Completion>) {
    let reason = loop {
        let completion = match transport.recv().await {
            Ok(Some(Inbound::Frame(bytes))) => match Frame::decode(&bytes) {
                Ok(Frame::Reply { correlation_id, status }) => Completion::Reply {
                    correlation_id,
                    outcome: status.map_err(Error::Invocation),
                },
                Ok(Frame::Event { correlation_id, body }) => Completion::Event { correlation_id, body },
                Ok(Frame::Request { correlation_id, .. }) => {
                    warn!(correlation_id, "ignoring request frame sent by the cluster");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "dropping malformed frame");
                    continue;
                }
            },
            Ok(Some(Inbound::Disconnected(address))) => Completion::TargetLost(address),
            Ok(None) => break "transport closed".to_string(),
            Err(e) => break e.to_string(),
        };

        if completions.send(completion).is_err() {
            return;
        }
    };

    let _ = completions.send(Completion::TransportClosed(reason));
}

async fn completion_loop(
    mut completions: mpsc::UnboundedReceiver<Completion>,
    pending: Arc<DashMap<u64, Pending>>,
    listeners: Arc<ListenerService>,
) {
    while let Some(completion) = completions.recv().await {
        match completion {
            Completion::Reply { correlation_id, outcome } => {
                if !resolve(&pending, correlation_id, outcome) {
                    debug!(correlation_id, "ignoring reply for unknown invocation");
                }
            }
            Completion::Event { correlation_id, body } => {
                listeners.dispatch(correlation_id, &body);
            }
            Completion::TargetLost(address) => {
                let error = Error::Connection(format!("connection to {} lost", address));
                let failed = fail_where(&pending, |p| p.target == address, &error);
                warn!(address = %address, failed, "connection to member lost");
            }
            Completion::TransportClosed(reason) => {
                let error = Error::Connection(reason.clone());
                let failed = fail_where(&pending, |_| true, &error);
                warn!(reason = %reason, failed, "transport closed");
            }
        }
    }
}
