//! In-process cluster for tests.
//!
//! `MockCluster` implements `Transport` by answering every request itself.
//! Replies travel back through an mpsc channel, the same way a real transport
//! would multiplex them onto its receive stream. Behaviour can be bent per
//! address (silent, unreachable) or per message type (failing, delayed), and
//! every request is recorded for later assertions.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::address::Address;
use crate::address::Member;
use crate::codec;
use crate::codec::Frame;
use crate::codec::MembershipEvent;
use crate::codec::MessageType;
use crate::codec::RemoteFailure;
use crate::transport;
use crate::transport::Inbound;
use crate::transport::Transport;
use crate::transport::TransportError;

/// Reply code used when the requested cluster name does not match.
pub const CLUSTER_NAME_MISMATCH: u16 = 0x0101;

/// A request as it reached the mock cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedRequest {
    pub target: Address,
    pub correlation_id: u64,
    pub message_type: MessageType,
    pub body: Vec<u8>,
}

#[derive(Default)]
struct State {
    members: Vec<Member>,
    partitions: Vec<(u32, Address)>,
    silent: HashSet<Address>,
    unreachable: HashSet<Address>,
    failing: HashMap<MessageType, RemoteFailure>,
    delays: HashMap<MessageType, Duration>,
    membership_listeners: Vec<u64>,
    requests: Vec<RecordedRequest>,
}

pub struct MockCluster {
    cluster_name: String,
    state: Mutex<State>,
    tx: mpsc::UnboundedSender<Inbound>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
}

impl MockCluster {
    pub fn new(cluster_name: impl Into<String>, members: Vec<Member>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            cluster_name: cluster_name.into(),
            state: Mutex::new(State {
                members,
                ..State::default()
            }),
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_partitions(&self, partitions: Vec<(u32, Address)>) {
        self.state().partitions = partitions;
    }

    /// A silent member accepts requests but never answers them.
    pub fn set_silent(&self, address: &Address, silent: bool) {
        let mut state = self.state();
        if silent {
            state.silent.insert(address.clone());
        } else {
            state.silent.remove(address);
        }
    }

    /// Sending to an unreachable member fails immediately.
    pub fn set_unreachable(&self, address: &Address, unreachable: bool) {
        let mut state = self.state();
        if unreachable {
            state.unreachable.insert(address.clone());
        } else {
            state.unreachable.remove(address);
        }
    }

    /// Answers every request of `message_type` with an error reply.
    pub fn fail_requests(&self, message_type: MessageType, code: u16, message: impl Into<String>) {
        let failure = RemoteFailure {
            code,
            message: message.into(),
        };
        self.state().failing.insert(message_type, failure);
    }

    /// Holds back replies to `message_type` for `delay`.
    pub fn delay_replies(&self, message_type: MessageType, delay: Duration) {
        self.state().delays.insert(message_type, delay);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state().requests.clone()
    }

    pub fn request_count(&self, message_type: MessageType) -> usize {
        self.state()
            .requests
            .iter()
            .filter(|request| request.message_type == message_type)
            .count()
    }

    /// Adds a member and tells every membership listener about it.
    pub fn add_member(&self, member: Member) {
        let listeners = {
            let mut state = self.state();
            state.members.push(member.clone());
            state.membership_listeners.clone()
        };
        self.broadcast(&listeners, &MembershipEvent::Added(member));
    }

    /// Removes a member and tells every membership listener about it.
    pub fn remove_member(&self, member: &Member) {
        let listeners = {
            let mut state = self.state();
            state.members.retain(|m| m != member);
            state.membership_listeners.clone()
        };
        self.broadcast(&listeners, &MembershipEvent::Removed(member.clone()));
    }

    /// Pushes an event frame for the registration `correlation_id`.
    pub fn push_event(&self, correlation_id: u64, body: Vec<u8>) {
        self.push(Frame::Event { correlation_id, body });
    }

    /// Pushes a raw reply, as if a member answered `correlation_id`.
    pub fn push_reply(&self, correlation_id: u64, body: Vec<u8>) {
        self.push(Frame::Reply {
            correlation_id,
            status: Ok(body),
        });
    }

    /// Reports the connection to `address` as lost.
    pub fn disconnect(&self, address: &Address) {
        let _ = self.tx.send(Inbound::Disconnected(address.clone()));
    }

    fn broadcast(&self, listeners: &[u64], event: &MembershipEvent) {
        let body = event.encode();
        for correlation_id in listeners {
            self.push_event(*correlation_id, body.clone());
        }
    }

    fn push(&self, frame: Frame) {
        // The receiver lives as long as `self`.
        let _ = self.tx.send(Inbound::Frame(frame.encode()));
    }

    /// Computes the reply for one request. `None` means stay silent.
    fn answer(
        &self,
        target: &Address,
        correlation_id: u64,
        message_type: MessageType,
        body: &[u8],
    ) -> Option<(Result<Vec<u8>, RemoteFailure>, Option<Duration>)> {
        let mut state = self.state();
        state.requests.push(RecordedRequest {
            target: target.clone(),
            correlation_id,
            message_type,
            body: body.to_vec(),
        });

        if state.silent.contains(target) {
            return None;
        }

        let delay = state.delays.get(&message_type).copied();
        if let Some(failure) = state.failing.get(&message_type) {
            return Some((Err(failure.clone()), delay));
        }

        let status = match message_type {
            MessageType::MemberList => match codec::decode_member_list(body) {
                Ok(name) if name == self.cluster_name => Ok(codec::encode_members(&state.members)),
                Ok(name) => Err(RemoteFailure {
                    code: CLUSTER_NAME_MISMATCH,
                    message: format!("cluster name mismatch: expected {}, got {}", self.cluster_name, name),
                }),
                Err(e) => Err(RemoteFailure {
                    code: 0,
                    message: e.to_string(),
                }),
            },
            MessageType::AddMembershipListener => {
                state.membership_listeners.push(correlation_id);
                Ok(Vec::new())
            }
            MessageType::PartitionTable => Ok(codec::encode_partitions(&state.partitions)),
            MessageType::CreateProxy | MessageType::DestroyProxy | MessageType::Ping => Ok(Vec::new()),
            MessageType::Custom(_) => Ok(body.to_vec()),
        };
        Some((status, delay))
    }
}

#[async_trait::async_trait]
impl Transport for MockCluster {
    async fn send(&self, address: &Address, payload: &[u8]) -> transport::Result<()> {
        if self.state().unreachable.contains(address) {
            return Err(TransportError::ConnectionLost(format!("{} is unreachable", address)));
        }

        let (correlation_id, message_type, body) = match Frame::decode(payload) {
            Ok(Frame::Request {
                correlation_id,
                message_type,
                body,
            }) => (correlation_id, message_type, body),
            Ok(_) => return Err(TransportError::Io("expected a request frame".into())),
            Err(e) => return Err(TransportError::Io(e.to_string())),
        };

        let Some((status, delay)) = self.answer(address, correlation_id, message_type, &body) else {
            return Ok(());
        };

        let reply = Inbound::Frame(Frame::Reply { correlation_id, status }.encode());
        match delay {
            Some(delay) => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(reply);
                });
            }
            None => {
                let _ = self.tx.send(reply);
            }
        }
        Ok(())
    }

    async fn recv(&self) -> transport::Result<Option<Inbound>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }
}
