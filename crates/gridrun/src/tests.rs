//! Unit tests for the codec, configuration, lifecycle, load balancing,
//! invocations and the proxy registry, driven by the mock cluster.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;

use crate::address::Address;
use crate::address::Member;
use crate::cluster::ClusterService;
use crate::codec;
use crate::codec::Frame;
use crate::codec::MembershipEvent;
use crate::codec::MessageType;
use crate::codec::RemoteFailure;
use crate::codec::Request;
use crate::config::ClientConfig;
use crate::config::ConfigError;
use crate::config::LoadBalancerKind;
use crate::error::Error;
use crate::invocation::InvocationService;
use crate::lifecycle::LifecycleEvent;
use crate::lifecycle::LifecycleService;
use crate::lifecycle::LifecycleState;
use crate::listener::ListenerService;
use crate::load_balancer;
use crate::load_balancer::LoadBalancer;
use crate::load_balancer::RandomLoadBalancer;
use crate::load_balancer::RoundRobinLoadBalancer;
use crate::mock_transport::MockCluster;
use crate::proxy;
use crate::proxy::Proxy;
use crate::registry::ProxyRegistry;

fn addr(port: u16) -> Address {
    Address::new("127.0.0.1", port)
}

fn member(port: u16) -> Member {
    Member::new(addr(port), format!("member-{}", port))
}

fn echo(body: &[u8]) -> Request {
    Request::new(MessageType::Custom(0x0100), body.to_vec())
}

/// Invocation stack wired to a mock cluster, without the runtime around it.
struct Harness {
    mock: Arc<MockCluster>,
    cluster: Arc<ClusterService>,
    invocation: Arc<InvocationService>,
    registry: ProxyRegistry,
}

fn harness(config: ClientConfig, members: Vec<Member>) -> Harness {
    let lifecycle = Arc::new(LifecycleService::new());
    let cluster = Arc::new(ClusterService::new(&config, lifecycle));
    cluster.apply_member_list(members.clone());

    let mock = Arc::new(MockCluster::new(config.cluster_name(), members));
    let load_balancer = load_balancer::from_kind(config.load_balancer(), Arc::clone(&cluster));
    let invocation = Arc::new(InvocationService::new(
        &config,
        mock.clone(),
        Arc::clone(&load_balancer),
        Arc::new(ListenerService::new()),
    ));
    let registry = ProxyRegistry::new(Arc::clone(&invocation), load_balancer);

    Harness {
        mock,
        cluster,
        invocation,
        registry,
    }
}

fn default_harness() -> Harness {
    harness(ClientConfig::default(), vec![member(5701)])
}

async fn wait_for_pending(invocation: &InvocationService, count: usize) {
    while invocation.pending_count() < count {
        tokio::task::yield_now().await;
    }
}

// --- Codec ---

#[test]
fn test_frame_roundtrip_every_kind() {
    let frames = vec![
        Frame::Request {
            correlation_id: 1,
            message_type: MessageType::CreateProxy,
            body: b"payload".to_vec(),
        },
        Frame::Reply {
            correlation_id: 2,
            status: Ok(b"result".to_vec()),
        },
        Frame::Reply {
            correlation_id: 3,
            status: Err(RemoteFailure {
                code: 42,
                message: "rejected".into(),
            }),
        },
        Frame::Event {
            correlation_id: u64::MAX,
            body: Vec::new(),
        },
    ];

    for frame in frames {
        let decoded = Frame::decode(&frame.encode()).expect("decode");
        assert_eq!(decoded, frame);
    }
}

#[test]
fn test_frame_rejects_truncated_input() {
    let bytes = Frame::Event {
        correlation_id: 7,
        body: b"abc".to_vec(),
    }
    .encode();

    for len in 0..bytes.len() {
        let err = Frame::decode(&bytes[..len]).unwrap_err();
        assert!(
            matches!(err, codec::Error::UnexpectedEnd { .. }),
            "length {} gave {:?}",
            len,
            err
        );
    }
}

#[test]
fn test_frame_rejects_unknown_tag_and_trailing_bytes() {
    let mut unknown = vec![0x09];
    unknown.extend_from_slice(&1u64.to_be_bytes());
    assert_eq!(Frame::decode(&unknown).unwrap_err(), codec::Error::UnknownTag(0x09));

    let mut trailing = Frame::Reply {
        correlation_id: 1,
        status: Ok(Vec::new()),
    }
    .encode();
    trailing.extend_from_slice(&[0, 0]);
    assert_eq!(Frame::decode(&trailing).unwrap_err(), codec::Error::TrailingBytes(2));
}

#[test]
fn test_control_messages() {
    let create = codec::encode_create_proxy("orders", proxy::MAP_SERVICE, &addr(5702));
    assert_eq!(create.message_type, MessageType::CreateProxy);
    let (object, service, target) = codec::decode_create_proxy(&create.body).unwrap();
    assert_eq!(object, "orders");
    assert_eq!(service, proxy::MAP_SERVICE);
    assert_eq!(target, addr(5702));

    let destroy = codec::encode_destroy_proxy("orders", proxy::MAP_SERVICE);
    assert_eq!(
        codec::decode_destroy_proxy(&destroy.body).unwrap(),
        ("orders".to_string(), proxy::MAP_SERVICE.to_string())
    );

    let members = vec![member(5701), member(5702)];
    assert_eq!(codec::decode_members(&codec::encode_members(&members)).unwrap(), members);

    let owners = vec![(0, addr(5701)), (1, addr(5702))];
    assert_eq!(codec::decode_partitions(&codec::encode_partitions(&owners)).unwrap(), owners);

    let event = MembershipEvent::Removed(member(5703));
    assert_eq!(MembershipEvent::decode(&event.encode()).unwrap(), event);
    assert_eq!(MembershipEvent::decode(&[9]).unwrap_err(), codec::Error::UnknownTag(9));
}

#[test]
fn test_message_type_codes() {
    for message_type in [
        MessageType::CreateProxy,
        MessageType::DestroyProxy,
        MessageType::Ping,
        MessageType::MemberList,
        MessageType::AddMembershipListener,
        MessageType::PartitionTable,
        MessageType::Custom(0x0200),
    ] {
        assert_eq!(MessageType::from_code(message_type.code()), message_type);
    }
}

// --- Address & Config ---

#[test]
fn test_address_parse() {
    let parsed: Address = "10.0.0.1:5701".parse().unwrap();
    assert_eq!(parsed, Address::new("10.0.0.1", 5701));
    assert_eq!(parsed.to_string(), "10.0.0.1:5701");

    assert!("no-port".parse::<Address>().is_err());
    assert!(":5701".parse::<Address>().is_err());
    assert!("host:99999".parse::<Address>().is_err());
}

#[test]
fn test_config_defaults() {
    let config = ClientConfig::builder().build().unwrap();
    assert_eq!(config.cluster_name(), "dev");
    assert_eq!(config.addresses(), &[addr(5701)]);
    assert_eq!(config.invocation_timeout(), Duration::from_secs(5));
    assert_eq!(config.heartbeat_interval(), Duration::from_secs(5));
    assert_eq!(config.heartbeat_timeout(), Duration::from_secs(60));
    assert_eq!(config.connection_attempt_limit(), 2);
    assert_eq!(config.load_balancer(), LoadBalancerKind::Random);
}

#[test]
fn test_config_addresses_replace_default() {
    let config = ClientConfig::builder()
        .address("10.0.0.1:5701")
        .address("10.0.0.2:5702")
        .build()
        .unwrap();
    assert_eq!(
        config.addresses(),
        &[Address::new("10.0.0.1", 5701), Address::new("10.0.0.2", 5702)]
    );
}

#[test]
fn test_config_validation() {
    let err = ClientConfig::builder().address("nowhere").build().unwrap_err();
    assert_eq!(err, ConfigError::InvalidAddress("nowhere".into()));

    let err = ClientConfig::builder()
        .invocation_timeout(Duration::ZERO)
        .build()
        .unwrap_err();
    assert_eq!(err, ConfigError::ZeroDuration("invocation_timeout"));

    let err = ClientConfig::builder()
        .connection_attempt_limit(0)
        .build()
        .unwrap_err();
    assert_eq!(err, ConfigError::ZeroAttemptLimit);

    let err = ClientConfig::builder()
        .heartbeat_interval(Duration::from_secs(10))
        .heartbeat_timeout(Duration::from_secs(5))
        .build()
        .unwrap_err();
    assert!(matches!(err, ConfigError::HeartbeatTimeoutTooShort { .. }));

    let wrapped: Error = err.into();
    assert!(matches!(wrapped, Error::Config(_)));
}

// --- Lifecycle ---

fn recording(lifecycle: &LifecycleService) -> Arc<Mutex<Vec<LifecycleEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    lifecycle.add_listener(move |event| sink.lock().unwrap().push(event.clone()));
    events
}

#[test]
fn test_lifecycle_moves_forward_one_step() {
    let lifecycle = LifecycleService::new();
    let events = recording(&lifecycle);

    assert_eq!(lifecycle.state(), None);
    assert!(!lifecycle.fire_lifecycle_event(LifecycleState::Started));
    assert!(lifecycle.fire_lifecycle_event(LifecycleState::Starting));
    assert!(!lifecycle.is_live());
    assert!(!lifecycle.fire_lifecycle_event(LifecycleState::Shutdown));
    assert!(lifecycle.fire_lifecycle_event(LifecycleState::Started));
    assert!(lifecycle.is_live());
    assert!(!lifecycle.fire_lifecycle_event(LifecycleState::Started));
    assert!(!lifecycle.fire_lifecycle_event(LifecycleState::Starting));
    assert!(lifecycle.fire_lifecycle_event(LifecycleState::ShuttingDown));
    assert!(!lifecycle.is_live());
    assert!(lifecycle.fire_lifecycle_event(LifecycleState::Shutdown));
    assert!(!lifecycle.fire_lifecycle_event(LifecycleState::Shutdown));

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            LifecycleEvent::Starting,
            LifecycleEvent::Started,
            LifecycleEvent::ShuttingDown,
            LifecycleEvent::Shutdown,
        ]
    );
}

#[test]
fn test_lifecycle_listeners_run_in_order_and_survive_panics() {
    let lifecycle = LifecycleService::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    let first = order.clone();
    lifecycle.add_listener(move |_| first.lock().unwrap().push("first"));
    lifecycle.add_listener(|_| panic!("listener failure"));
    let third = order.clone();
    lifecycle.add_listener(move |_| third.lock().unwrap().push("third"));

    assert!(lifecycle.fire_lifecycle_event(LifecycleState::Starting));
    assert_eq!(*order.lock().unwrap(), vec!["first", "third"]);
    assert_eq!(lifecycle.state(), Some(LifecycleState::Starting));
}

#[test]
fn test_lifecycle_remove_listener() {
    let lifecycle = LifecycleService::new();
    let count = Arc::new(Mutex::new(0));
    let sink = count.clone();
    let id = lifecycle.add_listener(move |_| *sink.lock().unwrap() += 1);

    lifecycle.fire_lifecycle_event(LifecycleState::Starting);
    assert!(lifecycle.remove_listener(id));
    assert!(!lifecycle.remove_listener(id));
    lifecycle.fire_lifecycle_event(LifecycleState::Started);

    assert_eq!(*count.lock().unwrap(), 1);
}

#[test]
fn test_lifecycle_concurrent_transition_has_one_winner() {
    let lifecycle = LifecycleService::new();
    lifecycle.fire_lifecycle_event(LifecycleState::Starting);
    lifecycle.fire_lifecycle_event(LifecycleState::Started);
    let events = recording(&lifecycle);

    let winners: usize = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| lifecycle.fire_lifecycle_event(LifecycleState::ShuttingDown)))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap() as usize)
            .sum()
    });

    assert_eq!(winners, 1);
    assert_eq!(*events.lock().unwrap(), vec![LifecycleEvent::ShuttingDown]);
}

// --- Cluster & Load Balancing ---

fn cluster_with(members: Vec<Member>) -> (Arc<ClusterService>, Arc<Mutex<Vec<LifecycleEvent>>>) {
    let lifecycle = Arc::new(LifecycleService::new());
    let events = recording(&lifecycle);
    let cluster = Arc::new(ClusterService::new(&ClientConfig::default(), lifecycle));
    cluster.apply_member_list(members);
    (cluster, events)
}

#[test]
fn test_member_list_changes_are_announced() {
    let (cluster, events) = cluster_with(vec![member(1), member(2)]);
    events.lock().unwrap().clear();

    cluster.apply_member_list(vec![member(2), member(3)]);

    assert_eq!(cluster.members(), vec![member(2), member(3)]);
    assert_eq!(
        *events.lock().unwrap(),
        vec![
            LifecycleEvent::MemberRemoved(member(1)),
            LifecycleEvent::MemberAdded(member(3)),
        ]
    );
}

#[test]
fn test_random_balancer_picks_only_members() {
    let (cluster, _) = cluster_with(vec![member(1), member(2), member(3)]);
    let balancer = RandomLoadBalancer::new(cluster.clone());
    let addresses = cluster.member_addresses();

    for _ in 0..100 {
        assert!(addresses.contains(&balancer.next_address().unwrap()));
    }

    cluster.apply_member_list(vec![member(9)]);
    for _ in 0..10 {
        assert_eq!(balancer.next_address().unwrap(), addr(9));
    }
}

#[test]
fn test_round_robin_balancer_cycles() {
    let (cluster, _) = cluster_with(vec![member(1), member(2), member(3)]);
    let balancer = RoundRobinLoadBalancer::new(cluster);

    let picks: Vec<u16> = (0..6).map(|_| balancer.next_address().unwrap().port()).collect();
    assert_eq!(picks, vec![1, 2, 3, 1, 2, 3]);
}

#[test]
fn test_balancers_fail_without_members() {
    let (cluster, _) = cluster_with(Vec::new());
    for kind in [LoadBalancerKind::Random, LoadBalancerKind::RoundRobin] {
        let balancer = load_balancer::from_kind(kind, cluster.clone());
        assert!(matches!(balancer.next_address(), Err(Error::NoAvailableMember)));
    }
}

// --- Listener service ---

#[test]
fn test_listener_dispatch() {
    let listeners = ListenerService::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    listeners.register(5, Arc::new(move |body: &[u8]| sink.lock().unwrap().push(body.to_vec())));

    listeners.dispatch(5, b"one");
    listeners.dispatch(6, b"nobody");
    assert!(listeners.deregister(5));
    listeners.dispatch(5, b"two");

    assert_eq!(*seen.lock().unwrap(), vec![b"one".to_vec()]);
    assert_eq!(listeners.registration_count(), 0);
}

// --- Invocations ---

#[tokio::test]
async fn test_invoke_on_target_round_trip() {
    let h = default_harness();

    let reply = h.invocation.invoke_on_target(echo(b"hello"), addr(5701)).await.unwrap();
    assert_eq!(reply, b"hello");

    let reply = h.invocation.invoke_on_random_target(echo(b"again")).await.unwrap();
    assert_eq!(reply, b"again");

    let ids: Vec<u64> = h.mock.requests().iter().map(|r| r.correlation_id).collect();
    assert_eq!(ids, vec![1, 2]);
    assert_eq!(h.invocation.pending_count(), 0);
}

#[tokio::test]
async fn test_remote_error_surfaces_as_invocation_failure() {
    let h = default_harness();
    h.mock.fail_requests(MessageType::Custom(0x0100), 13, "no such key");

    let err = h.invocation.invoke_on_target(echo(b"x"), addr(5701)).await.unwrap_err();
    match err {
        Error::Invocation(failure) => {
            assert_eq!(failure.code, 13);
            assert_eq!(failure.message, "no such key");
        }
        other => panic!("Expected Invocation, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_invocation_times_out_not_before_deadline() {
    let config = ClientConfig::builder()
        .invocation_timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    let h = harness(config, vec![member(5701)]);
    h.mock.set_silent(&addr(5701), true);

    let started = tokio::time::Instant::now();
    let invocation = h.invocation.clone();
    let call = tokio::spawn(async move { invocation.invoke_on_target(echo(b"x"), addr(5701)).await });

    tokio::time::sleep(Duration::from_millis(4_999)).await;
    assert!(!call.is_finished());
    assert_eq!(h.invocation.pending_count(), 1);

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Timeout { correlation_id: 1, .. }), "got {:?}", err);
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(h.invocation.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_late_and_unknown_replies_are_ignored() {
    let h = default_harness();
    h.mock.set_silent(&addr(5701), true);

    let err = h.invocation.invoke_on_target(echo(b"x"), addr(5701)).await.unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }));

    // The reply for the timed-out id and one for an id never issued.
    h.mock.push_reply(1, b"late".to_vec());
    h.invocation.complete(999, Ok(Vec::new()));

    h.mock.set_silent(&addr(5701), false);
    let reply = h.invocation.invoke_on_target(echo(b"fresh"), addr(5701)).await.unwrap();
    assert_eq!(reply, b"fresh");
}

#[tokio::test]
async fn test_external_completion_resolves_invocation() {
    let h = default_harness();
    h.mock.set_silent(&addr(5701), true);

    let invocation = h.invocation.clone();
    let call = tokio::spawn(async move { invocation.invoke_on_target(echo(b"x"), addr(5701)).await });
    wait_for_pending(&h.invocation, 1).await;

    h.invocation.complete(1, Ok(b"completed".to_vec()));
    assert_eq!(call.await.unwrap().unwrap(), b"completed");
}

#[tokio::test]
async fn test_send_failure_is_connection_error() {
    let h = default_harness();
    h.mock.set_unreachable(&addr(5701), true);

    let err = h.invocation.invoke_on_target(echo(b"x"), addr(5701)).await.unwrap_err();
    assert!(matches!(err, Error::Connection(_)), "got {:?}", err);
    assert_eq!(h.invocation.pending_count(), 0);
}

#[tokio::test]
async fn test_disconnect_fails_only_that_target() {
    let h = harness(ClientConfig::default(), vec![member(5701), member(5702)]);
    h.mock.set_silent(&addr(5701), true);
    h.mock.set_silent(&addr(5702), true);

    let first = h.invocation.clone();
    let lost = tokio::spawn(async move { first.invoke_on_target(echo(b"a"), addr(5701)).await });
    let second = h.invocation.clone();
    let kept = tokio::spawn(async move { second.invoke_on_target(echo(b"b"), addr(5702)).await });
    wait_for_pending(&h.invocation, 2).await;

    h.mock.disconnect(&addr(5701));
    let err = lost.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Connection(_)), "got {:?}", err);
    assert!(!kept.is_finished());

    assert_eq!(h.invocation.fail_target(&addr(5702), "test"), 1);
    assert!(matches!(kept.await.unwrap(), Err(Error::Connection(_))));
}

#[tokio::test]
async fn test_shutdown_fails_pending_and_later_invocations() {
    let h = default_harness();
    h.mock.set_silent(&addr(5701), true);

    let invocation = h.invocation.clone();
    let call = tokio::spawn(async move { invocation.invoke_on_target(echo(b"x"), addr(5701)).await });
    wait_for_pending(&h.invocation, 1).await;

    h.invocation.shutdown();
    h.invocation.shutdown();

    assert!(matches!(call.await.unwrap(), Err(Error::Connection(_))));
    let err = h.invocation.invoke_on_target(echo(b"y"), addr(5701)).await.unwrap_err();
    assert!(matches!(err, Error::Connection(_)), "got {:?}", err);
    assert_eq!(h.invocation.pending_count(), 0);
    assert_eq!(h.mock.request_count(MessageType::Custom(0x0100)), 1);
}

#[tokio::test]
async fn test_nothing_is_sent_after_shutdown() {
    let h = default_harness();
    h.invocation.shutdown();

    let err = h.invocation.invoke_on_random_target(echo(b"x")).await.unwrap_err();
    assert!(matches!(err, Error::Connection(_)), "got {:?}", err);

    let err = h.registry.get_or_create_proxy(proxy::MAP_SERVICE, "late").await.unwrap_err();
    assert!(matches!(err, Error::Connection(_)), "got {:?}", err);

    let handler = Arc::new(|_: &[u8]| {});
    let err = h
        .invocation
        .invoke_listener(codec::encode_add_membership_listener(), addr(5701), handler)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Connection(_)), "got {:?}", err);

    assert!(h.mock.requests().is_empty());
    assert_eq!(h.registry.proxy_count(), 0);
    assert_eq!(h.invocation.pending_count(), 0);
}

#[tokio::test]
async fn test_listener_receives_events_pushed_for_its_registration() {
    let h = default_harness();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let registration = h
        .invocation
        .invoke_listener(
            codec::encode_add_membership_listener(),
            addr(5701),
            Arc::new(move |body: &[u8]| {
                let _ = tx.send(body.to_vec());
            }),
        )
        .await
        .unwrap();

    h.mock.push_event(registration, b"event-1".to_vec());
    h.mock.push_event(registration + 100, b"stray".to_vec());
    h.mock.push_event(registration, b"event-2".to_vec());

    assert_eq!(rx.recv().await.unwrap(), b"event-1");
    assert_eq!(rx.recv().await.unwrap(), b"event-2");
}

// --- Proxy registry ---

#[tokio::test(start_paused = true)]
async fn test_concurrent_first_callers_share_one_create() {
    let h = default_harness();
    h.mock.delay_replies(MessageType::CreateProxy, Duration::from_millis(50));

    let calls = (0..16).map(|_| h.registry.get_or_create_proxy(proxy::MAP_SERVICE, "orders"));
    let proxies: Vec<Proxy> = join_all(calls)
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(h.mock.request_count(MessageType::CreateProxy), 1);
    assert_eq!(h.registry.proxy_count(), 1);
    assert!(proxies.iter().all(|p| p.same_instance(&proxies[0])));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_first_callers_share_one_create() {
    let h = default_harness();
    h.mock.delay_replies(MessageType::CreateProxy, Duration::from_millis(20));
    let mock = h.mock.clone();
    let registry = Arc::new(h.registry);

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.get_or_create_proxy(proxy::MAP_SERVICE, "orders").await })
        })
        .collect();

    let mut proxies: Vec<Proxy> = Vec::new();
    for task in tasks {
        proxies.push(task.await.unwrap().unwrap());
    }

    assert_eq!(mock.request_count(MessageType::CreateProxy), 1);
    assert_eq!(registry.proxy_count(), 1);
    assert!(proxies.iter().all(|p| p.same_instance(&proxies[0])));
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_creator_does_not_cause_second_create() {
    let h = default_harness();
    h.mock.delay_replies(MessageType::CreateProxy, Duration::from_millis(50));

    let abandoned = tokio::time::timeout(
        Duration::from_millis(10),
        h.registry.get_or_create_proxy(proxy::MAP_SERVICE, "orders"),
    )
    .await;
    assert!(abandoned.is_err());

    let created = h.registry.get_or_create_proxy(proxy::MAP_SERVICE, "orders").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.mock.request_count(MessageType::CreateProxy), 1);
    assert_eq!(created.name(), "orders");
    assert!(h.registry.contains(proxy::MAP_SERVICE, "orders"));
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_destroy_still_reaches_cluster() {
    let h = default_harness();
    h.registry.get_or_create_proxy(proxy::MAP_SERVICE, "orders").await.unwrap();
    h.mock.delay_replies(MessageType::DestroyProxy, Duration::from_millis(50));

    let abandoned = tokio::time::timeout(
        Duration::from_millis(10),
        h.registry.destroy_proxy(proxy::MAP_SERVICE, "orders"),
    )
    .await;
    assert!(abandoned.is_err());
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.mock.request_count(MessageType::DestroyProxy), 1);
    assert!(!h.registry.contains(proxy::MAP_SERVICE, "orders"));

    h.registry.get_or_create_proxy(proxy::MAP_SERVICE, "orders").await.unwrap();
    assert_eq!(h.mock.request_count(MessageType::CreateProxy), 2);
}

#[tokio::test]
async fn test_distinct_identities_are_separate_proxies() {
    let h = default_harness();

    let map = h.registry.get_or_create_proxy(proxy::MAP_SERVICE, "a").await.unwrap();
    let other_map = h.registry.get_or_create_proxy(proxy::MAP_SERVICE, "b").await.unwrap();
    let queue = h.registry.get_or_create_proxy(proxy::QUEUE_SERVICE, "a").await.unwrap();

    assert!(matches!(map, Proxy::Map(_)));
    assert!(matches!(queue, Proxy::Queue(_)));
    assert!(!map.same_instance(&other_map));
    assert_eq!(queue.name(), "a");
    assert_eq!(queue.service_name(), proxy::QUEUE_SERVICE);
    assert_eq!(h.registry.proxy_count(), 3);
    assert_eq!(h.mock.request_count(MessageType::CreateProxy), 3);
}

#[tokio::test]
async fn test_every_service_name_has_a_proxy_kind() {
    let h = default_harness();
    for service in proxy::SERVICE_NAMES {
        let created = h.registry.get_or_create_proxy(service, "obj").await.unwrap();
        assert_eq!(created.service_name(), *service);
    }
    assert_eq!(h.registry.proxy_count(), 10);
}

#[tokio::test]
async fn test_create_request_names_the_chosen_member() {
    let h = default_harness();
    h.registry.get_or_create_proxy(proxy::TOPIC_SERVICE, "news").await.unwrap();

    let requests = h.mock.requests();
    let create = requests
        .iter()
        .find(|r| r.message_type == MessageType::CreateProxy)
        .expect("create request");
    let (object, service, target) = codec::decode_create_proxy(&create.body).unwrap();
    assert_eq!(object, "news");
    assert_eq!(service, proxy::TOPIC_SERVICE);
    assert_eq!(target, create.target);
}

#[tokio::test]
async fn test_destroy_is_idempotent() {
    let h = default_harness();
    h.registry.get_or_create_proxy(proxy::SET_SERVICE, "s").await.unwrap();

    assert!(h.registry.destroy_proxy(proxy::SET_SERVICE, "s").await.unwrap());
    assert!(!h.registry.destroy_proxy(proxy::SET_SERVICE, "s").await.unwrap());
    assert!(!h.registry.destroy_proxy(proxy::SET_SERVICE, "never").await.unwrap());

    assert_eq!(h.mock.request_count(MessageType::DestroyProxy), 1);
    assert!(!h.registry.contains(proxy::SET_SERVICE, "s"));
}

#[tokio::test]
async fn test_create_after_destroy_creates_again() {
    let h = default_harness();
    let first = h.registry.get_or_create_proxy(proxy::LIST_SERVICE, "l").await.unwrap();
    h.registry.destroy_proxy(proxy::LIST_SERVICE, "l").await.unwrap();
    let second = h.registry.get_or_create_proxy(proxy::LIST_SERVICE, "l").await.unwrap();

    assert_eq!(h.mock.request_count(MessageType::CreateProxy), 2);
    assert!(!first.same_instance(&second));
}

#[tokio::test]
async fn test_failed_remote_destroy_still_evicts() {
    let h = default_harness();
    h.registry.get_or_create_proxy(proxy::MAP_SERVICE, "m").await.unwrap();
    h.mock.fail_requests(MessageType::DestroyProxy, 3, "busy");

    let err = h.registry.destroy_proxy(proxy::MAP_SERVICE, "m").await.unwrap_err();
    assert!(matches!(err, Error::Invocation(_)));
    assert!(!h.registry.contains(proxy::MAP_SERVICE, "m"));
}

#[tokio::test]
async fn test_unknown_service_never_reaches_cluster() {
    let h = default_harness();

    let err = h
        .registry
        .get_or_create_proxy("hz:impl:noSuchService", "x")
        .await
        .unwrap_err();

    assert!(matches!(err, Error::UnknownService(ref name) if name == "hz:impl:noSuchService"));
    assert!(h.mock.requests().is_empty());
    assert_eq!(h.registry.proxy_count(), 0);
}

#[tokio::test]
async fn test_failed_create_caches_nothing() {
    let h = default_harness();
    h.mock.fail_requests(MessageType::CreateProxy, 1, "refused");

    let err = h.registry.get_or_create_proxy(proxy::MAP_SERVICE, "m").await.unwrap_err();
    assert!(matches!(err, Error::Invocation(_)));
    assert_eq!(h.registry.proxy_count(), 0);
}

#[tokio::test]
async fn test_create_without_members_fails() {
    let h = harness(ClientConfig::default(), Vec::new());
    let err = h.registry.get_or_create_proxy(proxy::MAP_SERVICE, "m").await.unwrap_err();
    assert!(matches!(err, Error::NoAvailableMember));
    assert!(h.cluster.members().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reference_ids_are_distinct_and_dense() {
    let h = default_harness();
    let registry = Arc::new(h.registry);

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move { (0..100).map(|_| registry.next_reference_id()).collect::<Vec<_>>() })
        })
        .collect();

    let mut ids: Vec<i64> = Vec::new();
    for task in tasks {
        ids.extend(task.await.unwrap());
    }
    ids.sort_unstable();

    assert_eq!(ids, (1..=800).collect::<Vec<i64>>());
}
