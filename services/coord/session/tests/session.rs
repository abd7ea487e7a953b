use bytes::Bytes;
use futures::StreamExt;
use coord_resource::backend::MemoryTransport;
use coord_resource::{
    DiscoveryFilter, StreamDescriptor, Transport, COORDINATION_STREAM_TYPE,
};
use coord_runtime::{Layer, StreamError, StreamState};
use coord_session::election::NETWORK_PROPERTY;
use coord_session::{
    ConnectionTestConfig, CoordinationConfig, CoordinationSession, SessionError, SessionEvent,
    SessionEventKind,
};
use coord_state::CoordinationPhase;
use coord_wire::{
    decode_frame, encode_frame, CoordinationMessage, Heartbeat, JoinRequest, MessageType, Node,
    StreamConfig,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(5);

fn fast_config(network: &str, max_nodes: usize) -> CoordinationConfig {
    CoordinationConfig {
        network_name: network.to_string(),
        max_nodes,
        heartbeat_interval: Duration::from_millis(50),
        node_timeout: Duration::from_millis(500),
        discovery_interval: Duration::from_millis(50),
        discovery_rounds: 3,
        join_timeout: Duration::from_secs(5),
        connection_test: ConnectionTestConfig {
            max_retries: 3,
            timeout: Duration::from_millis(200),
            retry_delay: Duration::from_millis(50),
        },
        ..CoordinationConfig::default()
    }
}

fn session(transport: &MemoryTransport, config: &CoordinationConfig, name: &str) -> CoordinationSession {
    let transport: Arc<dyn Transport> = Arc::new(transport.clone());
    CoordinationSession::new(config.clone(), Node::generate(name), transport).unwrap()
}

async fn next_event<F>(events: &mut broadcast::Receiver<SessionEvent>, matches: F) -> SessionEventKind
where
    F: Fn(&SessionEventKind) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event.kind) => return event.kind,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("expected event did not arrive")
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn topology_uids(session: &CoordinationSession) -> BTreeSet<String> {
    session
        .snapshot()
        .await
        .topology
        .iter()
        .map(|node| node.uid().to_string())
        .collect()
}

#[tokio::test]
async fn test_basic_join_and_capacity() {
    let transport = MemoryTransport::default();
    let config = fast_config("basic", 2);

    let coordinator = session(&transport, &config, "coordinator");
    coordinator.join().await.unwrap();
    assert!(coordinator.is_coordinator());
    assert_eq!(coordinator.phase(), CoordinationPhase::Ready);

    let a = session(&transport, &config, "a");
    a.join().await.unwrap();
    assert!(!a.is_coordinator());
    assert_eq!(a.phase(), CoordinationPhase::Ready);
    assert_eq!(
        a.snapshot().await.coordinator_uid.as_deref(),
        Some(coordinator.local().uid())
    );

    let b = session(&transport, &config, "b");
    b.join().await.unwrap();
    coordinator.wait_for_nodes(3, WAIT).await.unwrap();

    let expected: BTreeSet<String> = [&coordinator, &a, &b]
        .iter()
        .map(|s| s.local().uid().to_string())
        .collect();
    assert_eq!(topology_uids(&coordinator).await, expected);

    // Participants converge on the coordinator's view through topology updates
    a.wait_for_nodes(3, WAIT).await.unwrap();
    assert_eq!(topology_uids(&a).await, expected);

    let c = session(&transport, &config, "c");
    let mut c_events = c.subscribe();
    let result = c.join().await;
    assert_eq!(
        result,
        Err(SessionError::JoinRejected("Maximum nodes reached".to_string()))
    );
    let failed = next_event(&mut c_events, |kind| matches!(kind, SessionEventKind::JoinFailed { .. })).await;
    assert!(matches!(failed, SessionEventKind::JoinFailed { reason } if reason.contains("Maximum nodes reached")));
    assert_eq!(c.phase(), CoordinationPhase::Idle);
    assert_eq!(coordinator.snapshot().await.topology.len(), 3);

    for s in [&c, &b, &a, &coordinator] {
        s.leave().await.unwrap();
    }
}

#[tokio::test]
async fn test_leave_converges_topology() {
    let transport = MemoryTransport::default();
    let config = fast_config("leave", 8);

    let coordinator = session(&transport, &config, "coordinator");
    coordinator.join().await.unwrap();
    let a = session(&transport, &config, "a");
    a.join().await.unwrap();
    let b = session(&transport, &config, "b");
    b.join().await.unwrap();
    a.wait_for_nodes(3, WAIT).await.unwrap();

    let mut coordinator_events = coordinator.subscribe();
    b.leave().await.unwrap();
    assert_eq!(b.phase(), CoordinationPhase::Disposing);
    assert_eq!(b.join().await, Err(SessionError::Disposed));
    assert_eq!(b.resource_usage().publishers, 0);
    assert_eq!(b.resource_usage().resolvers, 0);

    let left = next_event(&mut coordinator_events, |kind| matches!(kind, SessionEventKind::NodeLeft { .. })).await;
    assert!(matches!(left, SessionEventKind::NodeLeft { node } if node.uid() == b.local().uid()));

    let (a_ref, b_uid) = (&a, b.local().uid());
    eventually("participant to drop the leaver", move || async move {
        !topology_uids(a_ref).await.contains(b_uid)
    })
    .await;
    assert_eq!(a.snapshot().await.topology.len(), 2);

    // Leaving twice is harmless
    b.leave().await.unwrap();
    a.leave().await.unwrap();
    coordinator.leave().await.unwrap();
}

#[tokio::test]
async fn test_stream_lifecycle_follows_coordinator() {
    let transport = MemoryTransport::default();
    let config = fast_config("streams", 8);

    let coordinator = session(&transport, &config, "coordinator");
    coordinator.join().await.unwrap();
    let a = session(&transport, &config, "a");
    a.join().await.unwrap();
    coordinator.wait_for_nodes(2, WAIT).await.unwrap();

    // Control and data units never share an id
    assert!(coordinator.layers().is_disjoint());
    assert_eq!(coordinator.layers().units(Layer::Control).len(), 1);

    let mut coordinator_events = coordinator.subscribe();
    let producer = coordinator
        .create_stream(StreamConfig::new("s1", 1, 100.0))
        .await
        .unwrap();
    let ready = next_event(&mut coordinator_events, |kind| matches!(kind, SessionEventKind::StreamReady { .. })).await;
    assert_eq!(
        ready,
        SessionEventKind::StreamReady {
            stream: "s1".into(),
            node_uid: a.local().uid().to_string(),
        }
    );
    assert_eq!(coordinator.layers().units(Layer::Data), vec!["stream:s1".to_string()]);

    coordinator.start_stream("s1").await.unwrap();
    let consumer = a.stream("s1").await.expect("participant created s1");
    consumer.wait_for_state(StreamState::Active, WAIT).await.unwrap();
    let coordinator_ref = &coordinator;
    eventually("coordinator to become active", move || async move {
        coordinator_ref.phase() == CoordinationPhase::Active
    })
    .await;

    // Samples flow once the participant has found the producer
    let mut samples = consumer.subscribe();
    let received = tokio::time::timeout(WAIT, async {
        loop {
            producer.push(Bytes::from_static(b"sample")).await.unwrap();
            if let Ok(Ok(sample)) = tokio::time::timeout(Duration::from_millis(50), samples.recv()).await {
                return sample;
            }
        }
    })
    .await
    .expect("no sample reached the participant");
    assert_eq!(received, Bytes::from_static(b"sample"));

    coordinator.pause_stream("s1").await.unwrap();
    consumer.wait_for_state(StreamState::Paused, WAIT).await.unwrap();
    assert!(matches!(
        producer.push(Bytes::from_static(b"late")).await,
        Err(StreamError::InvalidState { .. })
    ));
    eventually("coordinator to pause", move || async move {
        coordinator_ref.phase() == CoordinationPhase::Paused
    })
    .await;

    coordinator.resume_stream("s1", true).await.unwrap();
    consumer.wait_for_state(StreamState::Active, WAIT).await.unwrap();

    coordinator.destroy_stream("s1").await.unwrap();
    assert!(producer.is_closed());
    assert!(coordinator.stream("s1").await.is_none());
    assert!(matches!(
        coordinator.start_stream("s1").await,
        Err(SessionError::Stream(StreamError::NotFound(_)))
    ));
    let a_ref = &a;
    eventually("participant to destroy s1", move || async move {
        a_ref.stream("s1").await.is_none()
    })
    .await;
    assert!(consumer.is_closed());

    a.leave().await.unwrap();
    coordinator.leave().await.unwrap();
}

#[tokio::test]
async fn test_user_messages_reach_participants() {
    let transport = MemoryTransport::default();
    let config = fast_config("messages", 8);

    let coordinator = session(&transport, &config, "coordinator");
    coordinator.join().await.unwrap();
    let a = session(&transport, &config, "a");
    a.join().await.unwrap();

    let mut a_events = a.subscribe();
    let mut payload = coord_wire::Metadata::new();
    payload.insert("greeting".into(), serde_json::json!("hello"));
    let message_id = coordinator.send_user_message(payload.clone()).await.unwrap();

    let received = next_event(&mut a_events, |kind| matches!(kind, SessionEventKind::UserMessage { .. })).await;
    assert_eq!(
        received,
        SessionEventKind::UserMessage {
            from: coordinator.local().uid().to_string(),
            message_id,
            payload,
        }
    );

    let mut a_stream = a.events();
    let mut settings = coord_wire::Metadata::new();
    settings.insert("sampleRate".into(), serde_json::json!(250));
    coordinator.update_config(settings.clone()).await.unwrap();

    let update = tokio::time::timeout(WAIT, async {
        while let Some(item) = a_stream.next().await {
            if let Ok(event) = item {
                if matches!(event.kind, SessionEventKind::ConfigUpdate { .. }) {
                    return event.kind;
                }
            }
        }
        panic!("event stream ended");
    })
    .await
    .expect("config update did not arrive");
    assert_eq!(
        update,
        SessionEventKind::ConfigUpdate {
            from: coordinator.local().uid().to_string(),
            config: settings,
        }
    );

    a.leave().await.unwrap();
    coordinator.leave().await.unwrap();
}

#[tokio::test]
async fn test_unanswered_connection_test_fails_join() {
    let transport = MemoryTransport::default();
    let config = fast_config("silent", 8);

    // A coordinator that announces itself but never answers anything
    let descriptor = StreamDescriptor::new("silent/coordination/ghost", COORDINATION_STREAM_TYPE, "ghost")
        .with_property(NETWORK_PROPERTY, "silent");
    let ghost = transport.publish(descriptor).await.unwrap();
    let beat = encode_frame(&CoordinationMessage::new("ghost", Heartbeat { is_coordinator: true })).unwrap();
    let heartbeats = tokio::spawn(async move {
        loop {
            let _ = ghost.push(beat.clone());
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    });

    // Record everything the joining node sends
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = {
        let transport = transport.clone();
        let seen = seen.clone();
        tokio::spawn(async move {
            let filter = DiscoveryFilter::any()
                .stream_type(COORDINATION_STREAM_TYPE)
                .excluding_source("ghost");
            let found = transport.discover(&filter, WAIT).await.unwrap();
            let inlet = transport.open(&found[0]).await.unwrap();
            while let Ok(frame) = inlet.pull().await {
                if let Ok(message) = decode_frame(&frame) {
                    seen.lock().unwrap().push(message.message_type());
                }
            }
        })
    };

    let participant = session(&transport, &config, "p");
    let mut events = participant.subscribe();
    let result = participant.join().await;
    assert_eq!(result, Err(SessionError::ConnectionUnconfirmed));

    let failed = next_event(&mut events, |kind| matches!(kind, SessionEventKind::JoinFailed { .. })).await;
    assert_eq!(
        failed,
        SessionEventKind::JoinFailed {
            reason: "unable to confirm bidirectional connection".to_string(),
        }
    );

    let seen = seen.lock().unwrap().clone();
    assert_eq!(
        seen.iter().filter(|t| **t == MessageType::ConnectionTest).count(),
        3
    );
    assert!(!seen.contains(&MessageType::JoinRequest));
    assert_eq!(participant.phase(), CoordinationPhase::Idle);

    heartbeats.abort();
    recorder.abort();
    participant.leave().await.unwrap();
}

#[tokio::test]
async fn test_silent_node_is_swept_everywhere() {
    let transport = MemoryTransport::default();
    let config = fast_config("sweep", 8);

    let coordinator = session(&transport, &config, "coordinator");
    coordinator.join().await.unwrap();
    let a = session(&transport, &config, "a");
    a.join().await.unwrap();
    coordinator.wait_for_nodes(2, WAIT).await.unwrap();

    // A node that joins, heartbeats for a while, then goes quiet without leaving
    let descriptor = StreamDescriptor::new("sweep/coordination/mute", COORDINATION_STREAM_TYPE, "mute")
        .with_property(NETWORK_PROPERTY, "sweep");
    let outlet = transport.publish(descriptor).await.unwrap();
    let join = encode_frame(&CoordinationMessage::new(
        "mute",
        JoinRequest {
            node: Node::new("mute", "mute"),
        },
    ))
    .unwrap();
    let beat = encode_frame(&CoordinationMessage::new("mute", Heartbeat { is_coordinator: false })).unwrap();
    let silent = Arc::new(AtomicBool::new(false));
    let talker = {
        let silent = silent.clone();
        tokio::spawn(async move {
            loop {
                if !silent.load(Ordering::SeqCst) {
                    let _ = outlet.push(join.clone());
                    let _ = outlet.push(beat.clone());
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
    };

    let coordinator_ref = &coordinator;
    let a_ref = &a;
    eventually("coordinator to admit the node", move || async move {
        topology_uids(coordinator_ref).await.contains("mute")
    })
    .await;
    eventually("participant to learn the node", move || async move {
        topology_uids(a_ref).await.contains("mute")
    })
    .await;

    silent.store(true, Ordering::SeqCst);
    let went_quiet = tokio::time::Instant::now();

    eventually("coordinator to sweep the node", move || async move {
        !topology_uids(coordinator_ref).await.contains("mute")
    })
    .await;
    // The last heartbeat may have been pushed just before the node went quiet
    assert!(went_quiet.elapsed() >= config.node_timeout - Duration::from_millis(100));

    // Hierarchical participants only learn of the removal from the rebroadcast topology
    eventually("participant to drop the node", move || async move {
        !topology_uids(a_ref).await.contains("mute")
    })
    .await;
    let expected: BTreeSet<String> = [&coordinator, &a]
        .iter()
        .map(|s| s.local().uid().to_string())
        .collect();
    assert_eq!(topology_uids(&a).await, expected);

    talker.abort();
    a.leave().await.unwrap();
    coordinator.leave().await.unwrap();
}
