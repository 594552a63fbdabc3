// Room-level guarantees exercised through the public registry/room API
// against the loopback engine.

mod common;

use common::*;
use roomsignal::error::SignalError;
use roomsignal::media::types::{MediaKind, TransportKind};
use roomsignal::media::{LocalEngine, TransportOptions};
use roomsignal::room::resources::{ResourceState, TransportState};
use roomsignal::room::settings::RoomSettings;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn router_lives_exactly_while_room_has_peers() {
    let engine = Arc::new(LocalEngine::new());
    let registry = registry(engine.clone(), RoomSettings::default());

    assert!(!engine.has_router_for_room("r1"));
    let (session_a, _a) = join(&registry, "r1", "a").await;
    let (session_b, _b) = join(&registry, "r1", "b").await;
    assert!(engine.has_router_for_room("r1"));
    assert_eq!(engine.live_routers(), 1);

    assert!(registry.leave("r1", "a", Some(session_a)).await);
    assert!(engine.has_router_for_room("r1"));

    assert!(registry.leave("r1", "b", Some(session_b)).await);
    assert!(!engine.has_router_for_room("r1"));
    assert!(!registry.has_room("r1"));
    assert_eq!(registry.services().metrics.rooms_created(), 1);
}

#[tokio::test]
async fn closing_a_producer_closes_its_consumers_in_every_peer() {
    let engine = Arc::new(LocalEngine::new());
    let registry = registry(engine.clone(), RoomSettings::default());
    let (_, mut inbox_a) = join(&registry, "r1", "a").await;
    let (_, mut inbox_b) = join(&registry, "r1", "b").await;
    let (_, mut inbox_c) = join(&registry, "r1", "c").await;

    let room_lock = registry.get_room("r1").unwrap();
    let room = room_lock.read().await;
    let (_, producer) = producing(&room, "a").await;

    let mut consumers = Vec::new();
    for peer in ["b", "c"] {
        connected_transport(&room, peer, TransportKind::WebRtcRecv).await;
        let created = room.consume(peer, &producer, &capabilities(), None).await.unwrap();
        assert_eq!(created.producer_id, producer);
        consumers.push((peer, created.params.id));
    }
    assert_eq!(engine.live_consumers(), 2);
    drain(&mut inbox_a);
    drain(&mut inbox_b);
    drain(&mut inbox_c);

    room.close_producer("a", &producer).await.unwrap();

    for (peer, consumer) in &consumers {
        assert_eq!(room.consumer_state(peer, consumer).await, Some(ResourceState::Closed));
    }
    assert_eq!(engine.live_consumers(), 0);
    assert_eq!(room.producer_state("a", &producer).await, Some(ResourceState::Closed));

    for inbox in [&mut inbox_b, &mut inbox_c] {
        let frames = drain(inbox);
        assert_eq!(methods(&frames), vec!["producerClosed", "consumerClosed"]);
        assert_eq!(frames[1]["data"]["producerId"], producer.as_str());
    }
    // The owner asked for it and is not notified
    assert!(drain(&mut inbox_a).is_empty());

    // Closed stays closed
    let err = room.close_producer("a", &producer).await.unwrap_err();
    assert!(matches!(err, SignalError::ResourceClosed(_)));
}

#[tokio::test]
async fn leaving_peer_leaves_nothing_behind() {
    let engine = Arc::new(LocalEngine::new());
    let registry = registry(engine.clone(), RoomSettings::default());
    let (session_a, _inbox_a) = join(&registry, "r1", "a").await;
    let (_, mut inbox_b) = join(&registry, "r1", "b").await;

    let room_lock = registry.get_room("r1").unwrap();
    let (producer_a, consumer_of_a) = {
        let room = room_lock.read().await;
        let (_, producer_a) = producing(&room, "a").await;
        let (_, producer_b) = producing(&room, "b").await;
        connected_transport(&room, "a", TransportKind::WebRtcRecv).await;
        connected_transport(&room, "b", TransportKind::WebRtcRecv).await;
        room.consume("a", &producer_b, &capabilities(), None).await.unwrap();
        let consumer_of_a = room.consume("b", &producer_a, &capabilities(), None).await.unwrap();
        (producer_a, consumer_of_a.params.id)
    };
    drain(&mut inbox_b);

    assert!(registry.leave("r1", "a", Some(session_a)).await);

    let room = room_lock.read().await;
    assert!(!room.has_peer("a"));
    assert!(matches!(room.peer_resources("a").await, Err(SignalError::PeerNotFound(_))));
    assert_eq!(room.consumer_state("b", &consumer_of_a).await, Some(ResourceState::Closed));
    let left_b = room.peer_resources("b").await.unwrap();
    assert_eq!((left_b.transports, left_b.producers, left_b.consumers), (2, 1, 0));

    // b keeps its own send/recv transports and producer; a's are gone engine-side
    assert_eq!(engine.live_transports(), 2);
    assert_eq!(engine.live_producers(), 1);
    assert_eq!(engine.live_consumers(), 0);

    let frames = drain(&mut inbox_b);
    assert_eq!(methods(&frames), vec!["producerClosed", "consumerClosed", "peerLeft"]);
    assert_eq!(frames[0]["data"]["producerId"], producer_a.as_str());
    assert_eq!(frames[2]["data"]["peerId"], "a");
}

#[tokio::test]
async fn consuming_closed_or_foreign_producer_is_not_found() {
    let engine = Arc::new(LocalEngine::new());
    let registry = registry(engine.clone(), RoomSettings::default());
    let (_, _a) = join(&registry, "r1", "a").await;
    let (_, _b) = join(&registry, "r1", "b").await;
    let (_, _x) = join(&registry, "r2", "x").await;

    let foreign = {
        let room_lock = registry.get_room("r2").unwrap();
        let room = room_lock.read().await;
        producing(&room, "x").await.1
    };

    let room_lock = registry.get_room("r1").unwrap();
    let room = room_lock.read().await;
    connected_transport(&room, "b", TransportKind::WebRtcRecv).await;

    let err = room.consume("b", &foreign, &capabilities(), None).await.unwrap_err();
    assert!(matches!(err, SignalError::ProducerNotFound(_)));

    let (_, producer) = producing(&room, "a").await;
    room.close_producer("a", &producer).await.unwrap();
    let err = room.consume("b", &producer, &capabilities(), None).await.unwrap_err();
    assert!(matches!(err, SignalError::ProducerNotFound(_)));
    assert_eq!(engine.live_consumers(), 0);
}

#[tokio::test]
async fn concurrent_joins_create_one_router() {
    let engine = Arc::new(LocalEngine::new());
    engine.set_router_latency(Duration::from_millis(20));
    let registry = registry(engine.clone(), RoomSettings::default());

    let mut joins = Vec::new();
    for i in 0..16 {
        let registry = registry.clone();
        joins.push(tokio::spawn(async move {
            let (tx, rx) = tokio::sync::mpsc::channel(64);
            registry.join("busy", &format!("peer-{i}"), tx).await.map(|_| rx)
        }));
    }
    let mut inboxes = Vec::new();
    for join in joins {
        inboxes.push(join.await.unwrap().unwrap());
    }

    assert_eq!(engine.routers_created(), 1);
    assert_eq!(registry.peer_count().await, 16);

    // Transport creation from many peers at once reuses the same router
    let room_lock = registry.get_room("busy").unwrap();
    let mut creates = Vec::new();
    for i in 0..16 {
        let room_lock = room_lock.clone();
        creates.push(tokio::spawn(async move {
            let room = room_lock.read().await;
            room.create_transport(&format!("peer-{i}"), TransportKind::WebRtcSend, &TransportOptions::default())
                .await
                .map(|info| info.id)
        }));
    }
    for create in creates {
        create.await.unwrap().unwrap();
    }
    assert_eq!(engine.routers_created(), 1);
    assert_eq!(engine.live_transports(), 16);
}

#[tokio::test]
async fn produce_rules() {
    let registry = registry(Arc::new(LocalEngine::new()), RoomSettings::default());
    let (_, _a) = join(&registry, "r1", "a").await;
    let room_lock = registry.get_room("r1").unwrap();
    let room = room_lock.read().await;

    // Not yet connected
    let info = room
        .create_transport("a", TransportKind::WebRtcSend, &TransportOptions::default())
        .await
        .unwrap();
    assert_eq!(room.transport_state("a", &info.id).await, Some(TransportState::Created));
    let err = room.produce("a", &info.id, MediaKind::Audio, &rtp_parameters()).await.unwrap_err();
    assert!(matches!(err, SignalError::InvalidState(_)));

    // Receive transports cannot carry producers
    let recv = connected_transport(&room, "a", TransportKind::WebRtcRecv).await;
    let err = room.produce("a", &recv, MediaKind::Audio, &rtp_parameters()).await.unwrap_err();
    assert!(matches!(err, SignalError::Validation(_)));

    // Someone else's or unknown transport
    let err = room.produce("a", "nope", MediaKind::Audio, &rtp_parameters()).await.unwrap_err();
    assert!(matches!(err, SignalError::UnknownTransport(_)));

    // Connecting twice is a state error, not an engine error
    room.connect_transport("a", &info.id, &client_dtls()).await.unwrap();
    let err = room.connect_transport("a", &info.id, &client_dtls()).await.unwrap_err();
    assert!(matches!(err, SignalError::InvalidState(_)));
    room.produce("a", &info.id, MediaKind::Audio, &rtp_parameters()).await.unwrap();
}

#[tokio::test]
async fn consume_rules() {
    let settings = RoomSettings::default().with_max_consumers_per_peer(1);
    let registry = registry(Arc::new(LocalEngine::new()), settings);
    let (_, _a) = join(&registry, "r1", "a").await;
    let (_, _b) = join(&registry, "r1", "b").await;
    let room_lock = registry.get_room("r1").unwrap();
    let room = room_lock.read().await;

    let (_, producer) = producing(&room, "a").await;

    // No receive transport yet
    let err = room.consume("b", &producer, &capabilities(), None).await.unwrap_err();
    assert!(matches!(err, SignalError::InvalidState(_)));

    // Own producer
    connected_transport(&room, "a", TransportKind::WebRtcRecv).await;
    let err = room.consume("a", &producer, &capabilities(), None).await.unwrap_err();
    assert!(matches!(err, SignalError::Validation(_)));

    let recv = connected_transport(&room, "b", TransportKind::WebRtcRecv).await;
    let first = room.consume("b", &producer, &capabilities(), Some(recv.as_str())).await.unwrap();
    assert_eq!(first.transport_id, recv);
    assert!(!first.params.producer_paused);

    // Per-peer cap
    let err = room.consume("b", &producer, &capabilities(), None).await.unwrap_err();
    assert!(matches!(err, SignalError::LimitExceeded(_)));

    // At the cap, a gone or unknown producer still reads as not found
    let (_, retired) = producing(&room, "a").await;
    room.close_producer("a", &retired).await.unwrap();
    let err = room.consume("b", &retired, &capabilities(), None).await.unwrap_err();
    assert!(matches!(err, SignalError::ProducerNotFound(_)));
    let err = room.consume("b", "never-existed", &capabilities(), None).await.unwrap_err();
    assert!(matches!(err, SignalError::ProducerNotFound(_)));

    // Closing frees a slot
    room.close_consumer("b", &first.params.id).await.unwrap();
    room.pause_producer("a", &producer).await.unwrap();
    let second = room.consume("b", &producer, &capabilities(), None).await.unwrap();
    assert!(second.params.producer_paused);
}

#[tokio::test]
async fn pause_and_resume_are_broadcast_once() {
    let registry = registry(Arc::new(LocalEngine::new()), RoomSettings::default());
    let (_, mut inbox_a) = join(&registry, "r1", "a").await;
    let (_, mut inbox_b) = join(&registry, "r1", "b").await;
    let room_lock = registry.get_room("r1").unwrap();
    let room = room_lock.read().await;
    let (_, producer) = producing(&room, "a").await;
    drain(&mut inbox_a);
    drain(&mut inbox_b);

    room.pause_producer("a", &producer).await.unwrap();
    room.pause_producer("a", &producer).await.unwrap();
    assert_eq!(room.producer_state("a", &producer).await, Some(ResourceState::Paused));
    room.resume_producer("a", &producer).await.unwrap();
    assert_eq!(room.producer_state("a", &producer).await, Some(ResourceState::Open));

    assert_eq!(methods(&drain(&mut inbox_b)), vec!["producerPaused", "producerResumed"]);
    assert!(drain(&mut inbox_a).is_empty());
}

#[tokio::test]
async fn engine_closed_transport_cascades() {
    let engine = Arc::new(LocalEngine::new());
    let registry = registry(engine.clone(), RoomSettings::default());
    let (_, mut inbox_a) = join(&registry, "r1", "a").await;
    let (_, mut inbox_b) = join(&registry, "r1", "b").await;
    let room_lock = registry.get_room("r1").unwrap();

    let (send_transport, producer, consumer) = {
        let room = room_lock.read().await;
        let (send_transport, producer) = producing(&room, "a").await;
        connected_transport(&room, "b", TransportKind::WebRtcRecv).await;
        let consumer = room.consume("b", &producer, &capabilities(), None).await.unwrap();
        (send_transport, producer, consumer.params.id)
    };

    engine.fail_transport(&send_transport);

    let closed = expect_notification(&mut inbox_a, "transportClosed").await;
    assert_eq!(closed["data"]["transportId"], send_transport.as_str());
    let consumer_closed = expect_notification(&mut inbox_b, "consumerClosed").await;
    assert_eq!(consumer_closed["data"]["consumerId"], consumer.as_str());

    let room = room_lock.read().await;
    assert_eq!(room.transport_state("a", &send_transport).await, Some(TransportState::Closed));
    assert_eq!(room.producer_state("a", &producer).await, Some(ResourceState::Closed));
    assert_eq!(room.consumer_state("b", &consumer).await, Some(ResourceState::Closed));
}

#[tokio::test(start_paused = true)]
async fn stalled_connect_times_out_and_closes_transport() {
    let engine = Arc::new(LocalEngine::new());
    engine.set_stall_connects(true);
    let settings = RoomSettings::default().with_transport_connect_timeout(Duration::from_millis(200));
    let registry = registry(engine.clone(), settings);
    let (_, _a) = join(&registry, "r1", "a").await;
    let room_lock = registry.get_room("r1").unwrap();
    let room = room_lock.read().await;

    let info = room
        .create_transport("a", TransportKind::WebRtcSend, &TransportOptions::default())
        .await
        .unwrap();
    let err = room.connect_transport("a", &info.id, &client_dtls()).await.unwrap_err();
    assert!(matches!(err, SignalError::TransportConnectTimeout { .. }));
    assert!(err.retriable());
    assert_eq!(room.transport_state("a", &info.id).await, Some(TransportState::Closed));
    assert_eq!(engine.live_transports(), 0);

    engine.set_stall_connects(false);
    let err = room.connect_transport("a", &info.id, &client_dtls()).await.unwrap_err();
    assert!(matches!(err, SignalError::ResourceClosed(_)));
}

#[tokio::test]
async fn engine_refusing_a_transport_leaves_nothing_behind() {
    let engine = Arc::new(LocalEngine::new());
    let registry = registry(engine.clone(), RoomSettings::default());
    let (_, _a) = join(&registry, "r1", "a").await;
    let room_lock = registry.get_room("r1").unwrap();
    let room = room_lock.read().await;

    engine.set_reject_transports(true);
    let err = room
        .create_transport("a", TransportKind::WebRtcSend, &TransportOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SignalError::TransportCreationFailed(_)));
    assert_eq!(err.code(), "TransportCreationFailed");
    assert!(!err.retriable());
    assert_eq!(room.peer_resources("a").await.unwrap().transports, 0);
    assert_eq!(engine.live_transports(), 0);

    engine.set_reject_transports(false);
    connected_transport(&room, "a", TransportKind::WebRtcSend).await;
    assert_eq!(room.peer_resources("a").await.unwrap().transports, 1);
}

#[tokio::test]
async fn get_or_create_room_is_idempotent_under_concurrency() {
    let engine = Arc::new(LocalEngine::new());
    engine.set_router_latency(Duration::from_millis(20));
    let registry = registry(engine.clone(), RoomSettings::default());

    let (first, second) = tokio::join!(registry.get_or_create_room("r1"), registry.get_or_create_room("r1"));
    let (first, second) = (first.unwrap(), second.unwrap());
    assert!(Arc::ptr_eq(&first, &second));
    let again = registry.get_or_create_room("r1").await.unwrap();
    assert!(Arc::ptr_eq(&first, &again));

    assert_eq!(engine.routers_created(), 1);
    assert_eq!(engine.live_routers(), 1);
    assert_eq!(first.read().await.peer_count(), 0);
    assert_eq!(registry.peer_count().await, 0);

    // Nobody joined, so the room can be dropped again
    assert!(registry.remove_room_if_empty("r1").await);
    assert!(!registry.has_room("r1"));
    assert_eq!(engine.live_routers(), 0);
}

#[tokio::test]
async fn scores_reach_only_the_owner() {
    let engine = Arc::new(LocalEngine::new());
    let registry = registry(engine.clone(), RoomSettings::default());
    let (_, mut inbox_a) = join(&registry, "r1", "a").await;
    let (_, mut inbox_b) = join(&registry, "r1", "b").await;

    let (producer, consumer) = {
        let room_lock = registry.get_room("r1").unwrap();
        let room = room_lock.read().await;
        let (_, producer) = producing(&room, "a").await;
        connected_transport(&room, "b", TransportKind::WebRtcRecv).await;
        let consumer = room.consume("b", &producer, &capabilities(), None).await.unwrap();
        (producer, consumer.params.id)
    };
    drain(&mut inbox_a);
    drain(&mut inbox_b);

    engine.report_producer_score(&producer, 7);
    let scored = expect_notification(&mut inbox_a, "producerScore").await;
    assert_eq!(scored["data"]["producerId"], producer.as_str());
    assert_eq!(scored["data"]["score"]["score"], 7);
    assert!(drain(&mut inbox_b).is_empty());

    engine.report_consumer_score(&consumer, 5, 7);
    let scored = expect_notification(&mut inbox_b, "consumerScore").await;
    assert_eq!(scored["data"]["consumerId"], consumer.as_str());
    assert_eq!(scored["data"]["score"], serde_json::json!({ "score": 5, "producerScore": 7 }));
    assert!(drain(&mut inbox_a).is_empty());
}
