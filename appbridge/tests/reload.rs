mod common;

use appbridge::codec;
use appbridge::dispatch::BridgeEvent;
use appbridge::protocol::{ConfigurationSnapshot, ErrorCode};
use appbridge::session::SessionStatus;
use common::{bridge_with_app, heartbeat, metadata, register};
use serde_json::json;
use std::time::Duration;

const UID: &str = "abc-123";
const APP: &str = "workstation";
const DISCOVERY: &str = "discovery/workstation";

#[tokio::test(start_paused = true)]
async fn heartbeat_from_an_offline_session_reloads_the_configuration() {
    let mut bridge = bridge_with_app(UID, APP).await;
    bridge.request(1, register(1, UID, "h1", &["a"])).await;
    let mut events = bridge.handle.subscribe(APP.to_owned()).await.unwrap();

    tokio::time::advance(Duration::from_secs(4)).await;
    assert!(matches!(
        events.recv().await.unwrap(),
        BridgeEvent::HealthChanged {
            status: SessionStatus::Offline,
            ..
        }
    ));

    // The app kept running, only its updates were lost.
    let reply = bridge.request(1, heartbeat(2, "h2")).await;
    assert!(reply.success);
    assert_eq!(reply.hash_drift_detected, Some(true));

    // The heartbeat alone brings the session back online.
    assert!(matches!(
        events.recv().await.unwrap(),
        BridgeEvent::HealthChanged {
            status: SessionStatus::Online,
            ..
        }
    ));

    bridge.outbound_until(DISCOVERY).await;

    let snapshot: ConfigurationSnapshot =
        serde_json::from_value(metadata("h2", &["a", "b"])).unwrap();
    bridge.identify(APP, codec::encode(&snapshot).unwrap()).await;

    // The reload re-synced the entity set.
    loop {
        if let BridgeEvent::EntityRegistered { unique_id, .. } = events.recv().await.unwrap() {
            assert_eq!(unique_id, "b");
            break;
        }
    }

    assert_eq!(bridge.entities.ids(APP).await, vec!["a", "b"]);
    let reply = bridge.request(1, heartbeat(3, "h2")).await;
    assert_eq!(reply.hash_drift_detected, Some(false));
}

#[tokio::test(start_paused = true)]
async fn reload_gives_up_after_bounded_attempts() {
    let mut bridge = bridge_with_app(UID, APP).await;
    bridge.request(1, register(1, UID, "h1", &["a"])).await;

    tokio::time::advance(Duration::from_secs(4)).await;
    bridge.request(1, heartbeat(2, "h1")).await;

    for _ in 0..3 {
        bridge.outbound_until(DISCOVERY).await;
    }

    tokio::time::advance(Duration::from_millis(500)).await;
    tokio::task::yield_now().await;

    // The round is over and the session stays online with its last-known
    // state; a heartbeat from an online session starts no new round.
    bridge.request(1, heartbeat(3, "h1")).await;
    tokio::task::yield_now().await;
    while let Ok(message) = bridge.outbound.try_recv() {
        assert_ne!(message.topic, DISCOVERY);
    }

    let health = bridge.handle.health(Some(UID.to_owned())).await.unwrap();
    assert_eq!(health[0].status, SessionStatus::Online);
}

#[tokio::test(start_paused = true)]
async fn malformed_identify_payload_does_not_end_the_round() {
    let mut bridge = bridge_with_app(UID, APP).await;
    bridge.request(1, register(1, UID, "h1", &["a"])).await;
    let mut events = bridge.handle.subscribe(APP.to_owned()).await.unwrap();

    tokio::time::advance(Duration::from_secs(4)).await;
    events.recv().await.unwrap();
    bridge.request(1, heartbeat(2, "h1")).await;

    bridge.outbound_until(DISCOVERY).await;
    bridge.identify(APP, "not hex".to_owned()).await;

    // The garbage payload burned the first attempt; answer the retry.
    bridge.outbound_until(DISCOVERY).await;

    let snapshot: ConfigurationSnapshot = serde_json::from_value(metadata("h1", &["a"])).unwrap();
    bridge.identify(APP, codec::encode(&snapshot).unwrap()).await;

    // The retry completed the round and re-synced the entity.
    loop {
        if let BridgeEvent::EntityUpdated { unique_id, .. } = events.recv().await.unwrap() {
            assert_eq!(unique_id, "a");
            break;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn going_offline_during_a_reload_wins_over_the_identify_reply() {
    let mut bridge = bridge_with_app(UID, APP).await;
    bridge.request(1, register(1, UID, "h1", &["a"])).await;
    let mut events = bridge.handle.subscribe(APP.to_owned()).await.unwrap();

    tokio::time::advance(Duration::from_secs(4)).await;
    events.recv().await.unwrap();
    bridge.request(1, heartbeat(2, "h1")).await;
    events.recv().await.unwrap();
    bridge.outbound_until(DISCOVERY).await;

    // The app says goodbye while the round is still waiting for its reply.
    let reply = bridge
        .request(1, json!({ "id": 3, "type": "going_offline", "unique_id": UID }))
        .await;
    assert!(reply.success);
    assert!(matches!(
        events.recv().await.unwrap(),
        BridgeEvent::HealthChanged {
            status: SessionStatus::Offline,
            ..
        }
    ));

    let snapshot: ConfigurationSnapshot =
        serde_json::from_value(metadata("h2", &["a", "b"])).unwrap();
    bridge.identify(APP, codec::encode(&snapshot).unwrap()).await;

    tokio::time::advance(Duration::from_secs(1)).await;
    tokio::task::yield_now().await;

    // The late reply neither resurrects the session nor touches its state.
    let health = bridge.handle.health(Some(UID.to_owned())).await.unwrap();
    assert_eq!(health[0].status, SessionStatus::Offline);
    assert_eq!(bridge.entities.ids(APP).await, vec!["a"]);
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn abrupt_disconnect_unbinds_the_connection_but_keeps_the_session() {
    let bridge = bridge_with_app(UID, APP).await;
    bridge.request(1, register(1, UID, "h1", &["a"])).await;
    let mut events = bridge.handle.subscribe(APP.to_owned()).await.unwrap();

    bridge.disconnect(1).await;

    // The old connection no longer resolves to the session.
    let reply = bridge.request(1, heartbeat(2, "h1")).await;
    assert_eq!(reply.code, Some(ErrorCode::BridgeNotFound));

    // Left alone, the session times out on its own.
    tokio::time::advance(Duration::from_secs(4)).await;
    assert!(matches!(
        events.recv().await.unwrap(),
        BridgeEvent::HealthChanged {
            status: SessionStatus::Offline,
            ..
        }
    ));

    // A re-registration on a new connection brings it back online.
    let reply = bridge.request(2, register(3, UID, "h1", &["a"])).await;
    assert!(reply.success);
    assert!(matches!(
        events.recv().await.unwrap(),
        BridgeEvent::HealthChanged {
            status: SessionStatus::Online,
            ..
        }
    ));
}
