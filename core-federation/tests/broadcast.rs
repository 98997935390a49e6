mod common;

use bridge_traits::HttpMethod;
use common::*;
use core_runtime::events::{BroadcastEvent, FederationEvent};

#[tokio::test]
async fn test_failing_target_gets_exactly_three_attempts() {
    let h = harness().await;
    h.http.on_post(PEER_DIRECTORY, 500);

    let results = h.coordinator.broadcast(Some(PEER_DIRECTORY)).await;

    assert_eq!(results.get(PEER_DIRECTORY), Some(&false));
    assert_eq!(h.http.requests_to(HttpMethod::Post, PEER_DIRECTORY).len(), 3);
}

#[tokio::test]
async fn test_recovering_target_stops_retrying() {
    let h = harness().await;
    h.http.on_post(PEER_DIRECTORY, 502);
    h.http.on_post(PEER_DIRECTORY, 200);

    let results = h.coordinator.broadcast(Some(PEER_DIRECTORY)).await;

    assert_eq!(results.get(PEER_DIRECTORY), Some(&true));
    assert_eq!(h.http.requests_to(HttpMethod::Post, PEER_DIRECTORY).len(), 2);
}

#[tokio::test]
async fn test_broadcast_to_all_listed_directories() {
    let h = harness().await;
    seed_listing(&h.store, "c1", PEER_DIRECTORY, PEER_PUBLICATIONS, true, false).await;
    seed_listing(&h.store, "c2", PEER_DIRECTORY, PEER_PUBLICATIONS, true, false).await;
    seed_listing(&h.store, "c3", OTHER_DIRECTORY, OTHER_PUBLICATIONS, false, false).await;
    seed_listing(&h.store, "mine", OWN_DIRECTORY, "", true, false).await;
    seed_listing(
        &h.store,
        "lan",
        "http://10.1.2.3/apps/opencatalogi/api/directory",
        "",
        true,
        false,
    )
    .await;
    h.http.on_post(PEER_DIRECTORY, 200);
    h.http.on_post(OTHER_DIRECTORY, 404);

    let results = h.coordinator.broadcast(None).await;

    assert_eq!(results.len(), 2);
    assert_eq!(results.get(PEER_DIRECTORY), Some(&true));
    assert_eq!(results.get(OTHER_DIRECTORY), Some(&false));
    assert_eq!(h.http.requests_to(HttpMethod::Post, PEER_DIRECTORY).len(), 1);
    assert_eq!(h.http.requests_to(HttpMethod::Post, OTHER_DIRECTORY).len(), 3);
    assert!(h.http.requests_to(HttpMethod::Post, OWN_DIRECTORY).is_empty());
}

#[tokio::test]
async fn test_broadcast_outcomes_are_published_as_events() {
    let h = harness().await;
    let mut receiver = h.events.subscribe();
    h.http.on_post(PEER_DIRECTORY, 200);
    h.http.on_post(OTHER_DIRECTORY, 500);

    h.coordinator.broadcast(Some(PEER_DIRECTORY)).await;
    h.coordinator.broadcast(Some(OTHER_DIRECTORY)).await;

    let mut events = Vec::new();
    while let Ok(FederationEvent::Broadcast(event)) = receiver.try_recv() {
        events.push(event);
    }

    assert_eq!(
        events,
        vec![
            BroadcastEvent::Delivered {
                target: PEER_DIRECTORY.to_string(),
                attempts: 1,
            },
            BroadcastEvent::Failed {
                target: OTHER_DIRECTORY.to_string(),
                attempts: 3,
                message: "HTTP 500".to_string(),
            },
        ]
    );
}
