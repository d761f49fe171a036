use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use kittyparty_server::error::RelayError;
use kittyparty_server::feed::{ChangeStream, UpdateDescription, UserDocument};
use kittyparty_server::websocket::ServerMessage;
use kittyparty_server::{
    AppError, ChangeEvent, ChangeFeed, ChannelChangeFeed, Relay, RelayState, RetryConfig,
    RoomRegistry,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex;
use tokio::time::timeout;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

fn fast_retry(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

fn update(id: &str, coins: Option<u64>) -> ChangeEvent {
    ChangeEvent::Update {
        full_document: Some(UserDocument {
            id: id.to_string(),
            coins,
        }),
        update_description: None,
    }
}

async fn next_message(rx: &mut UnboundedReceiver<String>) -> ServerMessage {
    let text = timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for broadcast")
        .expect("channel closed");
    serde_json::from_str(&text).expect("broadcast is a server message")
}

#[test_log::test(tokio::test)]
async fn test_update_reaches_only_matching_room() {
    let registry = RoomRegistry::new();
    let (a, mut rx_a) = registry.register().await;
    let (b, mut rx_b) = registry.register().await;
    registry.join(a, "u1").await;
    registry.join(b, "u2").await;

    let (tx, feed) = ChannelChangeFeed::new();
    let relay = Arc::new(Relay::new(Arc::new(feed), registry.clone(), fast_retry(1)));
    let task = tokio::spawn({
        let relay = relay.clone();
        async move { relay.run().await }
    });

    tx.send(Ok(update("u1", Some(7)))).unwrap();

    assert_eq!(next_message(&mut rx_a).await, ServerMessage::CoinUpdate { coins: 7 });
    assert!(rx_b.try_recv().is_err());

    relay.stop();
    task.await.unwrap().unwrap();
    assert_eq!(relay.state(), RelayState::Stopped);
}

#[tokio::test]
async fn test_exact_payload_for_every_member() {
    let registry = RoomRegistry::new();
    let (first, mut rx_first) = registry.register().await;
    let (second, mut rx_second) = registry.register().await;
    let (outsider, mut rx_outsider) = registry.register().await;
    registry.join(first, "u1").await;
    registry.join(second, "u1").await;
    registry.join(outsider, "u3").await;

    let relay = Relay::new(Arc::new(ChannelChangeFeed::new().1), registry, fast_retry(1));
    let event = ChangeEvent::from_payload(
        r#"{"operationType":"update","fullDocument":{"_id":"u1","Coins":42}}"#,
    )
    .unwrap();

    assert_eq!(relay.handle_event(event).await, 2);

    for rx in [&mut rx_first, &mut rx_second] {
        let text = rx.try_recv().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "coin_update");
        assert_eq!(value["payload"], serde_json::json!({ "coins": 42 }));
        assert!(rx.try_recv().is_err(), "exactly one broadcast expected");
    }
    assert!(rx_outsider.try_recv().is_err());
}

#[tokio::test]
async fn test_filtered_events_never_broadcast() {
    let registry = RoomRegistry::new();
    let (id, mut rx) = registry.register().await;
    registry.join(id, "u1").await;

    let (tx, feed) = ChannelChangeFeed::new();
    let relay = Arc::new(Relay::new(Arc::new(feed), registry, fast_retry(1)));
    let task = tokio::spawn({
        let relay = relay.clone();
        async move { relay.run().await }
    });

    tx.send(Ok(ChangeEvent::Insert {
        full_document: Some(UserDocument { id: "u1".into(), coins: Some(100) }),
    }))
    .unwrap();
    tx.send(Ok(update("u1", None))).unwrap();
    tx.send(Ok(ChangeEvent::Update {
        full_document: Some(UserDocument { id: "u1".into(), coins: Some(5) }),
        update_description: Some(UpdateDescription {
            updated_fields: vec!["username".into()],
            removed_fields: vec![],
        }),
    }))
    .unwrap();
    tx.send(Err(RelayError::MalformedEvent("expected value".into()).into())).unwrap();
    tx.send(Ok(ChangeEvent::Other)).unwrap();
    // marker: the first message received must be this one
    tx.send(Ok(update("u1", Some(1)))).unwrap();

    assert_eq!(next_message(&mut rx).await, ServerMessage::CoinUpdate { coins: 1 });
    assert!(rx.try_recv().is_err());
    assert!(relay.state().is_watching());

    relay.stop();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_empty_room_and_disconnected_member() {
    let registry = RoomRegistry::new();
    let relay = Relay::new(Arc::new(ChannelChangeFeed::new().1), registry.clone(), fast_retry(1));

    assert_eq!(relay.handle_event(update("ghost", Some(3))).await, 0);

    let (id, mut rx) = registry.register().await;
    registry.join(id, "u1").await;
    registry.disconnect(id).await;

    assert_eq!(relay.handle_event(update("u1", Some(9))).await, 0);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_member_of_two_rooms_receives_both() {
    let registry = RoomRegistry::new();
    let (id, mut rx) = registry.register().await;
    registry.join(id, "u1").await;
    registry.join(id, "u2").await;

    let relay = Relay::new(Arc::new(ChannelChangeFeed::new().1), registry, fast_retry(1));
    relay.handle_event(update("u1", Some(10))).await;
    relay.handle_event(update("u2", Some(20))).await;

    assert_eq!(next_message(&mut rx).await, ServerMessage::CoinUpdate { coins: 10 });
    assert_eq!(next_message(&mut rx).await, ServerMessage::CoinUpdate { coins: 20 });
}

/// Hands out one prepared batch of events per subscription, then fails.
struct ScriptedFeed {
    batches: Mutex<VecDeque<Vec<ChangeEvent>>>,
}

#[async_trait]
impl ChangeFeed for ScriptedFeed {
    async fn subscribe(&self) -> kittyparty_server::Result<ChangeStream> {
        let batch = self
            .batches
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| RelayError::SubscriptionFailed("upstream unavailable".into()))?;
        // the stream ends after the batch, like a dropped change stream
        Ok(futures::stream::iter(batch.into_iter().map(Ok::<_, AppError>)).boxed())
    }
}

#[tokio::test]
async fn test_resubscribes_after_subscription_closes() {
    let registry = RoomRegistry::new();
    let (id, mut rx) = registry.register().await;
    registry.join(id, "u1").await;

    let feed = ScriptedFeed {
        batches: Mutex::new(VecDeque::from(vec![
            vec![update("u1", Some(1))],
            vec![update("u1", Some(2))],
        ])),
    };
    let relay = Relay::new(Arc::new(feed), registry, fast_retry(3));

    let result = relay.run().await;

    assert_eq!(next_message(&mut rx).await, ServerMessage::CoinUpdate { coins: 1 });
    assert_eq!(next_message(&mut rx).await, ServerMessage::CoinUpdate { coins: 2 });
    assert!(matches!(
        result,
        Err(AppError::RelayError(RelayError::RetriesExhausted(3)))
    ));
    assert_eq!(relay.state(), RelayState::Stopped);
}

#[tokio::test]
async fn test_status_signal_tracks_subscription() {
    let (tx, feed) = ChannelChangeFeed::new();
    let relay = Arc::new(Relay::new(Arc::new(feed), RoomRegistry::new(), fast_retry(1)));
    let mut status = relay.status();
    assert_eq!(*status.borrow(), RelayState::Idle);

    let task = tokio::spawn({
        let relay = relay.clone();
        async move { relay.run().await }
    });

    timeout(RECV_TIMEOUT, status.wait_for(|s| s.is_watching()))
        .await
        .expect("relay never started watching")
        .unwrap();

    // closing the upstream with a consumed channel feed exhausts the retries
    drop(tx);
    let result = task.await.unwrap();
    assert!(result.is_err());
    assert_eq!(*status.borrow(), RelayState::Stopped);
}
