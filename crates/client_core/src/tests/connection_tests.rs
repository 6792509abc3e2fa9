use std::sync::atomic::Ordering;

use super::*;
use crate::test_support::{FakeBroker, FakeConnector};

const ENDPOINT: &str = "ws://broker.test/ws";

fn manager(connector: FakeConnector) -> ConnectionManager {
    ConnectionManager::new(
        Arc::new(connector),
        Duration::from_millis(200),
        Duration::from_millis(200),
    )
}

#[tokio::test]
async fn connect_reports_state_transitions() {
    let broker = FakeBroker::new();
    let manager = manager(FakeConnector::new(Arc::clone(&broker)));
    let mut states = manager.subscribe_state();
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    let handle = manager
        .connect(ENDPOINT, &Credentials::bearer("token"))
        .await
        .expect("connect");
    assert_eq!(handle.endpoint, ENDPOINT);
    assert_eq!(handle.generation, 1);
    assert!(states.has_changed().expect("sender alive"));
    assert_eq!(*states.borrow_and_update(), ConnectionState::Connected);
    assert!(manager.is_connected().await);
}

#[tokio::test]
async fn rejected_connect_leaves_manager_offline() {
    let broker = FakeBroker::new();
    let mut connector = FakeConnector::new(Arc::clone(&broker));
    connector.fail_with = Some(ConnectionError::Rejected("bad token".into()));
    let manager = manager(connector);

    let err = manager
        .connect(ENDPOINT, &Credentials::default())
        .await
        .expect_err("must fail");
    assert_eq!(err, ConnectionError::Rejected("bad token".into()));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(
        manager.publish("/app/chat/1/2", "{}".into()).await,
        Err(ConnectionError::NotConnected)
    );
}

#[tokio::test]
async fn connect_times_out() {
    let broker = FakeBroker::new();
    let mut connector = FakeConnector::new(Arc::clone(&broker));
    connector.delay = Some(Duration::from_secs(5));
    let manager = manager(connector);

    let err = manager
        .connect(ENDPOINT, &Credentials::default())
        .await
        .expect_err("must time out");
    assert_eq!(err, ConnectionError::TimedOut(200));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn duplicate_subscription_is_rejected() {
    let broker = FakeBroker::new();
    let manager = manager(FakeConnector::new(Arc::clone(&broker)));
    manager
        .connect(ENDPOINT, &Credentials::default())
        .await
        .expect("connect");

    let _first = manager.subscribe("/topic/conversation/1.99").await.expect("subscribe");
    let err = manager
        .subscribe("/topic/conversation/1.99")
        .await
        .expect_err("duplicate");
    assert_eq!(
        err,
        ConnectionError::AlreadySubscribed("/topic/conversation/1.99".into())
    );
    assert_eq!(broker.subscribe_calls.load(Ordering::SeqCst), 1);
    assert_eq!(manager.subscription_count().await, 1);
}

#[tokio::test]
async fn deliveries_arrive_in_receipt_order() {
    let broker = FakeBroker::new();
    let manager = manager(FakeConnector::new(Arc::clone(&broker)));
    manager
        .connect(ENDPOINT, &Credentials::default())
        .await
        .expect("connect");
    let mut subscription = manager.subscribe("/topic/a").await.expect("subscribe");

    for body in ["one", "two", "three"] {
        assert_eq!(broker.deliver("/topic/a", body).await, 1);
    }
    for expected in ["one", "two", "three"] {
        let delivery = subscription.deliveries.recv().await.expect("delivery");
        assert_eq!(delivery.body, expected);
    }
}

#[tokio::test]
async fn reconnect_starts_with_empty_registry() {
    let broker = FakeBroker::new();
    let manager = manager(FakeConnector::new(Arc::clone(&broker)));
    manager
        .connect(ENDPOINT, &Credentials::default())
        .await
        .expect("connect");
    let _sub = manager.subscribe("/topic/a").await.expect("subscribe");

    let handle = manager
        .connect(ENDPOINT, &Credentials::default())
        .await
        .expect("reconnect");
    assert_eq!(handle.generation, 2);
    assert_eq!(manager.subscription_count().await, 0);

    let _again = manager.subscribe("/topic/a").await.expect("resubscribe");
    assert_eq!(broker.active_destinations().await, vec!["/topic/a".to_string()]);
}

#[tokio::test]
async fn remote_close_is_detected() {
    let broker = FakeBroker::new();
    let manager = manager(FakeConnector::new(Arc::clone(&broker)));
    manager
        .connect(ENDPOINT, &Credentials::default())
        .await
        .expect("connect");
    let _sub = manager.subscribe("/topic/a").await.expect("subscribe");

    broker.drop_connection().await;

    assert!(!manager.is_connected().await);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(manager.subscription_count().await, 0);
}

#[tokio::test]
async fn unsubscribe_releases_destination() {
    let broker = FakeBroker::new();
    let manager = manager(FakeConnector::new(Arc::clone(&broker)));
    manager
        .connect(ENDPOINT, &Credentials::default())
        .await
        .expect("connect");
    let subscription = manager.subscribe("/topic/a").await.expect("subscribe");

    manager
        .unsubscribe(&subscription.handle())
        .await
        .expect("unsubscribe");
    assert!(broker.active_destinations().await.is_empty());
    let _again = manager.subscribe("/topic/a").await.expect("subscribe again");
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let broker = FakeBroker::new();
    let manager = manager(FakeConnector::new(Arc::clone(&broker)));
    manager
        .connect(ENDPOINT, &Credentials::default())
        .await
        .expect("connect");

    manager.disconnect().await;
    manager.disconnect().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(!manager.is_connected().await);
}

#[tokio::test]
async fn publish_forwards_body_and_surfaces_failures() {
    let broker = FakeBroker::new();
    let manager = manager(FakeConnector::new(Arc::clone(&broker)));
    manager
        .connect(ENDPOINT, &Credentials::default())
        .await
        .expect("connect");

    manager
        .publish("/app/chat/99/1", r#"{"content":"hi"}"#.into())
        .await
        .expect("publish");
    broker.fail_publishes(true);
    assert!(matches!(
        manager.publish("/app/chat/99/1", "{}".into()).await,
        Err(ConnectionError::Transport(_))
    ));
    assert_eq!(
        broker.published().await,
        vec![(
            "/app/chat/99/1".to_string(),
            r#"{"content":"hi"}"#.to_string()
        )]
    );
}
