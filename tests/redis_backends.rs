//! Run with a reachable Redis server:
//! `REDIS_DSN=redis://127.0.0.1:6379/0 cargo test -- --ignored`
#![cfg(feature = "redis")]

use std::time::Duration;

use tokio::time::timeout;
use uuid::Uuid;

use webhook_tester::error_handling::types::StorageError;
use webhook_tester::pubsub::{Event, PubSub, RedisPubSub};
use webhook_tester::storage::{RedisStorage, Request, Session, Storage};

fn client() -> redis::Client {
    let dsn = std::env::var("REDIS_DSN").unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string());
    redis::Client::open(dsn).expect("valid REDIS_DSN")
}

/// Every test gets its own key space.
fn prefix() -> String {
    format!("webhook-tester-test:{}:", Uuid::new_v4())
}

fn request(n: usize) -> Request {
    Request::new("POST", format!("10.0.0.{}", n), format!("/{}", n), vec![], vec![])
}

#[tokio::test]
#[ignore]
async fn test_session_lifecycle() {
    let storage = RedisStorage::new(client(), prefix(), Duration::from_secs(60), 8)
        .await
        .unwrap();

    let sid = storage.new_session(Session::default(), None).await.unwrap();
    let session = storage.get_session(sid).await.unwrap();
    assert_eq!(session.code, 200);
    assert!(session.expires_at > session.created_at);

    let explicit = Uuid::new_v4().to_string();
    let id = storage.new_session(Session::default(), Some(&explicit)).await.unwrap();
    assert_eq!(id.to_string(), explicit);
    assert_eq!(
        storage.new_session(Session::default(), Some(&explicit)).await,
        Err(StorageError::AlreadyExists(id))
    );

    storage.add_session_ttl(sid, Duration::from_secs(60)).await.unwrap();
    let extended = storage.get_session(sid).await.unwrap();
    assert_eq!(extended.created_at, session.created_at);
    assert!(extended.expires_at > session.expires_at);

    storage.delete_session(sid).await.unwrap();
    assert_eq!(storage.get_session(sid).await, Err(StorageError::SessionNotFound(sid)));
    assert_eq!(storage.delete_session(sid).await, Err(StorageError::SessionNotFound(sid)));

    storage.close().await.unwrap();
    assert_eq!(storage.get_session(id).await, Err(StorageError::Closed));
}

#[tokio::test]
#[ignore]
async fn test_session_expires() {
    let storage = RedisStorage::new(client(), prefix(), Duration::from_millis(200), 8)
        .await
        .unwrap();
    let sid = storage.new_session(Session::default(), None).await.unwrap();
    storage.new_request(sid, request(1)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(storage.get_session(sid).await, Err(StorageError::SessionNotFound(sid)));
    assert!(storage.get_all_requests(sid).await.is_err());
}

#[tokio::test]
#[ignore]
async fn test_ring_and_cascade() {
    let storage = RedisStorage::new(client(), prefix(), Duration::from_secs(60), 2)
        .await
        .unwrap();
    let sid = storage.new_session(Session::default(), None).await.unwrap();

    let mut ids = Vec::new();
    for n in 1..=3 {
        ids.push(storage.new_request(sid, request(n)).await.unwrap());
    }

    let all = storage.get_all_requests(sid).await.unwrap();
    assert_eq!(all.len(), 2);
    assert!(!all.contains_key(&ids[0]));
    assert_eq!(all[&ids[2]].client_addr, "10.0.0.3");
    assert_eq!(
        storage.get_request(sid, ids[0]).await,
        Err(StorageError::RequestNotFound(ids[0]))
    );

    storage.delete_request(sid, ids[1]).await.unwrap();
    assert_eq!(
        storage.delete_request(sid, ids[1]).await,
        Err(StorageError::RequestNotFound(ids[1]))
    );

    storage.delete_session(sid).await.unwrap();
    assert_eq!(
        storage.get_request(sid, ids[2]).await,
        Err(StorageError::SessionNotFound(sid))
    );
}

#[tokio::test]
#[ignore]
async fn test_pubsub_round_trip() {
    let pubsub = RedisPubSub::new(client(), prefix()).await.unwrap();
    let (mut rx, unsubscribe) = pubsub.subscribe("topic").await.unwrap();

    let rid = Uuid::new_v4();
    pubsub.publish("topic", Event::RequestCreated(rid)).await.unwrap();
    pubsub.publish("topic", Event::RequestsCleared).await.unwrap();

    let first = timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
    let second = timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
    assert_eq!(first, Some(Event::RequestCreated(rid)));
    assert_eq!(second, Some(Event::RequestsCleared));

    unsubscribe.unsubscribe();
    assert_eq!(timeout(Duration::from_secs(2), rx.recv()).await.unwrap(), None);

    pubsub.close().await.unwrap();
    assert!(pubsub.publish("topic", Event::RequestsCleared).await.is_err());
}

#[tokio::test]
#[ignore]
async fn test_pubsub_shares_topic_subscription() {
    let pubsub = RedisPubSub::new(client(), prefix()).await.unwrap();
    let (mut rx1, unsub1) = pubsub.subscribe("topic").await.unwrap();
    let (mut rx2, unsub2) = pubsub.subscribe("topic").await.unwrap();
    let (_other, unsub3) = pubsub.subscribe("other").await.unwrap();
    assert_eq!(pubsub.active_topics(), 2);
    assert_eq!(pubsub.subscribers("topic"), 2);

    pubsub.publish("topic", Event::RequestsCleared).await.unwrap();
    for rx in [&mut rx1, &mut rx2] {
        let got = timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(got, Some(Event::RequestsCleared));
    }

    unsub1.unsubscribe();
    assert_eq!(pubsub.active_topics(), 2);
    assert_eq!(timeout(Duration::from_secs(2), rx1.recv()).await.unwrap(), None);

    // the remaining subscriber keeps receiving
    pubsub.publish("topic", Event::RequestsCleared).await.unwrap();
    let got = timeout(Duration::from_secs(2), rx2.recv()).await.unwrap();
    assert_eq!(got, Some(Event::RequestsCleared));

    unsub2.unsubscribe();
    unsub3.unsubscribe();
    assert_eq!(pubsub.active_topics(), 0);
    assert_eq!(timeout(Duration::from_secs(2), rx2.recv()).await.unwrap(), None);

    pubsub.close().await.unwrap();
}
