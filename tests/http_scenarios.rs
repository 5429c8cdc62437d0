use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use warp::{Filter, Reply};

use webhook_tester::data_capture::CaptureSettings;
use webhook_tester::pubsub::MemoryPubSub;
use webhook_tester::storage::MemoryStorage;
use webhook_tester::web_interface::{ApiSettings, LiveFeedSettings, ServerSettings, WebServer};

struct Harness {
    pubsub: Arc<MemoryPubSub>,
    server: WebServer,
}

fn harness(max_requests: usize, max_body: usize) -> Harness {
    let storage = Arc::new(MemoryStorage::new(Duration::from_secs(3600), max_requests));
    let pubsub = Arc::new(MemoryPubSub::new());
    let settings = ServerSettings {
        addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        capture: CaptureSettings {
            max_body_bytes: max_body,
            ..CaptureSettings::default()
        },
        api: ApiSettings {
            max_requests,
            session_ttl: Duration::from_secs(3600),
            max_request_body_size: max_body,
            write_timeout: Duration::from_secs(60),
        },
        live_feed: LiveFeedSettings::default(),
    };
    let server = WebServer::new(storage, pubsub.clone(), settings, CancellationToken::new());
    Harness { pubsub, server }
}

async fn create_session<F>(routes: &F, payload: Value) -> Uuid
where
    F: Filter + 'static,
    F::Extract: Reply + Send,
{
    let res = warp::test::request()
        .method("POST")
        .path("/api/session")
        .json(&payload)
        .reply(routes)
        .await;
    assert_eq!(res.status(), 200, "{:?}", res.body());
    let body: Value = serde_json::from_slice(res.body()).unwrap();
    body["uuid"].as_str().unwrap().parse().unwrap()
}

async fn list_requests<F>(routes: &F, sid: Uuid) -> Vec<Value>
where
    F: Filter + 'static,
    F::Extract: Reply + Send,
{
    let res = warp::test::request()
        .path(&format!("/api/session/{}/requests", sid))
        .reply(routes)
        .await;
    assert_eq!(res.status(), 200);
    serde_json::from_slice(res.body()).unwrap()
}

#[tokio::test]
async fn test_capture_and_list() {
    let h = harness(128, 1024);
    let routes = h.server.routes();
    let sid = create_session(
        &routes,
        json!({"status_code": 202, "content_type": "foo/bar", "response_body_base64": "Zm9v"}),
    )
    .await;

    let res = warp::test::request()
        .method("PUT")
        .path(&format!("/{}", sid))
        .header("X-Forwarded-For", "4.4.4.4")
        .remote_addr("10.1.1.1:4000".parse().unwrap())
        .body("foo=bar")
        .reply(&routes)
        .await;
    assert_eq!(res.status(), 202);
    assert_eq!(res.body().as_ref(), b"foo");
    assert_eq!(res.headers()["content-type"], "foo/bar");

    let list = list_requests(&routes, sid).await;
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["method"], "PUT");
    assert_eq!(list[0]["client_address"], "4.4.4.4");
    let body = BASE64.decode(list[0]["content_base64"].as_str().unwrap()).unwrap();
    assert_eq!(body, b"foo=bar");
}

#[tokio::test]
async fn test_status_override() {
    let h = harness(128, 1024);
    let routes = h.server.routes();
    let sid = create_session(&routes, json!({"status_code": 203, "response_delay": 0})).await;

    let res = warp::test::request()
        .method("PUT")
        .path(&format!("/{}/222", sid))
        .reply(&routes)
        .await;
    assert_eq!(res.status(), 222);

    let res = warp::test::request()
        .method("PUT")
        .path(&format!("/{}/999", sid))
        .reply(&routes)
        .await;
    assert_eq!(res.status(), 203);
}

#[tokio::test]
async fn test_response_delay() {
    let h = harness(128, 1024);
    let routes = h.server.routes();
    let sid = create_session(&routes, json!({"response_delay": 1})).await;

    let started = Instant::now();
    let res = warp::test::request()
        .method("PUT")
        .path(&format!("/{}", sid))
        .reply(&routes)
        .await;
    let elapsed = started.elapsed();

    assert_eq!(res.status(), 200);
    assert!(elapsed >= Duration::from_secs(1), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1500), "{:?}", elapsed);
}

#[tokio::test]
async fn test_ring_keeps_newest() {
    let h = harness(2, 1024);
    let routes = h.server.routes();
    let sid = create_session(&routes, json!({})).await;

    for ip in ["1.1.1.1", "2.2.2.2", "3.3.3.3"] {
        let res = warp::test::request()
            .method("PUT")
            .path(&format!("/{}", sid))
            .header("X-Real-IP", ip)
            .reply(&routes)
            .await;
        assert_eq!(res.status(), 200);
    }

    let list = list_requests(&routes, sid).await;
    let addrs: Vec<&str> = list
        .iter()
        .map(|r| r["client_address"].as_str().unwrap())
        .collect();
    assert_eq!(addrs, vec!["3.3.3.3", "2.2.2.2"]);
}

async fn next_frame(client: &mut warp::test::WsClient) -> Value {
    let msg = tokio::time::timeout(Duration::from_millis(500), client.recv())
        .await
        .expect("frame within 500ms")
        .expect("open socket");
    serde_json::from_str(msg.to_str().expect("text frame")).unwrap()
}

#[tokio::test]
async fn test_live_feed_events() {
    let h = harness(128, 1024);
    let routes = h.server.routes();
    let sid = create_session(&routes, json!({})).await;

    let mut client = warp::test::ws()
        .path(&format!("/ws/session/{}", sid))
        .handshake(routes.clone())
        .await
        .expect("handshake");

    let deadline = Instant::now() + Duration::from_secs(2);
    while h.pubsub.subscribers(&sid.to_string()) == 0 {
        assert!(Instant::now() < deadline, "feed never subscribed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    warp::test::request()
        .method("PUT")
        .path(&format!("/{}", sid))
        .body("hello")
        .reply(&routes)
        .await;
    let frame = next_frame(&mut client).await;
    assert_eq!(frame["name"], "request-created");
    let rid = frame["data"].as_str().unwrap().to_string();

    let res = warp::test::request()
        .method("DELETE")
        .path(&format!("/api/session/{}/requests/{}", sid, rid))
        .reply(&routes)
        .await;
    assert_eq!(res.status(), 200);
    assert_eq!(next_frame(&mut client).await, json!({"name": "request-deleted", "data": rid}));

    let res = warp::test::request()
        .method("DELETE")
        .path(&format!("/api/session/{}/requests", sid))
        .reply(&routes)
        .await;
    assert_eq!(res.status(), 200);
    assert_eq!(next_frame(&mut client).await, json!({"name": "requests-cleared", "data": "*"}));
}

#[tokio::test]
async fn test_oversized_body_not_persisted() {
    let h = harness(128, 16);
    let routes = h.server.routes();
    let sid = create_session(&routes, json!({})).await;

    let res = warp::test::request()
        .method("PUT")
        .path(&format!("/{}", sid))
        .body(vec![b'a'; 16])
        .reply(&routes)
        .await;
    assert_eq!(res.status(), 200);

    let res = warp::test::request()
        .method("PUT")
        .path(&format!("/{}", sid))
        .body(vec![b'a'; 17])
        .reply(&routes)
        .await;
    assert_eq!(res.status(), 413);

    assert_eq!(list_requests(&routes, sid).await.len(), 1);
}

#[tokio::test]
async fn test_unknown_routes_and_sessions() {
    let h = harness(128, 1024);
    let routes = h.server.routes();

    let res = warp::test::request()
        .path(&format!("/{}", Uuid::new_v4()))
        .reply(&routes)
        .await;
    assert_eq!(res.status(), 404);
    assert!(String::from_utf8_lossy(res.body()).contains("session not found"));

    let res = warp::test::request().path("/api/nothing").reply(&routes).await;
    assert_eq!(res.status(), 404);
    let body: Value = serde_json::from_slice(res.body()).unwrap();
    assert!(body["message"].is_string());

    let res = warp::test::request()
        .method("POST")
        .path("/api/session")
        .header("content-type", "application/json")
        .body("{not json")
        .reply(&routes)
        .await;
    assert_eq!(res.status(), 400);

    let res = warp::test::request().path("/").reply(&routes).await;
    assert_eq!(res.status(), 200);
}
