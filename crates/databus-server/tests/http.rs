//! Router-level tests: request parsing, status-code mapping and response
//! shapes, driven through `tower::ServiceExt::oneshot`.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use databus_core::{start_intake, BusSettings, Clock, Databus, ManualClock};
use databus_db::{create_pool, run_migrations, DbRuntimeSettings};
use databus_server::{app, AppState};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

struct TestServer {
    router: Router,
    bus: Databus,
    _dir: TempDir,
}

fn server() -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("databus.db");
    let pool = create_pool(
        path.to_str().unwrap(),
        DbRuntimeSettings {
            busy_timeout_ms: 5_000,
            pool_max_size: 4,
        },
    )
    .unwrap();
    run_migrations(&pool.get().unwrap()).unwrap();

    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_700_000_000_000));
    let bus = Databus::new(pool, clock, BusSettings::default());
    let (sink, _intake) = start_intake(bus.clone());
    TestServer {
        router: app(AppState {
            bus: bus.clone(),
            sink,
        }),
        bus,
        _dir: dir,
    }
}

async fn send(router: &Router, method: Method, uri: &str, body: &str) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if body.starts_with('{') || body.starts_with('[') {
        builder = builder.header(header::CONTENT_TYPE, "application/json");
    }
    let response = router
        .clone()
        .oneshot(builder.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

async fn mutate(router: &Router, table: &str, key: &str) {
    let body = json!({ "table": table, "key": key }).to_string();
    let (status, _) = send(router, Method::POST, "/bus/1/_mutation", &body).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn health_check_returns_ok() {
    let s = server();
    let (status, json) = send(&s.router, Method::GET, "/health", "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn subscribe_poll_ack_round() {
    let s = server();
    let (status, json) = send(
        &s.router,
        Method::PUT,
        "/bus/1/s1?ttl=3600&eventTtl=600",
        r#"table("review")"#,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);

    let (status, json) = send(&s.router, Method::GET, "/bus/1/s1", "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["name"], "s1");
    assert_eq!(json["eventTtlSecs"], 600);
    assert_eq!(json["subscriptionTtlSecs"], 3600);

    mutate(&s.router, "review", "r1").await;
    mutate(&s.router, "answer", "a1").await;

    // The intake applies mutations asynchronously; a long poll waits for it.
    let (status, json) = send(&s.router, Method::GET, "/bus/1/s1/poll?ttl=60&includeTags=true", "").await;
    assert_eq!(status, StatusCode::OK);
    let events = json.as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["content"]["~table"], "review");
    assert_eq!(events[0]["content"]["~id"], "r1");
    assert_eq!(events[0]["tags"], json!([]));

    let (_, count) = send(&s.router, Method::GET, "/bus/1/s1/claimcount", "").await;
    assert_eq!(count, 1);

    let keys = json!([events[0]["eventKey"]]).to_string();
    let (status, _) = send(&s.router, Method::POST, "/bus/1/s1/renew?ttl=120", &keys).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&s.router, Method::POST, "/bus/1/s1/ack", &keys).await;
    assert_eq!(status, StatusCode::OK);

    let (_, size) = send(&s.router, Method::GET, "/bus/1/s1/size", "").await;
    assert_eq!(size, 0);
}

#[tokio::test]
async fn peek_hides_tags_unless_requested() {
    let s = server();
    send(&s.router, Method::PUT, "/bus/1/s1", "").await;
    let (status, _) = send(
        &s.router,
        Method::POST,
        "/bus/1/s1/inject?table=review&key=r9",
        "",
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, json) = send(&s.router, Method::GET, "/bus/1/s1/peek", "").await;
    assert_eq!(json[0]["content"]["~id"], "r9");
    assert!(json[0].get("tags").is_none());

    let (_, json) = send(&s.router, Method::GET, "/bus/1/s1/peek?includeTags=true", "").await;
    assert_eq!(json[0]["tags"], json!([]));

    let (_, size) = send(&s.router, Method::GET, "/bus/1/s1/size?limit=5", "").await;
    assert_eq!(size, 1);
}

#[tokio::test]
async fn errors_map_to_status_codes() {
    let s = server();

    let (status, json) = send(&s.router, Method::GET, "/bus/1/missing", "").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].as_str().unwrap().contains("missing"));

    let (status, _) = send(&s.router, Method::PUT, "/bus/1/s1", "table(").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    send(&s.router, Method::PUT, "/bus/1/s1", "").await;

    // No body means no keys.
    let (status, _) = send(&s.router, Method::POST, "/bus/1/s1/ack", "").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = send(&s.router, Method::POST, "/bus/1/s1/ack", "[1, 2").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = send(&s.router, Method::POST, "/bus/1/s1/renew", "").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&s.router, Method::GET, "/bus/1/s1/peek?limit=0", "").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&s.router, Method::POST, "/bus/1/_move?from=s1", "").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&s.router, Method::GET, "/bus/1/_move/nope", "").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &s.router,
        Method::POST,
        "/bus/1/s1/replay?since=2000-01-01T00:00:00Z",
        "",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&s.router, Method::POST, "/bus/1/missing/inject?table=t&key=k", "").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &s.router,
        Method::POST,
        "/bus/1/_mutation",
        r#"{"table": "", "key": "k"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn deeply_nested_condition_is_rejected() {
    let s = server();
    let depth = 100_000;
    let body = format!("{}alwaysTrue(){}", "not(".repeat(depth), ")".repeat(depth));

    let (status, json) = send(&s.router, Method::PUT, "/bus/1/deep", &body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("nested deeper"));

    let (status, _) = send(&s.router, Method::GET, "/bus/1/deep", "").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn reads_on_unknown_subscription_are_empty() {
    let s = server();
    let (status, json) = send(&s.router, Method::GET, "/bus/1/ghost/poll?ignoreLongPoll=true", "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, json!([]));

    let (_, size) = send(&s.router, Method::GET, "/bus/1/ghost/size", "").await;
    assert_eq!(size, 0);
}

#[tokio::test]
async fn listing_pages_by_name() {
    let s = server();
    for name in ["a", "b", "c"] {
        send(&s.router, Method::PUT, &format!("/bus/1/{name}"), "").await;
    }

    let (status, json) = send(&s.router, Method::GET, "/bus/1?limit=2", "").await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = json
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["a", "b"]);

    let (_, json) = send(&s.router, Method::GET, "/bus/1?from=b", "").await;
    assert_eq!(json.as_array().unwrap().len(), 1);
    assert_eq!(json[0]["name"], "c");
}

#[tokio::test]
async fn move_and_replay_report_status() {
    let s = server();
    send(&s.router, Method::PUT, "/bus/1/from", "").await;
    send(&s.router, Method::PUT, "/bus/1/to", r#"table("none")"#).await;
    for i in 0..3 {
        send(
            &s.router,
            Method::POST,
            &format!("/bus/1/from/inject?table=review&key=r{i}"),
            "",
        )
        .await;
    }

    let (status, json) = send(&s.router, Method::POST, "/bus/1/_move?from=from&to=to", "").await;
    assert_eq!(status, StatusCode::OK);
    let move_id = json["id"].as_str().unwrap().to_string();

    let mut report = Value::Null;
    for _ in 0..200 {
        let (_, json) = send(&s.router, Method::GET, &format!("/bus/1/_move/{move_id}"), "").await;
        if json["status"] == "COMPLETE" || json["status"] == "FAILED" {
            report = json;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
    assert_eq!(report["status"], "COMPLETE");
    assert_eq!(report["processed"], 3);
    assert_eq!(s.bus.event_count("to").await.unwrap(), 3);

    let (status, json) = send(&s.router, Method::POST, "/bus/1/to/replay", "").await;
    assert_eq!(status, StatusCode::OK);
    let replay_id = json["id"].as_str().unwrap().to_string();

    let (status, json) = send(&s.router, Method::GET, &format!("/bus/1/_replay/{replay_id}"), "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["subscription"], "to");

    // Job ids are kind-specific.
    let (status, _) = send(&s.router, Method::GET, &format!("/bus/1/_replay/{move_id}"), "").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unclaim_purge_and_unsubscribe() {
    let s = server();
    send(&s.router, Method::PUT, "/bus/1/s1", "").await;
    send(&s.router, Method::POST, "/bus/1/s1/inject?table=t&key=k1", "").await;
    send(&s.router, Method::POST, "/bus/1/s1/inject?table=t&key=k2", "").await;

    let (_, polled) = send(&s.router, Method::GET, "/bus/1/s1/poll?ignoreLongPoll=true", "").await;
    assert_eq!(polled.as_array().unwrap().len(), 2);

    let (status, _) = send(&s.router, Method::POST, "/bus/1/s1/unclaimall", "").await;
    assert_eq!(status, StatusCode::OK);
    let (_, count) = send(&s.router, Method::GET, "/bus/1/s1/claimcount", "").await;
    assert_eq!(count, 0);

    let (status, _) = send(&s.router, Method::POST, "/bus/1/s1/purge", "").await;
    assert_eq!(status, StatusCode::OK);
    let (_, size) = send(&s.router, Method::GET, "/bus/1/s1/size", "").await;
    assert_eq!(size, 0);

    let (status, _) = send(&s.router, Method::DELETE, "/bus/1/s1", "").await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&s.router, Method::GET, "/bus/1/s1", "").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
