//! The HTTP surface, driven through the router without a live listener.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use eventodb::server::{build_router, AppState};
use eventodb::store::sqlite::SqliteStore;
use futures::StreamExt;
use serde_json::{json, Value};
use tower::ServiceExt;

async fn test_app(test_mode: bool) -> (Router, AppState, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(dir.path()).await.unwrap();
    let state = AppState::new(Arc::new(store), test_mode, None);
    (build_router(state.clone()), state, dir)
}

async fn rpc_with_token(
    router: &Router,
    token: Option<&str>,
    call: Value,
) -> (StatusCode, Value) {
    let mut request = Request::builder()
        .method("POST")
        .uri("/rpc")
        .header("content-type", "application/json");
    if let Some(token) = token {
        request = request.header("authorization", format!("Bearer {token}"));
    }

    let response = router
        .clone()
        .oneshot(request.body(Body::from(call.to_string())).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn rpc(router: &Router, call: Value) -> (StatusCode, Value) {
    rpc_with_token(router, None, call).await
}

fn error_code(body: &Value) -> &str {
    body["error"]["code"].as_str().unwrap_or("")
}

#[tokio::test]
async fn health_reports_ok() {
    let (router, _state, _dir) = test_app(true).await;

    let response = router
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body, json!({ "status": "ok" }));
}

#[tokio::test]
async fn sys_methods_answer_without_auth_in_test_mode() {
    let (router, _state, _dir) = test_app(true).await;

    let (status, version) = rpc(&router, json!(["sys.version"])).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(version.as_str().unwrap(), env!("CARGO_PKG_VERSION"));

    let (status, health) = rpc(&router, json!(["sys.health"])).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "ok");
    assert_eq!(health["backend"], "sqlite");
}

#[tokio::test]
async fn write_then_read_round_trips_rows() {
    let (router, _state, _dir) = test_app(true).await;

    let (status, written) = rpc(
        &router,
        json!(["stream.write", "account-1", { "type": "Created", "data": { "bal": 0 } }]),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(written, json!({ "position": 0, "globalPosition": 1 }));

    let (status, rows) = rpc(&router, json!(["stream.get", "account-1"])).await;
    assert_eq!(status, StatusCode::OK);
    let rows = rows.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    let row = rows[0].as_array().unwrap();
    // [id, type, position, globalPosition, data, metadata, time]
    assert!(row[0].as_str().is_some());
    assert_eq!(row[1], "Created");
    assert_eq!(row[2], 0);
    assert_eq!(row[3], 1);
    assert_eq!(row[4], json!({ "bal": 0 }));
    assert_eq!(row[5], Value::Null);
    assert!(row[6].as_str().unwrap().ends_with('Z'));

    let (status, version) = rpc(&router, json!(["stream.version", "account-1"])).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(version, json!(0));

    let (_, last) = rpc(&router, json!(["stream.last", "account-1"])).await;
    assert_eq!(last.as_array().unwrap()[2], 0);
}

#[tokio::test]
async fn version_conflicts_surface_with_details() {
    let (router, _state, _dir) = test_app(true).await;

    for _ in 0..3 {
        rpc(
            &router,
            json!(["stream.write", "account-1", { "type": "Deposited" }]),
        )
        .await;
    }

    let (status, body) = rpc(
        &router,
        json!(["stream.write", "account-1", { "type": "Deposited" }, { "expectedVersion": 0 }]),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_code(&body), "STREAM_VERSION_CONFLICT");
    assert_eq!(body["error"]["details"], json!({ "expected": 0, "actual": 2 }));

    let (_, version) = rpc(&router, json!(["stream.version", "account-1"])).await;
    assert_eq!(version, json!(2));
}

#[tokio::test]
async fn category_reads_carry_stream_names() {
    let (router, _state, _dir) = test_app(true).await;

    for stream in ["account-1", "account-2", "account-3"] {
        rpc(
            &router,
            json!(["stream.write", stream, { "type": "Created" }]),
        )
        .await;
    }

    let (status, rows) = rpc(
        &router,
        json!(["category.get", "account", { "position": 1, "batchSize": 100 }]),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let rows = rows.as_array().unwrap();
    assert_eq!(rows.len(), 3);
    // [id, streamName, type, position, globalPosition, data, metadata, time]
    let streams: Vec<&str> = rows
        .iter()
        .map(|row| row.as_array().unwrap()[1].as_str().unwrap())
        .collect();
    assert_eq!(streams, vec!["account-1", "account-2", "account-3"]);
    let globals: Vec<i64> = rows
        .iter()
        .map(|row| row.as_array().unwrap()[4].as_i64().unwrap())
        .collect();
    assert!(globals.windows(2).all(|pair| pair[0] < pair[1]));
}

#[tokio::test]
async fn consumer_groups_partition_over_the_wire() {
    let (router, _state, _dir) = test_app(true).await;

    for stream in ["account-1+a", "account-1+b", "account-2+a"] {
        rpc(
            &router,
            json!(["stream.write", stream, { "type": "Noted" }]),
        )
        .await;
    }

    let mut seen = Vec::new();
    for member in 0..2 {
        let (status, rows) = rpc(
            &router,
            json!(["category.get", "account", { "consumerGroup": { "member": member, "size": 2 } }]),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        for row in rows.as_array().unwrap() {
            seen.push((
                member,
                row.as_array().unwrap()[1].as_str().unwrap().to_string(),
            ));
        }
    }

    assert_eq!(seen.len(), 3);
    let member_of = |stream: &str| {
        seen.iter()
            .find(|(_, s)| s == stream)
            .map(|(m, _)| *m)
            .unwrap()
    };
    assert_eq!(member_of("account-1+a"), member_of("account-1+b"));
}

#[tokio::test]
async fn malformed_requests_map_to_400() {
    let (router, _state, _dir) = test_app(true).await;

    let (status, body) = rpc(&router, json!({ "not": "an array" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "INVALID_REQUEST");

    let (status, body) = rpc(&router, json!(["stream.get", "account-1", { "batchSize": 20000 }])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "INVALID_REQUEST");
    assert_eq!(body["error"]["details"]["batchSize"], 20000);

    let (status, body) = rpc(&router, json!(["stream.version", 42])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "INVALID_REQUEST");

    let (status, body) = rpc(&router, json!(["no.such.method"])).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_code(&body), "METHOD_NOT_FOUND");
}

#[tokio::test]
async fn missing_streams_are_404_only_for_last() {
    let (router, _state, _dir) = test_app(true).await;

    let (status, body) = rpc(&router, json!(["stream.last", "ghost-1"])).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_code(&body), "STREAM_NOT_FOUND");

    let (status, rows) = rpc(&router, json!(["stream.get", "ghost-1"])).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(rows, json!([]));

    let (status, version) = rpc(&router, json!(["stream.version", "ghost-1"])).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(version, Value::Null);
}

#[tokio::test]
async fn tokens_bind_requests_to_their_namespace() {
    let (router, _state, _dir) = test_app(false).await;

    // No credentials outside test mode.
    let (status, body) = rpc(&router, json!(["stream.get", "account-1"])).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(error_code(&body), "AUTH_REQUIRED");

    let (status, created) = rpc(&router, json!(["ns.create", "tenant_a"])).await;
    assert_eq!(status, StatusCode::OK);
    let token_a = created["token"].as_str().unwrap().to_string();
    assert!(token_a.starts_with("tenant_a."));

    let (_, created) = rpc(&router, json!(["ns.create", "tenant_b"])).await;
    let token_b = created["token"].as_str().unwrap().to_string();

    let (status, _) = rpc_with_token(
        &router,
        Some(token_a.as_str()),
        json!(["stream.write", "account-1", { "type": "Created" }]),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Tenant B sees nothing of tenant A.
    let (status, rows) = rpc_with_token(&router, Some(token_b.as_str()), json!(["stream.get", "account-1"])).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(rows, json!([]));

    // A forged token is rejected.
    let (status, body) = rpc_with_token(
        &router,
        Some("tenant_a.wrong_secret"),
        json!(["stream.get", "account-1"]),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(error_code(&body), "AUTH_INVALID_TOKEN");

    // Namespace admin requires that namespace's own token.
    let (status, body) = rpc_with_token(&router, Some(token_b.as_str()), json!(["ns.delete", "tenant_a"])).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(error_code(&body), "AUTH_UNAUTHORIZED");

    let (status, deleted) =
        rpc_with_token(&router, Some(token_a.as_str()), json!(["ns.delete", "tenant_a"])).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deleted["messagesDeleted"], 1);
}

#[tokio::test]
async fn namespace_lifecycle_over_the_wire() {
    let (router, _state, _dir) = test_app(true).await;

    let (status, created) = rpc(
        &router,
        json!(["ns.create", "acct", { "description": "accounts", "token": "acct.s3cret" }]),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["namespace"], "acct");
    assert_eq!(created["token"], "acct.s3cret");

    let (status, body) = rpc(&router, json!(["ns.create", "acct"])).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_code(&body), "NAMESPACE_EXISTS");

    let (status, body) = rpc(
        &router,
        json!(["ns.create", "acct2", { "token": "mismatch.s3cret" }]),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "INVALID_REQUEST");

    let (status, info) = rpc(&router, json!(["ns.info", "acct"])).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["messageCount"], 0);
    assert_eq!(info["lastActivity"], Value::Null);

    let (status, list) = rpc(&router, json!(["ns.list"])).await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = list
        .as_array()
        .unwrap()
        .iter()
        .map(|ns| ns["namespace"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&"acct"));

    let (status, body) = rpc(&router, json!(["ns.delete", "ghost"])).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_code(&body), "NAMESPACE_NOT_FOUND");
}

#[tokio::test]
async fn stream_and_category_listings_over_the_wire() {
    let (router, _state, _dir) = test_app(true).await;

    for stream in ["account-1", "account-2", "billing-1"] {
        rpc(
            &router,
            json!(["stream.write", stream, { "type": "Noted" }]),
        )
        .await;
    }

    let (status, streams) = rpc(&router, json!(["ns.streams", { "prefix": "account-" }])).await;
    assert_eq!(status, StatusCode::OK);
    let streams = streams.as_array().unwrap();
    assert_eq!(streams.len(), 2);
    assert_eq!(streams[0]["stream"], "account-1");
    assert_eq!(streams[0]["version"], 0);

    let (status, categories) = rpc(&router, json!(["ns.categories"])).await;
    assert_eq!(status, StatusCode::OK);
    let categories = categories.as_array().unwrap();
    assert_eq!(categories.len(), 2);
    assert_eq!(categories[0]["category"], "account");
    assert_eq!(categories[0]["streamCount"], 2);
}

#[tokio::test]
async fn subscriptions_catch_up_and_clean_up() {
    let (router, state, _dir) = test_app(true).await;

    for n in 0..5 {
        rpc(
            &router,
            json!(["stream.write", "account-1", { "type": "Noted", "data": { "n": n } }]),
        )
        .await;
    }

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/subscribe?stream=account-1&position=0")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "text/event-stream"
    );

    let mut body = response.into_body().into_data_stream();
    let mut text = String::new();
    while text.matches("event: poke").count() < 5 {
        let chunk = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .expect("timed out waiting for pokes")
            .expect("body ended early")
            .unwrap();
        text.push_str(std::str::from_utf8(&chunk).unwrap());
    }

    // Pokes arrive with monotonically increasing positions from 0.
    let positions: Vec<i64> = text
        .lines()
        .filter(|line| line.starts_with("data:"))
        .map(|line| {
            let poke: Value = serde_json::from_str(line.trim_start_matches("data:").trim()).unwrap();
            assert_eq!(poke["stream"], "account-1");
            poke["position"].as_i64().unwrap()
        })
        .collect();
    assert_eq!(positions, vec![0, 1, 2, 3, 4]);

    // Dropping the connection unsubscribes the task.
    drop(body);
    for _ in 0..50 {
        if state.pubsub.subscriber_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(state.pubsub.subscriber_count(), 0);
}

#[tokio::test]
async fn subscriptions_validate_their_parameters() {
    let (router, _state, _dir) = test_app(true).await;

    for uri in [
        "/subscribe",
        "/subscribe?stream=account-1&category=account",
        "/subscribe?category=account&consumer=0",
        "/subscribe?category=account&consumer=2&size=2",
        "/subscribe?stream=account-1&consumer=0&size=2",
    ] {
        let response = router
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
    }
}

#[tokio::test]
async fn import_streams_progress_and_done() {
    let (router, _state, _dir) = test_app(true).await;

    let ndjson = concat!(
        r#"{"id":"018c2e65-0000-7000-8000-000000000001","stream":"account-1","type":"Created","pos":0,"gpos":1,"data":{"bal":0},"meta":null,"time":"2024-01-01T00:00:00Z"}"#,
        "\n",
        r#"{"id":"018c2e65-0000-7000-8000-000000000002","stream":"account-1","type":"Deposited","pos":1,"gpos":2,"data":{"bal":5},"meta":null,"time":"2024-01-01T00:00:01Z"}"#,
        "\n",
    );

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/import")
                .body(Body::from(ndjson))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = std::str::from_utf8(&bytes).unwrap();
    assert!(text.contains("event: done"));
    assert!(text.contains("\"imported\":2"));

    let (_, rows) = rpc(&router, json!(["stream.get", "account-1"])).await;
    assert_eq!(rows.as_array().unwrap().len(), 2);

    // A second import of the same positions is rejected whole.
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/import")
                .body(Body::from(ndjson))
                .unwrap(),
        )
        .await
        .unwrap();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = std::str::from_utf8(&bytes).unwrap();
    assert!(text.contains("event: error"));
    let (_, rows) = rpc(&router, json!(["stream.get", "account-1"])).await;
    assert_eq!(rows.as_array().unwrap().len(), 2);
}
