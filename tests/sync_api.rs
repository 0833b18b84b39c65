//! HTTP-level tests for the sync and entity endpoints

use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, Request, StatusCode},
};
use axum_test::{TestRequest, TestServer};
use serde_json::{json, Value};
use tower::ServiceExt;

use mobile_sync_server::{build_router, config::Config, db, state::AppState};

async fn test_state() -> AppState {
    let pool = db::create_memory_pool().await.unwrap();
    AppState::new(Config::default(), pool)
}

async fn test_server() -> TestServer {
    TestServer::new(build_router(test_state().await)).unwrap()
}

fn header(name: &'static str, value: &str) -> (HeaderName, HeaderValue) {
    (
        HeaderName::from_static(name),
        HeaderValue::from_str(value).unwrap(),
    )
}

/// Authenticated request from `user-1` in `org-1`, optionally from a device
fn as_device(request: TestRequest, device: Option<&str>) -> TestRequest {
    let (user_name, user_value) = header("x-user-id", "user-1");
    let (org_name, org_value) = header("x-organization-id", "org-1");
    let request = request
        .add_header(user_name, user_value)
        .add_header(org_name, org_value);

    match device {
        Some(device_id) => {
            let (name, value) = header("x-device-id", device_id);
            request.add_header(name, value)
        }
        None => request,
    }
}

async fn pull(server: &TestServer, device: &str, body: Value) -> Value {
    let response = as_device(server.post("/api/v1/sync/pull"), Some(device))
        .json(&body)
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    response.json::<Value>()
}

async fn push(server: &TestServer, device: &str, changes: Value) -> Value {
    let response = as_device(server.post("/api/v1/sync/push"), Some(device))
        .json(&json!({ "changes": changes }))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    response.json::<Value>()
}

#[tokio::test]
async fn test_stale_push_after_direct_edit_conflicts() {
    let server = test_server().await;

    // Device A creates a reservation
    let created = push(
        &server,
        "device-a",
        json!([{
            "entityType": "reservation",
            "operation": "CREATE",
            "clientId": "tmp-1",
            "data": {"partySize": 2, "status": "PENDING"}
        }]),
    )
    .await;
    let id = created["data"]["applied"][0]["serverId"]
        .as_str()
        .unwrap()
        .to_string();
    assert_eq!(created["data"]["applied"][0]["serverVersion"], 1);

    // Device B pulls it at version 1
    let pulled = pull(&server, "device-b", json!({})).await;
    let record = &pulled["data"]["reservations"][0];
    assert_eq!(record["entityId"], id.as_str());
    assert_eq!(record["operation"], "UPDATE");
    assert_eq!(record["version"], 1);

    // Device A edits it directly to version 2
    let (version_name, version_value) = header("x-entity-version", "1");
    let patched = as_device(
        server.patch(&format!("/api/v1/entities/reservations/{id}")),
        Some("device-a"),
    )
    .add_header(version_name, version_value)
    .json(&json!({"status": "CONFIRMED"}))
    .await;
    assert_eq!(patched.status_code(), StatusCode::OK);
    assert_eq!(patched.json::<Value>()["data"]["version"], 2);

    // Device B pushes a stale update
    let stale = push(
        &server,
        "device-b",
        json!([{
            "entityType": "reservation",
            "entityId": id,
            "operation": "UPDATE",
            "version": 1,
            "data": {"partySize": 5}
        }]),
    )
    .await;

    let data = &stale["data"];
    assert_eq!(data["applied"], json!([]));
    assert_eq!(data["conflicts"][0]["conflict"], true);
    assert_eq!(data["conflicts"][0]["type"], "VERSION_MISMATCH");
    assert_eq!(data["conflicts"][0]["serverData"]["version"], 2);
    assert_eq!(data["conflicts"][0]["serverData"]["status"], "CONFIRMED");
    assert_eq!(data["stats"]["conflicts"], 1);
}

#[tokio::test]
async fn test_identity_headers_are_required() {
    let server = test_server().await;

    let no_device = as_device(server.post("/api/v1/sync/pull"), None)
        .json(&json!({}))
        .await;
    assert_eq!(no_device.status_code(), StatusCode::BAD_REQUEST);
    let body = no_device.json::<Value>();
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "DEVICE_ID_REQUIRED");

    let anonymous = server.post("/api/v1/sync/pull").json(&json!({})).await;
    assert_eq!(anonymous.status_code(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_second_pull_is_empty_and_rotates_token() {
    let server = test_server().await;
    push(
        &server,
        "device-a",
        json!([{"entityType": "order", "operation": "CREATE", "data": {"total": 12}}]),
    )
    .await;

    let first = pull(&server, "device-b", json!({})).await;
    assert_eq!(first["data"]["orders"].as_array().unwrap().len(), 1);
    assert_eq!(first["meta"]["hasMore"], false);
    assert_eq!(first["meta"]["deviceId"], "device-b");

    let second = pull(&server, "device-b", json!({})).await;
    for collection in ["reservations", "orders", "customers", "menu", "notifications", "deletions"] {
        assert_eq!(second["data"][collection], json!([]), "{collection} should be empty");
    }
    assert_ne!(first["meta"]["syncToken"], second["meta"]["syncToken"]);
}

#[tokio::test]
async fn test_batch_partial_failure_still_returns_200() {
    let server = test_server().await;

    let result = push(
        &server,
        "device-a",
        json!([
            {"entityType": "customer", "operation": "CREATE", "data": {"name": "Ada"}},
            {"entityType": "spaceship", "operation": "CREATE", "data": {}},
            {"entityType": "customer", "operation": "UPDATE", "entityId": "missing", "version": 1, "data": {}},
            {"entityType": "customer", "operation": "CREATE", "data": {"name": "Grace"}}
        ]),
    )
    .await;

    let data = &result["data"];
    assert_eq!(data["stats"], json!({"total": 4, "applied": 2, "conflicts": 1, "errors": 1}));
    assert_eq!(data["errors"][0]["entityType"], "spaceship");
    assert!(data["errors"][0]["error"].is_string());
    assert_eq!(data["conflicts"][0]["type"], "ENTITY_NOT_FOUND");
}

#[tokio::test]
async fn test_delete_is_idempotent_and_pulled_as_deletion() {
    let server = test_server().await;
    push(
        &server,
        "device-a",
        json!([{"entityType": "order", "entityId": "o-1", "operation": "CREATE", "data": {}}]),
    )
    .await;

    let delete = json!([{"entityType": "order", "entityId": "o-1", "operation": "DELETE", "version": 1}]);
    let first = push(&server, "device-a", delete.clone()).await;
    let second = push(&server, "device-a", delete).await;

    assert_eq!(first["data"]["applied"][0]["serverVersion"], 2);
    assert!(first["data"]["applied"][0].get("alreadyDeleted").is_none());
    assert_eq!(second["data"]["applied"][0]["alreadyDeleted"], true);
    assert_eq!(second["data"]["conflicts"], json!([]));

    let pulled = pull(&server, "device-b", json!({"entityTypes": ["orders"]})).await;
    assert_eq!(pulled["data"]["orders"][0]["operation"], "DELETE");
    assert_eq!(pulled["data"]["deletions"][0]["entityId"], "o-1");
    assert_eq!(pulled["data"]["deletions"][0]["entityType"], "order");
}

#[tokio::test]
async fn test_merge_resolution_over_http() {
    let server = test_server().await;
    push(
        &server,
        "device-a",
        json!([{"entityType": "reservation", "entityId": "r-1", "operation": "CREATE",
                "data": {"status": "PENDING", "note": "a"}}]),
    )
    .await;
    push(
        &server,
        "device-a",
        json!([{"entityType": "reservation", "entityId": "r-1", "operation": "UPDATE",
                "version": 1, "data": {"status": "SEATED"}}]),
    )
    .await;

    let conflicted = push(
        &server,
        "device-b",
        json!([{"entityType": "reservation", "entityId": "r-1", "operation": "UPDATE",
                "version": 1, "data": {"note": "b"}}]),
    )
    .await;
    let conflicts = conflicted["data"]["conflicts"].clone();

    let response = as_device(server.post("/api/v1/sync/resolve-conflicts"), Some("device-b"))
        .json(&json!({
            "conflicts": conflicts,
            "resolutions": [{"strategy": "MERGE"}]
        }))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let body = response.json::<Value>();
    let resolved = &body["data"]["resolved"][0];
    assert_eq!(resolved["outcome"], "MERGED");
    assert_eq!(resolved["serverVersion"], 3);
    assert_eq!(resolved["data"]["status"], "SEATED");
    assert_eq!(resolved["data"]["note"], "b");
    assert_eq!(resolved["data"]["createdAt"], conflicts[0]["serverData"]["createdAt"]);
    assert_eq!(resolved["data"]["id"], "r-1");
    assert_eq!(body["data"]["stats"], json!({"total": 1, "resolved": 1, "remaining": 0}));
}

#[tokio::test]
async fn test_direct_edit_version_guard() {
    let server = test_server().await;

    let created = as_device(server.post("/api/v1/entities/customers"), None)
        .json(&json!({"name": "Ada", "version": 42}))
        .await;
    assert_eq!(created.status_code(), StatusCode::CREATED);
    let entity = created.json::<Value>()["data"].clone();
    assert_eq!(entity["version"], 1);
    let id = entity["id"].as_str().unwrap().to_string();
    let path = format!("/api/v1/entities/customers/{id}");

    let missing_version = as_device(server.put(&path), None)
        .json(&json!({"name": "Grace"}))
        .await;
    assert_eq!(missing_version.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(missing_version.json::<Value>()["code"], "VERSION_REQUIRED");

    let (name, value) = header("if-match", "\"1\"");
    let replaced = as_device(server.put(&path), None)
        .add_header(name, value)
        .json(&json!({"name": "Grace"}))
        .await;
    assert_eq!(replaced.status_code(), StatusCode::OK);

    let (name, value) = header("x-entity-version", "1");
    let stale = as_device(server.patch(&path), None)
        .add_header(name, value)
        .json(&json!({"name": "Linus"}))
        .await;
    assert_eq!(stale.status_code(), StatusCode::CONFLICT);
    let body = stale.json::<Value>();
    assert_eq!(body["code"], "VERSION_CONFLICT");
    assert_eq!(body["clientVersion"], 1);
    assert_eq!(body["serverVersion"], 2);
    assert_eq!(body["serverData"]["name"], "Grace");

    let deleted = as_device(server.delete(&path), None).await;
    assert_eq!(deleted.status_code(), StatusCode::OK);
    assert_eq!(deleted.json::<Value>()["data"]["version"], 3);

    let gone = as_device(server.get(&path), None).await;
    assert_eq!(gone.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_stale_sync_token_blocks_direct_write() {
    let server = test_server().await;
    let first = pull(&server, "device-a", json!({})).await;
    let old_token = first["meta"]["syncToken"].as_str().unwrap().to_string();
    let current = pull(&server, "device-a", json!({})).await;

    let created = as_device(server.post("/api/v1/entities/orders"), None)
        .json(&json!({"total": 3}))
        .await;
    let id = created.json::<Value>()["data"]["id"].as_str().unwrap().to_string();

    let (version_name, version_value) = header("x-entity-version", "1");
    let (token_name, token_value) = header("x-sync-token", &old_token);
    let response = as_device(
        server.patch(&format!("/api/v1/entities/orders/{id}")),
        Some("device-a"),
    )
    .add_header(version_name, version_value)
    .add_header(token_name, token_value)
    .json(&json!({"total": 4}))
    .await;

    assert_eq!(response.status_code(), StatusCode::CONFLICT);
    let body = response.json::<Value>();
    assert_eq!(body["code"], "SYNC_CONFLICT");
    assert_eq!(body["clientSyncToken"], old_token.as_str());
    assert_eq!(body["serverSyncToken"], current["meta"]["syncToken"]);
}

#[tokio::test]
async fn test_settings_reset_and_status() {
    let server = test_server().await;
    pull(&server, "device-a", json!({})).await;

    let settings = as_device(server.put("/api/v1/sync/settings"), Some("device-a"))
        .json(&json!({"conflictResolutionStrategy": "CLIENT_WINS"}))
        .await;
    assert_eq!(settings.status_code(), StatusCode::OK);
    assert_eq!(
        settings.json::<Value>()["data"]["conflictResolutionStrategy"],
        "CLIENT_WINS"
    );

    let reset = as_device(server.post("/api/v1/sync/reset"), Some("device-a")).await;
    assert_eq!(reset.status_code(), StatusCode::OK);
    assert_eq!(
        reset.json::<Value>()["data"]["lastSyncAt"],
        "1970-01-01T00:00:00Z"
    );

    let status = as_device(server.get("/api/v1/sync/status"), Some("device-a")).await;
    assert_eq!(status.status_code(), StatusCode::OK);
    let body = status.json::<Value>();
    assert_eq!(body["data"]["session"]["deviceId"], "device-a");
    assert!(body["data"]["recentOperations"].as_i64().unwrap() >= 2);
}

#[tokio::test]
async fn test_malformed_requests_are_400() {
    let server = test_server().await;

    let unknown_type = as_device(server.post("/api/v1/sync/pull"), Some("device-a"))
        .json(&json!({"entityTypes": ["spaceships"]}))
        .await;
    assert_eq!(unknown_type.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(unknown_type.json::<Value>()["code"], "UNSUPPORTED_ENTITY_TYPE");

    let not_a_batch = as_device(server.post("/api/v1/sync/push"), Some("device-a"))
        .json(&json!({"changes": "nope"}))
        .await;
    assert_eq!(not_a_batch.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(not_a_batch.json::<Value>()["code"], "BAD_REQUEST");

    let bad_strategy = as_device(server.put("/api/v1/sync/settings"), Some("device-a"))
        .json(&json!({"conflictResolutionStrategy": "LAST_WRITE_WINS"}))
        .await;
    assert_eq!(bad_strategy.status_code(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health_check() {
    let app = build_router(test_state().await);

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["database"], "ok");
}
