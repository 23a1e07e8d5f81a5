use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tokio::sync::watch;
use tower::util::ServiceExt; // for `oneshot`

use loadshare::api;
use loadshare::config::{GroupConfig, NodeConfig, WireConfig};
use loadshare::persist::Store;
use loadshare::services::enforcement::SimulatedEvse;
use loadshare::state::AppState;

fn test_app() -> (Router, AppState, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let node = NodeConfig {
        port: 8000,
        data_dir: dir.path().join("data"),
        device_id: "openevse-self".into(),
        host: "openevse-self.local".into(),
        discovery_interval_s: 60,
        mdns_enabled: false,
    };
    let store = Store::open(&node.data_dir).unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    std::mem::forget(shutdown_tx);

    let config = GroupConfig {
        enabled: true,
        group_id: "garage".into(),
        group_max_current_a: 50.0,
        ..Default::default()
    };

    let (state, _sync_rx) = AppState::new(
        node,
        config,
        Vec::new(),
        Arc::new(SimulatedEvse::default()),
        store,
        shutdown_rx,
    );
    (api::build_router(state.clone()), state, dir)
}

async fn request(
    app: Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let builder = Request::builder().uri(uri).method(method);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn health_check_responds() {
    let (app, _state, _dir) = test_app();
    let (status, body) = request(app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn add_peer_appears_in_list_as_joined() {
    let (app, _state, _dir) = test_app();

    let (status, body) = request(
        app.clone(),
        "POST",
        "/loadsharing/peers",
        Some(json!({"host": "openevse-b.local"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["msg"], "done");

    let (status, body) = request(app, "GET", "/loadsharing/peers", None).await;
    assert_eq!(status, StatusCode::OK);
    let peers = body.as_array().unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0]["host"], "openevse-b.local");
    assert_eq!(peers[0]["joined"], true);
    assert_eq!(peers[0]["online"], false);
    assert_eq!(peers[0]["id"], "unknown");
}

#[tokio::test]
async fn duplicate_and_invalid_hosts_are_rejected() {
    let (app, _state, _dir) = test_app();

    let (status, _) = request(
        app.clone(),
        "POST",
        "/loadsharing/peers",
        Some(json!({"host": "openevse-b.local"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Case-insensitive duplicate
    let (status, body) = request(
        app.clone(),
        "POST",
        "/loadsharing/peers",
        Some(json!({"host": "OPENEVSE-B.local"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["msg"], "Peer already in group");

    // No domain or IP
    let (status, _) = request(
        app.clone(),
        "POST",
        "/loadsharing/peers",
        Some(json!({"host": "garage"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // The node's own host
    let (status, _) = request(
        app,
        "POST",
        "/loadsharing/peers",
        Some(json!({"host": "openevse-self.local"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn remove_peer_round_trip() {
    let (app, _state, _dir) = test_app();

    let (status, _) = request(
        app.clone(),
        "DELETE",
        "/loadsharing/peers/openevse-x.local",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    request(
        app.clone(),
        "POST",
        "/loadsharing/peers",
        Some(json!({"host": "openevse-b.local"})),
    )
    .await;

    let (status, body) = request(
        app.clone(),
        "DELETE",
        "/loadsharing/peers/openevse-b.local",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["msg"], "done");

    let (_, body) = request(app, "GET", "/loadsharing/peers", None).await;
    assert!(body.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn discover_trigger_is_idempotent() {
    let (app, _state, _dir) = test_app();
    for _ in 0..3 {
        let (status, body) = request(app.clone(), "POST", "/loadsharing/discover", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["msg"], "done");
    }
}

#[tokio::test]
async fn loadsharing_status_reports_group_state() {
    let (app, _state, _dir) = test_app();

    request(
        app.clone(),
        "POST",
        "/loadsharing/peers",
        Some(json!({"host": "openevse-b.local"})),
    )
    .await;

    let (status, body) = request(app, "GET", "/loadsharing/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["enabled"], true);
    assert_eq!(body["group_id"], "garage");
    assert_eq!(body["config_consistent"], true);
    assert_eq!(body["online_count"], 0);
    assert_eq!(body["offline_count"], 1);
    assert_eq!(body["storage_ok"], true);
    assert!(body["config_issues"].as_array().unwrap().is_empty());
    assert!(body["allocations"].is_array());
}

#[tokio::test]
async fn own_status_carries_the_fingerprint() {
    let (app, state, _dir) = test_app();

    let (status, body) = request(app, "GET", "/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], "openevse-self");

    let (version, hash) = state.fingerprint().await;
    assert_eq!(body["config_version"], version);
    assert_eq!(body["config_hash"], hash);
}

#[tokio::test]
async fn operator_config_update_bumps_version() {
    let (app, _state, _dir) = test_app();

    let (_, before) = request(app.clone(), "GET", "/loadsharing/config", None).await;
    let v0 = before["config_version"].as_u64().unwrap();

    let (status, body) = request(
        app.clone(),
        "POST",
        "/loadsharing/config",
        Some(json!({"group_max_current_a": 32.0, "safety_factor": 0.9})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["config_version"], v0 + 1);

    let (_, after) = request(app.clone(), "GET", "/loadsharing/config", None).await;
    assert_eq!(after["group_max_current_a"], 32.0);
    assert_eq!(after["safety_factor"], 0.9);

    // Out-of-range values are rejected before anything is applied
    let (status, _) = request(
        app.clone(),
        "POST",
        "/loadsharing/config",
        Some(json!({"safety_factor": 1.5})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, unchanged) = request(app, "GET", "/loadsharing/config", None).await;
    assert_eq!(unchanged["safety_factor"], 0.9);
}

#[tokio::test]
async fn pushed_config_is_adopted_and_group_turns_consistent() {
    let (app, state, _dir) = test_app();

    let members = vec![
        "openevse-b.local".to_string(),
        "openevse-self.local".to_string(),
    ];
    let remote = GroupConfig {
        enabled: true,
        group_id: "garage".into(),
        group_max_current_a: 40.0,
        config_version: 2,
        config_updated_at: 1_700_000_000,
        ..Default::default()
    };
    let wire = WireConfig::from_local("openevse-b", &remote, &members);

    let (status, body) = request(
        app.clone(),
        "POST",
        "/config",
        Some(serde_json::to_value(&wire).unwrap()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["msg"], "done");

    // Version and hash now match the pusher's
    let (version, hash) = state.fingerprint().await;
    assert_eq!(version, 2);
    assert_eq!(hash, wire.config_hash);

    let (_, shared) = request(app.clone(), "GET", "/config", None).await;
    assert_eq!(shared["config_version"], 2);
    assert_eq!(shared["config_hash"], wire.config_hash.as_str());
    assert_eq!(shared["group_max_current_a"], 40.0);

    let (_, diag) = request(app.clone(), "GET", "/loadsharing/status", None).await;
    assert_eq!(diag["config_consistent"], true);

    // A stale re-push bounces
    let stale = WireConfig::from_local(
        "openevse-b",
        &GroupConfig {
            group_id: "garage".into(),
            config_version: 1,
            ..Default::default()
        },
        &members,
    );
    let (status, _) = request(
        app,
        "POST",
        "/config",
        Some(serde_json::to_value(&stale).unwrap()),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn pushed_member_list_replaces_the_registry() {
    let (app, _state, _dir) = test_app();

    request(
        app.clone(),
        "POST",
        "/loadsharing/peers",
        Some(json!({"host": "openevse-old.local"})),
    )
    .await;

    let members = vec![
        "openevse-b.local".to_string(),
        "openevse-c.local".to_string(),
        "openevse-self.local".to_string(),
    ];
    let remote = GroupConfig {
        enabled: true,
        group_id: "garage".into(),
        group_max_current_a: 40.0,
        config_version: 10,
        ..Default::default()
    };
    let wire = WireConfig::from_local("openevse-b", &remote, &members);
    let (status, _) = request(
        app.clone(),
        "POST",
        "/config",
        Some(serde_json::to_value(&wire).unwrap()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = request(app, "GET", "/loadsharing/peers", None).await;
    let hosts: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["host"].as_str().unwrap())
        .collect();
    assert!(hosts.contains(&"openevse-b.local"));
    assert!(hosts.contains(&"openevse-c.local"));
    assert!(!hosts.contains(&"openevse-old.local"));
    assert!(!hosts.contains(&"openevse-self.local"));
}
