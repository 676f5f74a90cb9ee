//! API surface tests — validation, status retrieval, history, images.

mod common;

use std::sync::Arc;

use axum::http::StatusCode;
use serde_json::json;

use common::{get_json, post_json, test_config};
use imageforge_server::routes;
use imageforge_server::test_support::{test_state, MockCloud};

#[tokio::test]
async fn submission_requires_both_fields() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(test_config(dir.path()), Arc::new(MockCloud::new()));
    let app = routes::router(state.clone());

    for body in [
        json!({"image_name": "", "distro": "debian"}),
        json!({"image_name": "web01", "distro": ""}),
        json!({}),
    ] {
        let (status, body) = post_json(&app, "/build", body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("required"));
    }

    // Rejected submissions never create a record.
    assert!(state.store.list_recent(10).unwrap().is_empty());
}

#[tokio::test]
async fn status_endpoint_returns_record_or_404() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(test_config(dir.path()), Arc::new(MockCloud::new()));
    let app = routes::router(state.clone());

    let (status, _) = get_json(&app, "/api/build/77").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) =
        post_json(&app, "/build", json!({"image_name": "web01", "distro": "debian"})).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let build_id = body["build_id"].as_i64().unwrap();

    let (status, body) = get_json(&app, &format!("/api/build/{build_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"].as_i64().unwrap(), build_id);
    assert!(body["logs"]
        .as_str()
        .unwrap()
        .contains("Build request received for web01"));
}

#[tokio::test]
async fn history_lists_newest_first() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(test_config(dir.path()), Arc::new(MockCloud::new()));
    let app = routes::router(state.clone());

    state.store.create_build("alpha").unwrap();
    state.store.create_build("beta").unwrap();

    let (status, body) = get_json(&app, "/api/history").await;
    assert_eq!(status, StatusCode::OK);
    let entries = body.as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["image_name"], "beta");
    assert_eq!(entries[0]["status"], "PENDING");
    assert_eq!(entries[1]["image_name"], "alpha");
}

#[tokio::test]
async fn images_endpoint_lists_cloud_images() {
    let dir = tempfile::tempdir().unwrap();
    let cloud = Arc::new(MockCloud::new());
    cloud.seed_image("img-1", "web01");
    let state = test_state(test_config(dir.path()), cloud);
    let app = routes::router(state);

    let (status, body) = get_json(&app, "/api/images").await;
    assert_eq!(status, StatusCode::OK);
    let images = body.as_array().unwrap();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0]["id"], "img-1");
    assert_eq!(images[0]["name"], "web01");
}
