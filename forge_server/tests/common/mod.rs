//! Shared harness for the integration suites: a stubbed build tool,
//! tiny deadlines, and helpers to drive the router in-process.
#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tower::util::ServiceExt;

use imageforge_server::config::Config;
use imageforge_server::models::build::BuildStatus;
use imageforge_server::store::BuildStore;

/// Config pointing every path at `dir`, with a stub build tool that
/// succeeds instantly. Watchdog delays are long enough to never fire
/// unless a test shrinks them.
pub fn test_config(dir: &Path) -> Config {
    let distro_dir = dir.join("distros");
    std::fs::create_dir_all(&distro_dir).unwrap();
    std::fs::write(
        distro_dir.join("debian-12.yaml"),
        "id: debian-12\nos_element: debian-minimal\nelements:\n  - vm\n",
    )
    .unwrap();
    let elements_dir = dir.join("elements");
    std::fs::create_dir_all(&elements_dir).unwrap();

    Config {
        network_id: "net-1".to_string(),
        manager_address: "10.0.0.1:8080".to_string(),
        elements_dir: elements_dir.to_string_lossy().into_owned(),
        distro_config_dir: distro_dir.to_string_lossy().into_owned(),
        work_dir: dir.to_string_lossy().into_owned(),
        build_command: "true".to_string(),
        build_timeout_secs: 30,
        vm_active_timeout_secs: 5,
        agent_warn_secs: 3600,
        agent_timeout_secs: 7200,
        ..Config::default()
    }
}

pub async fn post_json(app: &Router, path: &str, body: Value) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let res = app.clone().oneshot(req).await.unwrap();
    let status = res.status();
    let bytes = axum::body::to_bytes(res.into_body(), 1 << 20).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

pub async fn get_json(app: &Router, path: &str) -> (StatusCode, Value) {
    let req = Request::builder().uri(path).body(Body::empty()).unwrap();
    let res = app.clone().oneshot(req).await.unwrap();
    let status = res.status();
    let bytes = axum::body::to_bytes(res.into_body(), 1 << 20).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

/// Poll until `cond` holds; the pipeline runs detached so tests observe
/// it the same way callers do.
pub async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

pub async fn wait_for_status(store: &BuildStore, id: i64, target: BuildStatus) {
    for _ in 0..1000 {
        if let Ok(Some((status, _))) = store.get_status(id) {
            if status == target {
                return;
            }
            if status.is_terminal() && status != target {
                panic!("build settled at {status} while waiting for {target}");
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for build {id} to reach {target}");
}
