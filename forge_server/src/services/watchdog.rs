//! Watchdog — bounds how long a build may wait for its agent report.
//!
//! Two staged checks per build: a warning after the first delay, forced
//! termination after the second. Both re-read the record before acting,
//! so a report that lands first turns them into no-ops; the terminal
//! transition is a conditional update so a late firing can never
//! overwrite a settled build.

use std::sync::Arc;
use std::time::Duration;

use crate::cloud::CloudProvider;
use crate::metrics;
use crate::models::build::BuildStatus;
use crate::store::BuildStore;

pub fn spawn(
    store: Arc<BuildStore>,
    cloud: Arc<dyn CloudProvider>,
    build_id: i64,
    vm_id: String,
    warn_after: Duration,
    terminate_after: Duration,
) {
    tokio::spawn(async move {
        run(store, cloud, build_id, vm_id, warn_after, terminate_after).await;
    });
}

async fn run(
    store: Arc<BuildStore>,
    cloud: Arc<dyn CloudProvider>,
    build_id: i64,
    vm_id: String,
    warn_after: Duration,
    terminate_after: Duration,
) {
    tokio::time::sleep(warn_after).await;
    if still_waiting(&store, build_id) {
        tracing::warn!(build_id, "watchdog: agent has not reported yet");
        if let Err(e) = store.append_log(
            build_id,
            "WARNING: Agent is silent. Check server logs. Build will be terminated if no report arrives.",
        ) {
            tracing::error!(build_id, "watchdog: failed to append warning: {e:#}");
        }
    }

    tokio::time::sleep(terminate_after.saturating_sub(warn_after)).await;
    match store.transition_status(build_id, BuildStatus::WaitingAgent, BuildStatus::ErrorTimeout) {
        Ok(true) => {
            metrics::build_status_changed(BuildStatus::ErrorTimeout.as_str());
            tracing::warn!(build_id, vm_id = %vm_id, "watchdog: timeout reached, terminating");
            if let Err(e) = store.append_log(
                build_id,
                "TIMEOUT: Agent did not report in time. Terminating test VM.",
            ) {
                tracing::error!(build_id, "watchdog: failed to append timeout log: {e:#}");
            }
            if let Err(e) = cloud.delete_vm(&vm_id).await {
                tracing::warn!(build_id, vm_id = %vm_id, "watchdog: failed to delete vm: {e:#}");
            }
        }
        // The agent (or an operator) settled the build first.
        Ok(false) => {}
        Err(e) => tracing::error!(build_id, "watchdog: store error: {e:#}"),
    }
}

fn still_waiting(store: &BuildStore, build_id: i64) -> bool {
    matches!(
        store.get_status(build_id),
        Ok(Some((BuildStatus::WaitingAgent, _)))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockCloud;
    use std::time::Duration;

    fn store_with_waiting_build() -> (Arc<BuildStore>, i64) {
        let store = Arc::new(BuildStore::open_in_memory().unwrap());
        store.init().unwrap();
        let id = store.create_build("web01").unwrap();
        store.set_vm_id(id, "vm-1").unwrap();
        store.update_status(id, BuildStatus::WaitingAgent).unwrap();
        (store, id)
    }

    #[tokio::test]
    async fn warning_is_log_only_and_timeout_deletes_vm_once() {
        let (store, id) = store_with_waiting_build();
        let cloud = Arc::new(MockCloud::new());

        run(
            store.clone(),
            cloud.clone(),
            id,
            "vm-1".to_string(),
            Duration::from_millis(20),
            Duration::from_millis(60),
        )
        .await;

        let (status, logs) = store.get_status(id).unwrap().unwrap();
        assert_eq!(status, BuildStatus::ErrorTimeout);
        assert!(logs.contains("WARNING"));
        assert!(logs.contains("TIMEOUT"));
        assert_eq!(cloud.deleted_vms(), vec!["vm-1".to_string()]);
    }

    #[tokio::test]
    async fn settled_build_makes_both_checks_noops() {
        let (store, id) = store_with_waiting_build();
        let cloud = Arc::new(MockCloud::new());
        store
            .transition_status(id, BuildStatus::WaitingAgent, BuildStatus::Success)
            .unwrap();

        run(
            store.clone(),
            cloud.clone(),
            id,
            "vm-1".to_string(),
            Duration::from_millis(10),
            Duration::from_millis(20),
        )
        .await;

        let (status, logs) = store.get_status(id).unwrap().unwrap();
        assert_eq!(status, BuildStatus::Success);
        assert!(!logs.contains("WARNING"));
        assert!(!logs.contains("TIMEOUT"));
        assert!(cloud.deleted_vms().is_empty());
    }

    #[tokio::test]
    async fn report_between_warning_and_timeout_prevents_termination() {
        let (store, id) = store_with_waiting_build();
        let cloud = Arc::new(MockCloud::new());

        let watchdog = tokio::spawn(run(
            store.clone(),
            cloud.clone(),
            id,
            "vm-1".to_string(),
            Duration::from_millis(20),
            Duration::from_millis(200),
        ));

        // Let the warning fire, then settle the build before the deadline.
        tokio::time::sleep(Duration::from_millis(80)).await;
        store
            .transition_status(id, BuildStatus::WaitingAgent, BuildStatus::ErrorTest)
            .unwrap();
        watchdog.await.unwrap();

        let (status, logs) = store.get_status(id).unwrap().unwrap();
        assert_eq!(status, BuildStatus::ErrorTest);
        assert!(logs.contains("WARNING"));
        assert!(!logs.contains("TIMEOUT"));
        assert!(cloud.deleted_vms().is_empty());
    }
}
