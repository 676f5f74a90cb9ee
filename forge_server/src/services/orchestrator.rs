//! Build pipeline — drives one build from BUILDING to a terminal state.
//!
//! Runs detached from the HTTP request that created the record. Each
//! stage failure is caught locally, written to status and log, and ends
//! the pipeline; nothing is retried automatically. All communication
//! with the rest of the system goes through the record store.

use std::sync::Arc;
use std::time::Instant;

use crate::cloud::CloudProvider;
use crate::metrics;
use crate::models::build::BuildStatus;
use crate::routes::AppState;
use crate::services::builder::{Builder, LogSink};
use crate::services::watchdog;
use crate::store::BuildStore;

/// Launch the pipeline for a freshly created record. Returns immediately.
pub fn spawn(state: AppState, build_id: i64, image_name: String, distro: String) {
    tokio::spawn(async move {
        tracing::info!(build_id, image = %image_name, "background: starting build");
        if let Err(e) = run_pipeline(&state, build_id, &image_name, &distro).await {
            // Only store failures land here; stage failures are recorded
            // on the build itself.
            tracing::error!(build_id, "pipeline aborted on store error: {e:#}");
        }
    });
}

/// Removes local build artifacts when the pipeline task exits, on every
/// path out of `run_pipeline` — early return, store error, or panic.
struct CleanupGuard {
    builder: Arc<Builder>,
    image_name: String,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.builder.cleanup(&self.image_name);
    }
}

/// Forwards supervisor output into the build's persistent log so the
/// build can be tailed while it runs.
struct StoreLogSink {
    store: Arc<BuildStore>,
    build_id: i64,
}

impl LogSink for StoreLogSink {
    fn append_line(&self, line: &str) {
        if let Err(e) = self.store.append_log(self.build_id, line) {
            tracing::warn!(build_id = self.build_id, "failed to append build log: {e:#}");
        }
    }
}

fn set_status(store: &BuildStore, id: i64, status: BuildStatus) -> anyhow::Result<()> {
    store.update_status(id, status)?;
    metrics::build_status_changed(status.as_str());
    Ok(())
}

async fn run_pipeline(
    state: &AppState,
    id: i64,
    image_name: &str,
    distro: &str,
) -> anyhow::Result<()> {
    let store = &state.store;
    let _cleanup = CleanupGuard {
        builder: state.builder.clone(),
        image_name: image_name.to_string(),
    };

    // Stage A: build the image.
    set_status(store, id, BuildStatus::Building)?;
    store.append_log(id, "Starting disk-image-builder...")?;
    let build_started = Instant::now();

    let sink: Arc<dyn LogSink> = Arc::new(StoreLogSink { store: store.clone(), build_id: id });
    if let Err(e) = state.builder.build_image(image_name, distro, sink).await {
        tracing::error!(build_id = id, "background: build failed: {e}");
        set_status(store, id, BuildStatus::ErrorBuild)?;
        store.append_log(id, &format!("Build failed: {e}"))?;
        return Ok(());
    }
    metrics::build_duration(build_started.elapsed().as_millis() as u64);
    store.append_log(id, "Build successful.")?;

    // Stage B: upload the candidate.
    set_status(store, id, BuildStatus::Uploading)?;
    store.append_log(id, "Uploading candidate image...")?;
    let candidate_name = format!("{image_name}-candidate");

    // Stale candidates from earlier attempts would pile up under the same
    // name; purge first, but a failed purge is not fatal.
    if let Err(e) = state.cloud.delete_images_by_name(&candidate_name).await {
        tracing::warn!(build_id = id, "failed to delete old candidate (ignoring): {e:#}");
    }

    let artifact = state.builder.artifact_path(image_name);
    let candidate_id = match state.cloud.upload_image(&artifact, &candidate_name).await {
        Ok(candidate_id) => candidate_id,
        Err(e) => {
            tracing::error!(build_id = id, "background: upload failed: {e:#}");
            set_status(store, id, BuildStatus::ErrorUpload)?;
            store.append_log(id, &format!("Upload failed: {e:#}"))?;
            return Ok(());
        }
    };
    store.set_candidate_id(id, &candidate_id)?;
    store.append_log(id, &format!("Candidate uploaded. ID: {candidate_id}"))?;
    tracing::info!(build_id = id, candidate_id = %candidate_id, "background: image uploaded");

    // Stage C: boot a disposable test VM from the candidate.
    set_status(store, id, BuildStatus::BootingVm)?;
    store.append_log(id, "Creating test VM...")?;

    let vm_name = format!("{image_name}-test-agent");
    let vm_id = match state
        .cloud
        .create_vm(
            &vm_name,
            &candidate_id,
            &state.config.flavor_id,
            &state.config.network_id,
            "",
        )
        .await
    {
        Ok(vm_id) => vm_id,
        Err(e) => {
            tracing::error!(build_id = id, "background: vm create failed: {e:#}");
            set_status(store, id, BuildStatus::ErrorVmBoot)?;
            store.append_log(id, &format!("VM boot failed: {e:#}"))?;
            return Ok(());
        }
    };
    store.set_vm_id(id, &vm_id)?;
    store.append_log(id, &format!("VM created. ID: {vm_id}. Waiting for ACTIVE status..."))?;

    if let Err(e) = state.cloud.wait_vm_active(&vm_id, state.config.vm_active_timeout()).await {
        tracing::error!(build_id = id, "background: vm failed to become active: {e:#}");
        set_status(store, id, BuildStatus::ErrorVmBoot)?;
        store.append_log(id, &format!("VM boot failed (not active): {e:#}"))?;
        if let Err(e) = state.cloud.delete_vm(&vm_id).await {
            tracing::warn!(build_id = id, vm_id = %vm_id, "failed to delete stuck vm: {e:#}");
        }
        return Ok(());
    }

    // Stage D: hand off to the agent; the watchdog bounds the wait.
    store.append_log(id, "VM is ACTIVE. Waiting for agent report...")?;
    set_status(store, id, BuildStatus::WaitingAgent)?;
    tracing::info!(build_id = id, vm_id = %vm_id, "background: vm active, waiting for agent");

    watchdog::spawn(
        store.clone(),
        state.cloud.clone(),
        id,
        vm_id,
        state.config.agent_warn_delay(),
        state.config.agent_timeout_delay(),
    );

    Ok(())
}
