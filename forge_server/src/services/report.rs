//! Agent report handling — the remote call that settles a waiting build.
//!
//! Correlated purely by `vm_id`; the agent never learns a build id. The
//! terminal transition is claimed with a conditional update before any
//! side effect, so duplicate deliveries and watchdog races resolve to
//! exactly one winner and promotion runs at most once.

use crate::cloud::CloudProvider;
use crate::metrics;
use crate::models::agent::{AgentCommand, AgentReport};
use crate::models::build::{BuildRecord, BuildStatus};
use crate::routes::AppState;
use crate::services::promotion;

pub async fn handle_report(state: &AppState, report: &AgentReport) -> AgentCommand {
    tracing::info!(
        vm_id = %report.vm_id,
        phase = %report.phase,
        success = report.success,
        details = %report.details,
        "agent report received"
    );
    metrics::agent_report(report.success);

    if report.success {
        handle_success(state, report).await
    } else {
        handle_failure(state, report).await
    }
}

async fn handle_success(state: &AppState, report: &AgentReport) -> AgentCommand {
    let record = match state.store.get_by_vm_id(&report.vm_id) {
        Ok(Some(record)) => Some(record),
        Ok(None) => {
            tracing::warn!(vm_id = %report.vm_id, "no build found for reporting vm");
            None
        }
        Err(e) => {
            tracing::error!(vm_id = %report.vm_id, "store lookup failed: {e:#}");
            None
        }
    };

    if let Some(record) = record {
        let won = claim(state, &report.vm_id, record.id, BuildStatus::Success);
        if won {
            let _ = state
                .store
                .append_log(record.id, &format!("Agent reported success: {}", report.details));
            promote(state, &record).await;
        } else {
            tracing::info!(
                build_id = record.id,
                "duplicate or late agent report, build already settled"
            );
        }
    }

    // Teardown happens even when the record lookup failed: a passing VM
    // has nothing left to tell us.
    if let Err(e) = state.cloud.delete_vm(&report.vm_id).await {
        tracing::warn!(vm_id = %report.vm_id, "failed to delete test vm (ignoring): {e:#}");
    } else {
        tracing::info!(vm_id = %report.vm_id, "test vm deleted");
    }

    AgentCommand::Shutdown
}

async fn handle_failure(state: &AppState, report: &AgentReport) -> AgentCommand {
    match state.store.get_by_vm_id(&report.vm_id) {
        Ok(Some(record)) => {
            if claim(state, &report.vm_id, record.id, BuildStatus::ErrorTest) {
                let _ = state.store.append_log(
                    record.id,
                    &format!("Agent reported test failure: {}", report.details),
                );
                tracing::warn!(
                    build_id = record.id,
                    details = %report.details,
                    "test failed, keeping vm for inspection"
                );
            }
        }
        Ok(None) => tracing::warn!(vm_id = %report.vm_id, "no build found for failing vm"),
        Err(e) => tracing::error!(vm_id = %report.vm_id, "store lookup failed: {e:#}"),
    }

    // The VM is deliberately left running as evidence.
    AgentCommand::Wait
}

fn claim(state: &AppState, vm_id: &str, build_id: i64, next: BuildStatus) -> bool {
    match state
        .store
        .transition_status_by_vm_id(vm_id, BuildStatus::WaitingAgent, next)
    {
        Ok(won) => {
            if won {
                metrics::build_status_changed(next.as_str());
            }
            won
        }
        Err(e) => {
            tracing::error!(build_id, "status transition failed: {e:#}");
            false
        }
    }
}

/// The record is already SUCCESS at this point; a failed promotion is a
/// critical, distinctly logged event rather than a build failure.
async fn promote(state: &AppState, record: &BuildRecord) {
    let Some(candidate_id) = record.candidate_id.as_deref() else {
        metrics::promotion_failed();
        tracing::error!(
            build_id = record.id,
            image = %record.image_name,
            "PROMOTION FAILED: no candidate image recorded"
        );
        let _ = state
            .store
            .append_log(record.id, "CRITICAL: promotion failed: no candidate image recorded");
        return;
    };

    match promotion::promote_image(state.cloud.as_ref(), candidate_id, &record.image_name).await {
        Ok(()) => {
            let _ = state.store.append_log(
                record.id,
                &format!("Candidate promoted to '{}'.", record.image_name),
            );
        }
        Err(e) => {
            metrics::promotion_failed();
            tracing::error!(
                build_id = record.id,
                image = %record.image_name,
                "PROMOTION FAILED, production image may be missing: {e:#}"
            );
            let _ = state
                .store
                .append_log(record.id, &format!("CRITICAL: promotion failed: {e:#}"));
        }
    }
}
