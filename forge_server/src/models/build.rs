//! Build record — one row per image build attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a build. Transitions only move forward; terminal states
/// are never left again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    Pending,
    Building,
    Uploading,
    BootingVm,
    WaitingAgent,
    Success,
    ErrorBuild,
    ErrorUpload,
    ErrorVmBoot,
    ErrorTest,
    ErrorTimeout,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "PENDING",
            BuildStatus::Building => "BUILDING",
            BuildStatus::Uploading => "UPLOADING",
            BuildStatus::BootingVm => "BOOTING_VM",
            BuildStatus::WaitingAgent => "WAITING_AGENT",
            BuildStatus::Success => "SUCCESS",
            BuildStatus::ErrorBuild => "ERROR_BUILD",
            BuildStatus::ErrorUpload => "ERROR_UPLOAD",
            BuildStatus::ErrorVmBoot => "ERROR_VM_BOOT",
            BuildStatus::ErrorTest => "ERROR_TEST",
            BuildStatus::ErrorTimeout => "ERROR_TIMEOUT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let status = match s {
            "PENDING" => BuildStatus::Pending,
            "BUILDING" => BuildStatus::Building,
            "UPLOADING" => BuildStatus::Uploading,
            "BOOTING_VM" => BuildStatus::BootingVm,
            "WAITING_AGENT" => BuildStatus::WaitingAgent,
            "SUCCESS" => BuildStatus::Success,
            "ERROR_BUILD" => BuildStatus::ErrorBuild,
            "ERROR_UPLOAD" => BuildStatus::ErrorUpload,
            "ERROR_VM_BOOT" => BuildStatus::ErrorVmBoot,
            "ERROR_TEST" => BuildStatus::ErrorTest,
            "ERROR_TIMEOUT" => BuildStatus::ErrorTimeout,
            _ => return None,
        };
        Some(status)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BuildStatus::Success
                | BuildStatus::ErrorBuild
                | BuildStatus::ErrorUpload
                | BuildStatus::ErrorVmBoot
                | BuildStatus::ErrorTest
                | BuildStatus::ErrorTimeout
        )
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A full build record as persisted in the store.
#[derive(Debug, Clone, Serialize)]
pub struct BuildRecord {
    pub id: i64,
    pub image_name: String,
    pub status: BuildStatus,
    pub candidate_id: Option<String>,
    pub vm_id: Option<String>,
    pub logs: String,
    pub created_at: DateTime<Utc>,
}

/// Trimmed record for history listings.
#[derive(Debug, Clone, Serialize)]
pub struct BuildSummary {
    pub id: i64,
    pub image_name: String,
    pub status: BuildStatus,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_wire_form() {
        let all = [
            BuildStatus::Pending,
            BuildStatus::Building,
            BuildStatus::Uploading,
            BuildStatus::BootingVm,
            BuildStatus::WaitingAgent,
            BuildStatus::Success,
            BuildStatus::ErrorBuild,
            BuildStatus::ErrorUpload,
            BuildStatus::ErrorVmBoot,
            BuildStatus::ErrorTest,
            BuildStatus::ErrorTimeout,
        ];
        for status in all {
            assert_eq!(BuildStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(BuildStatus::parse("NOT_A_STATUS"), None);
    }

    #[test]
    fn serde_matches_as_str() {
        let json = serde_json::to_string(&BuildStatus::WaitingAgent).unwrap();
        assert_eq!(json, "\"WAITING_AGENT\"");
        let json = serde_json::to_string(&BuildStatus::ErrorVmBoot).unwrap();
        assert_eq!(json, "\"ERROR_VM_BOOT\"");
    }

    #[test]
    fn terminality() {
        assert!(!BuildStatus::WaitingAgent.is_terminal());
        assert!(!BuildStatus::Pending.is_terminal());
        assert!(BuildStatus::Success.is_terminal());
        assert!(BuildStatus::ErrorTimeout.is_terminal());
    }
}
