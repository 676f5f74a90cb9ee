//! Agent wire protocol — the single report call made by the in-guest agent.

use serde::{Deserialize, Serialize};

/// Report sent by the agent once its smoke checks finish. Correlated by
/// `vm_id`; the agent never knows a build id.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentReport {
    pub vm_id: String,
    #[serde(default)]
    pub phase: String,
    pub success: bool,
    #[serde(default)]
    pub details: String,
}

/// Instruction returned to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentCommand {
    /// Acknowledgment on the failure path; the VM stays up for inspection.
    Wait,
    /// Self-terminate and self-uninstall.
    Shutdown,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentReply {
    pub command: AgentCommand,
}
