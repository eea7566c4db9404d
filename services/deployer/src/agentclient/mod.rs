//! Client side of the agent protocol.

mod http;
mod ping_retryable;

use async_trait::async_trait;
use dirboot_id::DiskCid;
use dirboot_reconcile::RetryError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::applyspec::ApplySpec;

pub use http::HttpAgentClient;
pub use ping_retryable::PingRetryable;

/// Errors talking to the agent.
#[derive(Debug, Error)]
pub enum AgentClientError {
    #[error("Invalid agent endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("Performing request to agent")]
    Transport(#[from] reqwest::Error),

    #[error("Agent responded with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Agent responded with error: {0}")]
    Exception(String),

    #[error("Unexpected agent response to '{method}': {reason}")]
    UnexpectedResponse { method: String, reason: String },

    #[error("Waiting for agent task '{task_id}' of '{method}'")]
    TaskPolling {
        method: String,
        task_id: String,
        #[source]
        source: RetryError,
    },
}

/// Agent-reported VM state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentState {
    pub job_state: String,
}

impl AgentState {
    pub fn is_running(&self) -> bool {
        self.job_state == "running"
    }
}

/// Operations the deployer performs through the agent.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn ping(&self) -> Result<String, AgentClientError>;

    /// Stops all jobs.
    async fn stop(&self) -> Result<(), AgentClientError>;

    async fn apply(&self, spec: &ApplySpec) -> Result<(), AgentClientError>;

    /// Starts all jobs.
    async fn start(&self) -> Result<(), AgentClientError>;

    async fn get_state(&self) -> Result<AgentState, AgentClientError>;

    async fn mount_disk(&self, disk_cid: &DiskCid) -> Result<(), AgentClientError>;

    async fn unmount_disk(&self, disk_cid: &DiskCid) -> Result<(), AgentClientError>;

    /// CIDs of the disks the agent has mounted.
    async fn list_disk(&self) -> Result<Vec<DiskCid>, AgentClientError>;

    /// Copies persistent data from the old disk onto the newly mounted one.
    async fn migrate_disk(&self) -> Result<(), AgentClientError>;
}
