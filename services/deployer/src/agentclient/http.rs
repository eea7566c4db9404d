//! JSON-over-HTTP agent client.
//!
//! Every message is a POST to `<endpoint>/agent`. Long-running methods answer
//! with a task handle which is polled with `get_task` until it leaves the
//! `running` state.

use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use dirboot_id::DiskCid;
use dirboot_reconcile::{Retryable, UnlimitedRetryStrategy};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error};

use super::{AgentClient, AgentClientError, AgentState};
use crate::applyspec::ApplySpec;

#[derive(Debug, Serialize)]
struct AgentRequest<'a> {
    method: &'a str,
    arguments: Vec<Value>,
    reply_to: &'a str,
}

#[derive(Debug, Deserialize)]
struct AgentResponse {
    #[serde(default)]
    value: Value,
    #[serde(default)]
    exception: Option<AgentException>,
}

#[derive(Debug, Deserialize)]
struct AgentException {
    message: String,
}

#[derive(Debug, Deserialize)]
struct TaskHandle {
    agent_task_id: String,
    state: String,
}

/// Agent client speaking the agent's HTTP protocol.
pub struct HttpAgentClient {
    client: reqwest::Client,
    url: Url,
    username: String,
    password: Option<String>,
    reply_to: String,
    task_poll_delay: Duration,
}

impl HttpAgentClient {
    /// Creates a client for `endpoint`.
    ///
    /// Credentials in the endpoint's userinfo are sent as basic auth.
    pub fn new(
        endpoint: &str,
        reply_to: impl Into<String>,
        task_poll_delay: Duration,
    ) -> Result<Self, AgentClientError> {
        let invalid = |reason: String| AgentClientError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason,
        };

        let mut base = Url::parse(endpoint).map_err(|e| invalid(e.to_string()))?;
        let username = base.username().to_string();
        let password = base.password().map(str::to_string);
        base.set_username("")
            .and_then(|_| base.set_password(None))
            .map_err(|_| invalid("cannot carry credentials".to_string()))?;

        let url = Url::parse(&format!("{}/agent", base.as_str().trim_end_matches('/')))
            .map_err(|e| invalid(e.to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            url,
            username,
            password,
            reply_to: reply_to.into(),
            task_poll_delay,
        })
    }

    /// Sends one message and returns the reply's `value`.
    async fn request(&self, method: &str, arguments: Vec<Value>) -> Result<Value, AgentClientError> {
        debug!(url = %self.url, method, "Sending agent request");

        let body = AgentRequest {
            method,
            arguments,
            reply_to: &self.reply_to,
        };

        let mut request = self.client.post(self.url.clone()).json(&body);
        if !self.username.is_empty() {
            request = request.basic_auth(&self.username, self.password.as_deref());
        }

        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, method, "Agent request failed");
            return Err(AgentClientError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let reply: AgentResponse = response.json().await?;
        if let Some(exception) = reply.exception {
            return Err(AgentClientError::Exception(exception.message));
        }

        Ok(reply.value)
    }

    /// Sends a message that starts an agent task and waits for the task.
    async fn send_async_task(&self, method: &str, arguments: Vec<Value>) -> Result<(), AgentClientError> {
        let value = self.request(method, arguments).await?;
        let task: TaskHandle =
            serde_json::from_value(value).map_err(|e| AgentClientError::UnexpectedResponse {
                method: method.to_string(),
                reason: e.to_string(),
            })?;

        if task.state != "running" {
            return Ok(());
        }

        debug!(method, task_id = %task.agent_task_id, "Polling agent task");
        let poll = TaskPoll {
            client: self,
            task_id: &task.agent_task_id,
        };
        UnlimitedRetryStrategy::new(self.task_poll_delay)
            .try_run(&poll)
            .await
            .map_err(|source| AgentClientError::TaskPolling {
                method: method.to_string(),
                task_id: task.agent_task_id.clone(),
                source,
            })
    }
}

/// One `get_task` call. Retryable while the task is still running.
struct TaskPoll<'a> {
    client: &'a HttpAgentClient,
    task_id: &'a str,
}

#[async_trait]
impl Retryable for TaskPoll<'_> {
    async fn attempt(&self) -> (bool, anyhow::Result<()>) {
        match self.client.request("get_task", vec![json!(self.task_id)]).await {
            Ok(value) if value.get("state").and_then(Value::as_str) == Some("running") => {
                (true, Err(anyhow!("Task '{}' is still running", self.task_id)))
            }
            Ok(_) => (true, Ok(())),
            Err(e) => (false, Err(e.into())),
        }
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn ping(&self) -> Result<String, AgentClientError> {
        let value = self.request("ping", vec![]).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn stop(&self) -> Result<(), AgentClientError> {
        self.send_async_task("stop", vec![]).await
    }

    async fn apply(&self, spec: &ApplySpec) -> Result<(), AgentClientError> {
        let spec = serde_json::to_value(spec).map_err(|e| AgentClientError::UnexpectedResponse {
            method: "apply".to_string(),
            reason: format!("encoding apply spec: {e}"),
        })?;
        self.send_async_task("apply", vec![spec]).await
    }

    async fn start(&self) -> Result<(), AgentClientError> {
        self.request("start", vec![]).await.map(|_| ())
    }

    async fn get_state(&self) -> Result<AgentState, AgentClientError> {
        let value = self.request("get_state", vec![]).await?;
        serde_json::from_value(value).map_err(|e| AgentClientError::UnexpectedResponse {
            method: "get_state".to_string(),
            reason: e.to_string(),
        })
    }

    async fn mount_disk(&self, disk_cid: &DiskCid) -> Result<(), AgentClientError> {
        self.send_async_task("mount_disk", vec![json!(disk_cid)])
            .await
    }

    async fn unmount_disk(&self, disk_cid: &DiskCid) -> Result<(), AgentClientError> {
        self.send_async_task("unmount_disk", vec![json!(disk_cid)])
            .await
    }

    async fn list_disk(&self) -> Result<Vec<DiskCid>, AgentClientError> {
        let value = self.request("list_disk", vec![]).await?;
        serde_json::from_value(value).map_err(|e| AgentClientError::UnexpectedResponse {
            method: "list_disk".to_string(),
            reason: e.to_string(),
        })
    }

    async fn migrate_disk(&self) -> Result<(), AgentClientError> {
        self.send_async_task("migrate_disk", vec![]).await
    }
}
