use anyhow::Context;
use async_trait::async_trait;
use dirboot_reconcile::Retryable;

use super::AgentClient;

/// A single agent ping, for use with a retry strategy.
///
/// Every failure is retryable: an agent that is still booting looks the same
/// as one that is unreachable.
pub struct PingRetryable<'a> {
    agent_client: &'a dyn AgentClient,
}

impl<'a> PingRetryable<'a> {
    pub fn new(agent_client: &'a dyn AgentClient) -> Self {
        Self { agent_client }
    }
}

#[async_trait]
impl Retryable for PingRetryable<'_> {
    async fn attempt(&self) -> (bool, anyhow::Result<()>) {
        let result = self.agent_client.ping().await.map(|_| ()).context("Pinging agent");
        (true, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeAgentClient;

    #[tokio::test]
    async fn test_ping_success() {
        let agent = FakeAgentClient::new();

        let (retryable, result) = PingRetryable::new(&agent).attempt().await;
        assert!(retryable);
        assert!(result.is_ok());
        assert_eq!(agent.calls(), vec!["ping"]);
    }

    #[tokio::test]
    async fn test_ping_failure_is_retryable_and_keeps_cause() {
        let agent = FakeAgentClient::new();
        agent.fail_pings(1);

        let (retryable, result) = PingRetryable::new(&agent).attempt().await;
        assert!(retryable);

        let message = format!("{:#}", result.unwrap_err());
        assert!(message.starts_with("Pinging agent"));
        assert!(message.contains("fake-ping-error"));
    }
}
