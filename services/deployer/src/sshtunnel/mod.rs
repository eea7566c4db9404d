//! Reverse SSH port forwarding.
//!
//! The agent on a freshly booted VM may only be able to reach the registry
//! through the VM's network. A tunnel opens a listener on the remote SSH
//! server and forwards every connection it accepts back to a local port.
//!
//! A tunnel is single use: once stopped it cannot be started again.

mod session;
mod tunnel;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

pub use session::{Ssh2Connector, Ssh2TunnelFactory};
pub use tunnel::{AuthMethod, Connector, ForwardedConn, RemoteListener, RemoteSession, Tunnel};

/// Where to tunnel from and to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Path to a private key file.
    pub private_key: String,
    pub local_forward_port: u16,
    pub remote_forward_port: u16,
}

/// How hard to try reaching the SSH server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelRetryPolicy {
    pub start_dial_max_tries: u32,
    pub start_dial_delay: Duration,
}

impl Default for TunnelRetryPolicy {
    fn default() -> Self {
        Self {
            start_dial_max_tries: 300,
            start_dial_delay: Duration::from_millis(500),
        }
    }
}

/// Tunnel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Created,
    Dialing,
    Listening,
    Forwarding,
    Stopped,
    Failed,
}

impl TunnelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Dialing => "dialing",
            Self::Listening => "listening",
            Self::Forwarding => "forwarding",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }

    pub fn can_transition_to(&self, next: TunnelState) -> bool {
        use TunnelState::*;
        matches!(
            (self, next),
            (Created, Dialing)
                | (Created, Stopped)
                | (Dialing, Listening)
                | (Dialing, Failed)
                | (Dialing, Stopped)
                | (Listening, Forwarding)
                | (Listening, Failed)
                | (Listening, Stopped)
                | (Forwarding, Stopped)
        )
    }
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors reported by a tunnel, either on its ready slot or its error
/// channel.
#[derive(Debug, Error)]
pub enum SshTunnelError {
    #[error("Reading private key file '{path}': {source}")]
    ReadPrivateKey {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out dialing remote server after {attempts} attempts: {source}")]
    Dial {
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Listening on remote server: {0}")]
    Listen(#[source] std::io::Error),

    #[error("Accepting connection on remote server: {0}")]
    Accept(#[source] std::io::Error),

    #[error("Dialing local server: {0}")]
    DialLocal(#[source] std::io::Error),

    #[error("Copying bytes from local to remote: {0}")]
    CopyLocalToRemote(#[source] std::io::Error),

    #[error("Copying bytes from remote to local: {0}")]
    CopyRemoteToLocal(#[source] std::io::Error),

    #[error("Closing remote listener: {0}")]
    Close(#[source] std::io::Error),

    #[error("SSH tunnel cannot be started in state {0}")]
    InvalidState(TunnelState),

    #[error("SSH tunnel was stopped before it was ready")]
    Stopped,
}

/// Ready slot of a starting tunnel.
pub type ReadySender = oneshot::Sender<Result<(), SshTunnelError>>;

/// Channel for errors raised after the tunnel is ready.
pub type ErrorSender = mpsc::UnboundedSender<SshTunnelError>;

/// A reverse port forward.
pub trait SshTunnel: Send + Sync {
    /// Runs the tunnel until it is stopped. Blocks the calling thread.
    ///
    /// Exactly one value is sent on `ready`: `Ok(())` once the remote
    /// listener is open, or the error that prevented it. Failures on
    /// individual forwarded connections go to `errors` and do not stop
    /// the tunnel.
    fn start(&self, ready: ReadySender, errors: ErrorSender);

    /// Closes the remote listener. Safe to call more than once.
    fn stop(&self) -> Result<(), SshTunnelError>;

    fn state(&self) -> TunnelState;
}

/// Creates tunnels.
pub trait SshTunnelFactory: Send + Sync {
    fn new_ssh_tunnel(&self, options: Options) -> Arc<dyn SshTunnel>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_default() {
        let policy = TunnelRetryPolicy::default();
        assert_eq!(policy.start_dial_max_tries, 300);
        assert_eq!(policy.start_dial_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_state_transitions() {
        assert!(TunnelState::Created.can_transition_to(TunnelState::Dialing));
        assert!(TunnelState::Dialing.can_transition_to(TunnelState::Failed));
        assert!(TunnelState::Listening.can_transition_to(TunnelState::Failed));
        assert!(TunnelState::Forwarding.can_transition_to(TunnelState::Stopped));

        assert!(!TunnelState::Stopped.can_transition_to(TunnelState::Dialing));
        assert!(!TunnelState::Failed.can_transition_to(TunnelState::Dialing));
        assert!(!TunnelState::Forwarding.can_transition_to(TunnelState::Failed));
    }
}
