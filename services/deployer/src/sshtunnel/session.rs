//! libssh2 transport for [`Tunnel`].

use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use ssh2::{KeyboardInteractivePrompt, Listener, Prompt, Session};
use tracing::debug;

use super::tunnel::{AuthMethod, Connector, ForwardedConn, RemoteListener, RemoteSession, Tunnel};
use super::{Options, SshTunnel, SshTunnelFactory, TunnelRetryPolicy};

/// Bound on the blocking forward cancel and disconnect in [`Ssh2Listener::close`].
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Answers every keyboard-interactive question with the password.
struct PasswordPrompt<'a> {
    password: &'a str,
}

impl KeyboardInteractivePrompt for PasswordPrompt<'_> {
    fn prompt<'b>(&mut self, _username: &str, _instructions: &str, prompts: &[Prompt<'b>]) -> Vec<String> {
        prompts.iter().map(|_| self.password.to_string()).collect()
    }
}

/// Opens SSH sessions with libssh2.
#[derive(Debug, Clone)]
pub struct Ssh2Connector {
    connect_timeout: Duration,
}

impl Ssh2Connector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    fn connect_tcp(&self, addr: &str) -> io::Result<TcpStream> {
        let mut last_err = None;
        for sock in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&sock, self.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no addresses for {addr}"))
        }))
    }
}

impl Default for Ssh2Connector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl Connector for Ssh2Connector {
    fn connect(&self, addr: &str, user: &str, auth: &[AuthMethod]) -> io::Result<Box<dyn RemoteSession>> {
        let tcp = self.connect_tcp(addr)?;

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.handshake()?;

        for method in auth {
            let attempt = match method {
                AuthMethod::PublicKey { private_key } => {
                    session.userauth_pubkey_memory(user, None, private_key, None)
                }
                AuthMethod::KeyboardInteractive { password } => {
                    session.userauth_keyboard_interactive(user, &mut PasswordPrompt { password })
                }
                AuthMethod::Password { password } => session.userauth_password(user, password),
            };

            if let Err(e) = attempt {
                debug!(method = ?method, error = %e, "SSH auth method rejected");
            }
            if session.authenticated() {
                break;
            }
        }

        if !session.authenticated() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "SSH authentication failed",
            ));
        }

        Ok(Box::new(Ssh2Session { session }))
    }
}

struct Ssh2Session {
    session: Session,
}

impl RemoteSession for Ssh2Session {
    fn listen(self: Box<Self>, host: &str, port: u16) -> io::Result<Box<dyn RemoteListener>> {
        let (listener, bound_port) = self.session.channel_forward_listen(port, Some(host), None)?;
        debug!(host, port = bound_port, "Remote forward established");

        // Accepting and copying both poll from here on.
        self.session.set_blocking(false);

        Ok(Box::new(Ssh2Listener {
            listener,
            session: self.session,
        }))
    }
}

struct Ssh2Listener {
    listener: Listener,
    session: Session,
}

impl RemoteListener for Ssh2Listener {
    fn poll_accept(&mut self) -> io::Result<Option<ForwardedConn>> {
        match self.listener.accept() {
            Ok(channel) => Ok(Some(ForwardedConn {
                reader: Box::new(channel.stream(0)),
                writer: Box::new(channel.stream(0)),
            })),
            Err(e) => {
                let e: io::Error = e.into();
                if e.kind() == io::ErrorKind::WouldBlock {
                    Ok(None)
                } else {
                    Err(e)
                }
            }
        }
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        let Self { listener, session } = *self;

        // The forward is cancelled when the listener drops; in non-blocking
        // mode that cancel can be abandoned on EAGAIN.
        session.set_timeout(u32::try_from(CLOSE_TIMEOUT.as_millis()).unwrap_or(u32::MAX));
        session.set_blocking(true);
        drop(listener);

        debug!("Remote forward cancelled, disconnecting");
        session
            .disconnect(None, "SSH tunnel stopped", None)
            .map_err(io::Error::from)
    }
}

/// Builds libssh2-backed tunnels.
#[derive(Debug, Clone, Default)]
pub struct Ssh2TunnelFactory {
    policy: TunnelRetryPolicy,
    connector: Ssh2Connector,
}

impl Ssh2TunnelFactory {
    pub fn new(policy: TunnelRetryPolicy) -> Self {
        Self {
            policy,
            connector: Ssh2Connector::default(),
        }
    }

    pub fn with_connector(mut self, connector: Ssh2Connector) -> Self {
        self.connector = connector;
        self
    }
}

impl SshTunnelFactory for Ssh2TunnelFactory {
    fn new_ssh_tunnel(&self, options: Options) -> Arc<dyn SshTunnel> {
        Arc::new(Tunnel::new(options, self.policy, self.connector.clone()))
    }
}
