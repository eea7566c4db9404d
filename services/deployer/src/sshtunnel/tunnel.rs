//! Transport-independent tunnel driver.
//!
//! [`Tunnel`] owns the dial retries, the accept loop and the per-connection
//! copy threads. The SSH transport itself sits behind [`Connector`].

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{ErrorSender, Options, ReadySender, SshTunnel, SshTunnelError, TunnelRetryPolicy, TunnelState};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Credentials offered to the SSH server, in order.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// Private key contents.
    PublicKey { private_key: String },
    KeyboardInteractive { password: String },
    Password { password: String },
}

impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PublicKey { .. } => f.write_str("PublicKey"),
            Self::KeyboardInteractive { .. } => f.write_str("KeyboardInteractive"),
            Self::Password { .. } => f.write_str("Password"),
        }
    }
}

/// One accepted remote connection, split for full-duplex copying.
pub struct ForwardedConn {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
}

/// Opens authenticated SSH sessions.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, addr: &str, user: &str, auth: &[AuthMethod]) -> io::Result<Box<dyn RemoteSession>>;
}

/// An authenticated session.
pub trait RemoteSession: Send {
    /// Asks the server to listen on `host:port` and forward connections to us.
    fn listen(self: Box<Self>, host: &str, port: u16) -> io::Result<Box<dyn RemoteListener>>;
}

/// A listener on the remote server.
pub trait RemoteListener: Send {
    /// Returns the next pending connection without blocking.
    fn poll_accept(&mut self) -> io::Result<Option<ForwardedConn>>;

    fn close(self: Box<Self>) -> io::Result<()>;
}

/// Reverse tunnel over any [`Connector`].
pub struct Tunnel<C> {
    options: Options,
    policy: TunnelRetryPolicy,
    connector: C,
    state: Mutex<TunnelState>,
    listener: Mutex<Option<Box<dyn RemoteListener>>>,
    stopping: AtomicBool,
}

impl<C: Connector> Tunnel<C> {
    pub fn new(options: Options, policy: TunnelRetryPolicy, connector: C) -> Self {
        Self {
            options,
            policy,
            connector,
            state: Mutex::new(TunnelState::Created),
            listener: Mutex::new(None),
            stopping: AtomicBool::new(false),
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    fn lock_state(&self) -> MutexGuard<'_, TunnelState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_listener(&self) -> MutexGuard<'_, Option<Box<dyn RemoteListener>>> {
        self.listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Moves to `next` if the lifecycle allows it.
    fn transition(&self, next: TunnelState) -> bool {
        let mut state = self.lock_state();
        if state.can_transition_to(next) {
            debug!(from = %*state, to = %next, "SSH tunnel state change");
            *state = next;
            true
        } else {
            false
        }
    }

    /// Private key first; a password is offered both interactively and plain.
    pub fn auth_methods(&self) -> Result<Vec<AuthMethod>, SshTunnelError> {
        let mut methods = Vec::new();

        if !self.options.private_key.is_empty() {
            debug!("Reading private key file");
            let private_key = std::fs::read_to_string(&self.options.private_key).map_err(|source| {
                SshTunnelError::ReadPrivateKey {
                    path: self.options.private_key.clone(),
                    source,
                }
            })?;
            methods.push(AuthMethod::PublicKey { private_key });
        }

        if !self.options.password.is_empty() {
            debug!("Adding password auth methods");
            methods.push(AuthMethod::KeyboardInteractive {
                password: self.options.password.clone(),
            });
            methods.push(AuthMethod::Password {
                password: self.options.password.clone(),
            });
        }

        Ok(methods)
    }

    fn dial(&self, auth: &[AuthMethod]) -> Result<Box<dyn RemoteSession>, SshTunnelError> {
        let addr = format!("{}:{}", self.options.host, self.options.port);
        let max_tries = self.policy.start_dial_max_tries.max(1);

        let mut attempt = 0;
        loop {
            attempt += 1;
            debug!(addr = %addr, attempt, max_tries, "Dialing remote server");

            match self.connector.connect(&addr, &self.options.user, auth) {
                Ok(session) => return Ok(session),
                Err(source) if attempt >= max_tries => {
                    return Err(SshTunnelError::Dial {
                        attempts: attempt,
                        source,
                    })
                }
                Err(e) => debug!(addr = %addr, error = %e, "Dial attempt failed"),
            }

            thread::sleep(self.policy.start_dial_delay);
            if self.stopping.load(Ordering::SeqCst) {
                return Err(SshTunnelError::Stopped);
            }
        }
    }

    /// Everything up to an open remote listener.
    fn open(&self) -> Result<(), SshTunnelError> {
        if !self.transition(TunnelState::Dialing) {
            return Err(SshTunnelError::InvalidState(self.state()));
        }

        let auth = self.auth_methods()?;
        let session = self.dial(&auth)?;

        let port = self.options.remote_forward_port;
        debug!(port, "Listening on remote server");
        let listener = session
            .listen("127.0.0.1", port)
            .map_err(SshTunnelError::Listen)?;

        let mut slot = self.lock_listener();
        if self.stopping.load(Ordering::SeqCst) {
            drop(slot);
            if let Err(e) = listener.close() {
                warn!(error = %e, "Closing remote listener after stop");
            }
            return Err(SshTunnelError::Stopped);
        }
        *slot = Some(listener);
        drop(slot);

        self.transition(TunnelState::Listening);
        Ok(())
    }

    fn accept_loop(&self, errors: &ErrorSender) {
        while !self.stopping.load(Ordering::SeqCst) {
            let polled = match self.lock_listener().as_mut() {
                Some(listener) => listener.poll_accept(),
                None => break,
            };

            match polled {
                Ok(Some(conn)) => {
                    debug!("Received connection");
                    self.forward(conn, errors);
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    let _ = errors.send(SshTunnelError::Accept(e));
                    thread::sleep(POLL_INTERVAL);
                }
            }
        }
    }

    fn forward(&self, remote: ForwardedConn, errors: &ErrorSender) {
        let port = self.options.local_forward_port;
        debug!(port, "Dialing local server");

        let local = match TcpStream::connect(("127.0.0.1", port)) {
            Ok(local) => local,
            Err(e) => {
                let _ = errors.send(SshTunnelError::DialLocal(e));
                return;
            }
        };
        let local_reader = match local.try_clone() {
            Ok(reader) => reader,
            Err(e) => {
                let _ = errors.send(SshTunnelError::DialLocal(e));
                return;
            }
        };

        let ForwardedConn {
            reader: mut remote_reader,
            writer: mut remote_writer,
        } = remote;

        let remote_to_local = errors.clone();
        thread::spawn(move || {
            let mut local_writer = local;
            let result = copy(&mut remote_reader, &mut local_writer);
            let _ = local_writer.shutdown(Shutdown::Write);
            match result {
                Ok(bytes) => debug!(bytes, "Copied bytes from remote to local"),
                Err(e) => {
                    let _ = remote_to_local.send(SshTunnelError::CopyRemoteToLocal(e));
                }
            }
        });

        let local_to_remote = errors.clone();
        thread::spawn(move || {
            let mut local_reader = local_reader;
            match copy(&mut local_reader, &mut remote_writer) {
                Ok(bytes) => debug!(bytes, "Copied bytes from local to remote"),
                Err(e) => {
                    let _ = local_to_remote.send(SshTunnelError::CopyLocalToRemote(e));
                }
            }
        });
    }
}

impl<C: Connector> SshTunnel for Tunnel<C> {
    fn start(&self, ready: ReadySender, errors: ErrorSender) {
        let opened = self.open();

        if let Err(e) = &opened {
            match e {
                SshTunnelError::InvalidState(_) => {}
                SshTunnelError::Stopped => {
                    self.transition(TunnelState::Stopped);
                }
                _ => {
                    self.transition(TunnelState::Failed);
                }
            }
            warn!(error = %e, "SSH tunnel failed to start");
            let _ = ready.send(opened);
            return;
        }

        info!(
            host = %self.options.host,
            remote_port = self.options.remote_forward_port,
            local_port = self.options.local_forward_port,
            "SSH tunnel ready"
        );
        // The caller may have stopped waiting; the tunnel still runs until stopped.
        let _ = ready.send(Ok(()));

        if self.transition(TunnelState::Forwarding) {
            self.accept_loop(&errors);
        }
        self.transition(TunnelState::Stopped);
    }

    fn stop(&self) -> Result<(), SshTunnelError> {
        self.stopping.store(true, Ordering::SeqCst);
        self.transition(TunnelState::Stopped);

        let listener = self.lock_listener().take();
        match listener {
            Some(listener) => {
                debug!("Closing remote listener");
                listener.close().map_err(SshTunnelError::Close)
            }
            None => Ok(()),
        }
    }

    fn state(&self) -> TunnelState {
        *self.lock_state()
    }
}

/// `io::copy` that tolerates non-blocking endpoints.
fn copy(reader: &mut dyn Read, writer: &mut dyn Write) -> io::Result<u64> {
    let mut buf = [0u8; 32 * 1024];
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(POLL_INTERVAL);
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        let mut pending = &buf[..n];
        while !pending.is_empty() {
            match writer.write(pending) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(written) => pending = &pending[written..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        total += n as u64;
    }

    loop {
        match writer.flush() {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
            other => return other.map(|_| total),
        }
    }
}
