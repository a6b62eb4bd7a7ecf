//! SSH session for remote command execution
//!
//! Wraps one `ssh2::Session` over one TCP connection:
//! - the host key is checked by a [`HostKeyVerifier`] before authenticating
//! - password or private key authentication
//! - one exec channel per command; stderr is merged into stdout so the
//!   captured stream keeps arrival order
//!
//! `ssh2` is blocking, so connect and run happen on the blocking thread pool.
//! `close` shuts the socket down, which also wakes a worker still blocked on
//! a read after its future was dropped by a timeout or cancellation.
//!
//! # Example
//!
//! ```no_run
//! use eagledeploy::models::{Credential, Endpoint};
//! use eagledeploy::session::host_key::KnownHostsVerifier;
//! use eagledeploy::session::{RemoteSession, SshOptions, SshSession};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let options = SshOptions::new(
//!     Duration::from_secs(10),
//!     Arc::new(KnownHostsVerifier::new("/home/deploy/.ssh/known_hosts")),
//! );
//! let mut session = SshSession::new(
//!     Endpoint::new("web1.example.com", 22),
//!     Credential::key_file("deploy", "/home/deploy/.ssh/id_ed25519"),
//!     options,
//! );
//!
//! session.open().await?;
//! let captured = session.run("uptime").await?;
//! session.close();
//! println!("{} (exit {})", captured.output, captured.exit_code);
//! # Ok(())
//! # }
//! ```

use crate::error::{ConnectError, RunError};
use crate::models::{CapturedOutput, Credential, Endpoint, Secret};
use crate::session::host_key::{fingerprint, HostIdentity, HostKeyDecision, HostKeyVerifier};
use crate::session::{OutputBuffer, RemoteSession, SessionState};
use async_trait::async_trait;
use ssh2::{ExtendedData, HashType, Session};
use std::fmt;
use std::io::{ErrorKind, Read};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 8 * 1024;

/// Connection settings shared by all SSH sessions of a run
#[derive(Clone)]
pub struct SshOptions {
    /// Bound on TCP connect, handshake and authentication
    pub connect_timeout: Duration,
    pub verifier: Arc<dyn HostKeyVerifier>,
}

impl SshOptions {
    pub fn new(connect_timeout: Duration, verifier: Arc<dyn HostKeyVerifier>) -> Self {
        Self {
            connect_timeout,
            verifier,
        }
    }

    fn timeout_ms(&self) -> u32 {
        u32::try_from(self.connect_timeout.as_millis()).unwrap_or(u32::MAX)
    }
}

impl fmt::Debug for SshOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshOptions")
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

/// Live transport: the SSH session plus a handle on its socket
struct Connection {
    session: Session,
    socket: TcpStream,
}

/// One SSH connection to one host, for one command
pub struct SshSession {
    endpoint: Endpoint,
    credential: Credential,
    options: SshOptions,
    state: SessionState,
    conn: Option<Connection>,
    /// A run future was dropped while its worker still held the session
    run_abandoned: bool,
}

impl SshSession {
    pub fn new(endpoint: Endpoint, credential: Credential, options: SshOptions) -> Self {
        Self {
            endpoint,
            credential,
            options,
            state: SessionState::Unopened,
            conn: None,
            run_abandoned: false,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn open(&mut self) -> Result<(), ConnectError> {
        if self.state != SessionState::Unopened {
            return Err(ConnectError::AlreadyOpened {
                endpoint: self.endpoint.to_string(),
            });
        }

        let endpoint = self.endpoint.clone();
        let credential = self.credential.clone();
        let options = self.options.clone();

        // A partially built connection is dropped, and so closed, inside the worker
        let joined =
            tokio::task::spawn_blocking(move || connect_blocking(&endpoint, &credential, &options))
                .await;

        match joined {
            Ok(Ok(conn)) => {
                self.conn = Some(conn);
                self.state = SessionState::Connected;
                info!("SSH session established to {}", self.endpoint);
                Ok(())
            }
            Ok(Err(e)) => {
                self.state = SessionState::Failed;
                Err(e)
            }
            Err(e) => {
                self.state = SessionState::Failed;
                Err(ConnectError::Unreachable {
                    endpoint: self.endpoint.to_string(),
                    message: format!("connect worker failed: {}", e),
                })
            }
        }
    }

    async fn run(&mut self, command: &str) -> Result<CapturedOutput, RunError> {
        let session = match (&self.state, &self.conn) {
            (SessionState::Connected, Some(conn)) => conn.session.clone(),
            _ => return Err(RunError::NotConnected),
        };

        debug!("Executing on {}: {}", self.endpoint, command);

        let command = command.to_string();
        self.run_abandoned = true;
        let joined = tokio::task::spawn_blocking(move || run_blocking(&session, &command)).await;
        self.run_abandoned = false;

        joined.map_err(|e| RunError::Worker(e.to_string()))?
    }

    fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            // A worker abandoned mid-run still holds the session lock; only the
            // socket shutdown is safe then
            if !self.run_abandoned {
                conn.session.set_timeout(self.options.timeout_ms());
                if let Err(e) = conn.session.disconnect(None, "task complete", None) {
                    debug!("SSH disconnect from {} failed: {}", self.endpoint, e);
                }
            }
            if let Err(e) = conn.socket.shutdown(Shutdown::Both) {
                if e.kind() != ErrorKind::NotConnected {
                    debug!("Socket shutdown for {} failed: {}", self.endpoint, e);
                }
            }
            debug!("SSH session to {} closed", self.endpoint);
        }
        self.state = SessionState::Closed;
    }

    fn state(&self) -> SessionState {
        self.state
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if self.conn.is_some() {
            self.close();
        }
    }
}

/// Resolve and connect, trying each resolved address in turn
fn connect_tcp(endpoint: &Endpoint, timeout: Duration) -> Result<TcpStream, ConnectError> {
    let addrs = (endpoint.host.as_str(), endpoint.port)
        .to_socket_addrs()
        .map_err(|e| ConnectError::Resolve {
            endpoint: endpoint.to_string(),
            source: e,
        })?;

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!("Connect to {} ({}) failed: {}", endpoint, addr, e);
                last_error = Some(e);
            }
        }
    }

    Err(ConnectError::Unreachable {
        endpoint: endpoint.to_string(),
        message: last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "host resolved to no addresses".to_string()),
    })
}

/// Connect, handshake, verify the host key and authenticate
fn connect_blocking(
    endpoint: &Endpoint,
    credential: &Credential,
    options: &SshOptions,
) -> Result<Connection, ConnectError> {
    let handshake_err = |message: String| ConnectError::Handshake {
        endpoint: endpoint.to_string(),
        message,
    };
    let auth_err = |message: String| ConnectError::AuthRejected {
        endpoint: endpoint.to_string(),
        user: credential.username.clone(),
        message,
    };

    let tcp = connect_tcp(endpoint, options.connect_timeout)?;
    let socket = tcp.try_clone().map_err(|e| ConnectError::Unreachable {
        endpoint: endpoint.to_string(),
        message: format!("failed to clone socket: {}", e),
    })?;

    let mut session =
        Session::new().map_err(|e| handshake_err(format!("failed to create session: {}", e)))?;
    session.set_timeout(options.timeout_ms());
    session.set_tcp_stream(tcp);
    session.handshake().map_err(|e| handshake_err(e.to_string()))?;

    let identity = {
        let (key, key_type) = session
            .host_key()
            .ok_or_else(|| handshake_err("server presented no host key".to_string()))?;
        HostIdentity {
            key: key.to_vec(),
            key_type: format!("{:?}", key_type),
            fingerprint: session.host_key_hash(HashType::Sha256).map(fingerprint),
        }
    };

    if let HostKeyDecision::Reject(reason) =
        options
            .verifier
            .verify(&endpoint.host, endpoint.port, &identity)
    {
        return Err(ConnectError::HostKeyRejected {
            endpoint: endpoint.to_string(),
            reason,
        });
    }

    match &credential.secret {
        Secret::Password(password) => {
            debug!("Authenticating {} with password", credential.username);
            session
                .userauth_password(&credential.username, password)
                .map_err(|e| auth_err(e.to_string()))?;
        }
        Secret::KeyFile { path, passphrase } => {
            debug!("Authenticating {} with key: {}", credential.username, path.display());
            session
                .userauth_pubkey_file(&credential.username, None, path, passphrase.as_deref())
                .map_err(|e| auth_err(e.to_string()))?;
        }
    }

    if !session.authenticated() {
        return Err(auth_err("server did not accept credentials".to_string()));
    }

    // Commands may legitimately run for a long time; the scheduler deadline bounds them
    session.set_timeout(0);

    Ok(Connection { session, socket })
}

/// Run one command on a fresh channel and collect merged output and exit status
fn run_blocking(session: &Session, command: &str) -> Result<CapturedOutput, RunError> {
    let mut channel = session
        .channel_session()
        .map_err(|e| RunError::Channel(e.to_string()))?;

    channel
        .handle_extended_data(ExtendedData::Merge)
        .map_err(|e| RunError::Channel(e.to_string()))?;

    // sshd runs exec requests through the user's login shell
    channel
        .exec(command)
        .map_err(|e| RunError::Exec(e.to_string()))?;

    let mut buffer = OutputBuffer::default();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match channel.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => buffer.push(&chunk[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(RunError::Read(e.to_string())),
        }
    }

    channel
        .wait_close()
        .map_err(|e| RunError::ExitStatus(e.to_string()))?;
    let exit_code = channel
        .exit_status()
        .map_err(|e| RunError::ExitStatus(e.to_string()))?;

    let captured = buffer.finish(exit_code);
    if captured.truncated {
        warn!("Command output truncated: {}", command);
    }

    Ok(captured)
}
