//! Sessions: one connection to one host, used for exactly one command
//!
//! A session moves through `Unopened → Connected → Closed`, or
//! `Unopened → Failed` when setup fails. It is owned by a single executor
//! and never reused. [`SessionGuard`] closes it on every exit path,
//! including when the owning future is dropped by a timeout or cancellation.

pub mod host_key;
pub mod local;
pub mod ssh;

use crate::error::{ConnectError, RunError};
use crate::models::{CapturedOutput, Task, MAX_OUTPUT_SIZE};
use async_trait::async_trait;
use std::ops::{Deref, DerefMut};

pub use host_key::{HostIdentity, HostKeyDecision, HostKeyPolicy, HostKeyVerifier};
pub use local::LocalSession;
pub use ssh::{SshOptions, SshSession};

#[cfg(test)]
use mockall::automock;

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unopened,
    Connected,
    Failed,
    Closed,
}

/// A single-use session bound to one target at construction
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteSession: Send {
    /// Connect and authenticate
    async fn open(&mut self) -> Result<(), ConnectError>;

    /// Run one command, capturing stdout and stderr combined
    async fn run(&mut self, command: &str) -> Result<CapturedOutput, RunError>;

    /// Release the connection. Calling it again is a no-op.
    fn close(&mut self);

    fn state(&self) -> SessionState;
}

/// Creates a fresh session for each task
pub trait SessionFactory: Send + Sync {
    fn create(&self, task: &Task) -> Box<dyn RemoteSession>;
}

/// SSH for tasks with a target, the local shell otherwise
#[derive(Debug, Clone)]
pub struct DefaultSessionFactory {
    ssh: SshOptions,
}

impl DefaultSessionFactory {
    pub fn new(ssh: SshOptions) -> Self {
        Self { ssh }
    }
}

impl SessionFactory for DefaultSessionFactory {
    fn create(&self, task: &Task) -> Box<dyn RemoteSession> {
        match (task.target(), task.credential()) {
            (Some(endpoint), Some(credential)) => Box::new(SshSession::new(
                endpoint.clone(),
                credential.clone(),
                self.ssh.clone(),
            )),
            _ => Box::new(LocalSession::new()),
        }
    }
}

/// Owns a session and closes it when dropped
pub struct SessionGuard {
    session: Box<dyn RemoteSession>,
}

impl SessionGuard {
    pub fn new(session: Box<dyn RemoteSession>) -> Self {
        Self { session }
    }
}

impl Deref for SessionGuard {
    type Target = dyn RemoteSession;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}

impl DerefMut for SessionGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session.as_mut()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.session.close();
    }
}

/// Bounded output buffer; bytes past MAX_OUTPUT_SIZE are counted, not kept
#[derive(Debug, Default)]
pub(crate) struct OutputBuffer {
    bytes: Vec<u8>,
    truncated: bool,
}

impl OutputBuffer {
    pub(crate) fn push(&mut self, chunk: &[u8]) {
        let room = MAX_OUTPUT_SIZE.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.bytes.extend_from_slice(&chunk[..room]);
            self.truncated = true;
        } else {
            self.bytes.extend_from_slice(chunk);
        }
    }

    pub(crate) fn finish(self, exit_code: i32) -> CapturedOutput {
        CapturedOutput {
            output: String::from_utf8_lossy(&self.bytes).into_owned(),
            exit_code,
            truncated: self.truncated,
        }
    }
}
