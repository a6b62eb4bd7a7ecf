//! Local shell session for tasks without a target host
//!
//! The shell runs as the leader of its own process group. Closing a session
//! whose command is still running kills the whole group, so anything the
//! command forked dies with it.

use crate::error::{ConnectError, RunError};
use crate::models::CapturedOutput;
use crate::session::{OutputBuffer, RemoteSession, SessionState};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info};

const SHELL: &str = "/bin/sh";
const READ_CHUNK: usize = 8 * 1024;

/// Runs the command through `/bin/sh` on this machine
#[derive(Debug)]
pub struct LocalSession {
    state: SessionState,
    /// Process group of a command still in flight
    running_group: Option<i32>,
}

impl LocalSession {
    pub fn new() -> Self {
        Self {
            state: SessionState::Unopened,
            running_group: None,
        }
    }
}

impl Default for LocalSession {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteSession for LocalSession {
    async fn open(&mut self) -> Result<(), ConnectError> {
        if self.state != SessionState::Unopened {
            return Err(ConnectError::AlreadyOpened {
                endpoint: "local".to_string(),
            });
        }
        self.state = SessionState::Connected;
        Ok(())
    }

    async fn run(&mut self, command: &str) -> Result<CapturedOutput, RunError> {
        if self.state != SessionState::Connected {
            return Err(RunError::NotConnected);
        }

        info!("Executing local command: {}", command);

        // Redirect stderr into stdout inside the shell so both streams keep arrival order
        let mut cmd = Command::new(SHELL);
        cmd.arg("-c").arg(format!("exec 2>&1\n{}", command));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::null());
        #[cfg(unix)]
        cmd.process_group(0);
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn()?;
        self.running_group = child.id().and_then(|pid| i32::try_from(pid).ok());

        let mut buffer = OutputBuffer::default();
        if let Some(mut stdout) = child.stdout.take() {
            let mut chunk = vec![0u8; READ_CHUNK];
            loop {
                let n = stdout.read(&mut chunk).await?;
                if n == 0 {
                    break;
                }
                buffer.push(&chunk[..n]);
            }
        }

        let status = child.wait().await?;
        self.running_group = None;

        // Killed by a signal: report the conventional 128+N
        let exit_code = status.code().unwrap_or_else(|| {
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                status.signal().map(|s| 128 + s).unwrap_or(-1)
            }
            #[cfg(not(unix))]
            {
                -1
            }
        });

        debug!("Local command exited with {}", exit_code);

        Ok(buffer.finish(exit_code))
    }

    fn close(&mut self) {
        if let Some(group) = self.running_group.take() {
            kill_group(group);
        }
        self.state = SessionState::Closed;
    }

    fn state(&self) -> SessionState {
        self.state
    }
}

impl Drop for LocalSession {
    fn drop(&mut self) {
        if self.running_group.is_some() {
            self.close();
        }
    }
}

/// SIGKILL every process left in the group of an abandoned command
fn kill_group(group: i32) {
    #[cfg(unix)]
    {
        // SAFETY: killpg only sends a signal; `group` is the pid of a shell we spawned
        // as its own group leader
        let rc = unsafe { libc::killpg(group, libc::SIGKILL) };
        if rc == 0 {
            debug!("Killed process group {}", group);
        } else {
            debug!(
                "Process group {} already gone: {}",
                group,
                std::io::Error::last_os_error()
            );
        }
    }
    #[cfg(not(unix))]
    let _ = group;
}
