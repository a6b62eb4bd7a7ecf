//! Shared fixtures: a fake session factory that records every session it hands out

#![allow(dead_code)]

use async_trait::async_trait;
use eagledeploy::error::{ConnectError, RunError};
use eagledeploy::models::{CapturedOutput, Credential, Endpoint, Task};
use eagledeploy::session::{RemoteSession, SessionFactory, SessionState};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Session lifecycle counters
#[derive(Debug, Default)]
pub struct Recorder {
    pub created: AtomicUsize,
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
}

impl Recorder {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

/// Hosts whose name starts with `down` refuse connections; everything else
/// answers after `delay`. `echo X` prints `X\n`, `exit N` exits with N.
pub struct FakeFactory {
    pub recorder: Arc<Recorder>,
    pub delay: Duration,
}

impl FakeFactory {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            recorder: Arc::new(Recorder::default()),
            delay,
        })
    }
}

impl SessionFactory for FakeFactory {
    fn create(&self, task: &Task) -> Box<dyn RemoteSession> {
        self.recorder.created.fetch_add(1, Ordering::SeqCst);
        Box::new(FakeSession {
            host: task.target().map(|e| e.host.clone()).unwrap_or_default(),
            delay: self.delay,
            state: SessionState::Unopened,
            recorder: Arc::clone(&self.recorder),
        })
    }
}

struct FakeSession {
    host: String,
    delay: Duration,
    state: SessionState,
    recorder: Arc<Recorder>,
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn open(&mut self) -> Result<(), ConnectError> {
        if self.state != SessionState::Unopened {
            return Err(ConnectError::AlreadyOpened {
                endpoint: self.host.clone(),
            });
        }
        self.recorder.opened.fetch_add(1, Ordering::SeqCst);

        if self.host.starts_with("down") {
            self.state = SessionState::Failed;
            return Err(ConnectError::Unreachable {
                endpoint: self.host.clone(),
                message: "connection refused".to_string(),
            });
        }

        self.state = SessionState::Connected;
        Ok(())
    }

    async fn run(&mut self, command: &str) -> Result<CapturedOutput, RunError> {
        if self.state != SessionState::Connected {
            return Err(RunError::NotConnected);
        }

        let now = self.recorder.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.recorder.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.recorder.in_flight.fetch_sub(1, Ordering::SeqCst);

        let (output, exit_code) = if let Some(text) = command.strip_prefix("echo ") {
            (format!("{}\n", text), 0)
        } else if let Some(code) = command.strip_prefix("exit ") {
            (String::new(), code.trim().parse().unwrap_or(1))
        } else {
            (String::new(), 0)
        };

        Ok(CapturedOutput {
            output,
            exit_code,
            truncated: false,
        })
    }

    fn close(&mut self) {
        if self.state != SessionState::Closed {
            self.state = SessionState::Closed;
            self.recorder.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn state(&self) -> SessionState {
        self.state
    }
}

pub fn remote(name: &str, host: &str, command: &str) -> Task {
    Task::remote(
        name,
        command,
        Endpoint::new(host, 22),
        Credential::password("deploy", "secret"),
    )
}
