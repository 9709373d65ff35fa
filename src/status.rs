//! Run status model and the optional UDP status broadcaster.
//!
//! When a port is configured every status change sends the whole snapshot as one JSON datagram
//! to `127.0.0.1:<port>`. Send failures never affect the run.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Instant;

use serde::Serialize;
use tokio::net::UdpSocket;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Status {
    #[default]
    Waiting,
    Active,
    Passed,
    Failed,
    Error,
    Disabled,
    Skipped,
    Aborted,
}

impl Status {
    pub fn from_result(passed: bool) -> Self {
        if passed {
            Status::Passed
        } else {
            Status::Failed
        }
    }

    pub fn is_passed(self) -> bool {
        self == Status::Passed
    }

    /// Capitalized name used in result summaries.
    pub fn title(self) -> &'static str {
        match self {
            Status::Waiting => "Waiting",
            Status::Active => "Active",
            Status::Passed => "Passed",
            Status::Failed => "Failed",
            Status::Error => "Error",
            Status::Disabled => "Disabled",
            Status::Skipped => "Skipped",
            Status::Aborted => "Aborted",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Waiting => "waiting",
            Status::Active => "active",
            Status::Passed => "passed",
            Status::Failed => "failed",
            Status::Error => "error",
            Status::Disabled => "disabled",
            Status::Skipped => "skipped",
            Status::Aborted => "aborted",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InstructionStatus {
    pub instruction: String,
    pub status: Status,
    pub details: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TestStatus {
    pub test_number: String,
    pub status: Status,
    pub instructions: Vec<InstructionStatus>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScriptStatus {
    pub path: String,
    pub status: Status,
    pub tests: Vec<TestStatus>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    pub status: Status,
    pub elapsed_time: f64,
    pub scripts: Vec<ScriptStatus>,
}

/// Keeps the snapshot current and publishes it on every change.
#[derive(Debug)]
pub struct StatusReporter {
    socket: Option<UdpSocket>,
    destination: Option<SocketAddr>,
    started: Instant,
    current_script: usize,
    snapshot: StatusSnapshot,
}

impl Default for StatusReporter {
    fn default() -> Self {
        Self::disabled()
    }
}

impl StatusReporter {
    /// A reporter that tracks status without sending anything.
    pub fn disabled() -> Self {
        Self {
            socket: None,
            destination: None,
            started: Instant::now(),
            current_script: 0,
            snapshot: StatusSnapshot::default(),
        }
    }

    pub async fn bind(port: u16) -> std::io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        debug!("Status updates go to 127.0.0.1:{}", port);
        Ok(Self {
            socket: Some(socket),
            destination: Some(SocketAddr::from((Ipv4Addr::LOCALHOST, port))),
            ..Self::disabled()
        })
    }

    pub fn snapshot(&self) -> &StatusSnapshot {
        &self.snapshot
    }

    fn publish(&mut self) {
        self.snapshot.elapsed_time = self.started.elapsed().as_secs_f64();
        let (Some(socket), Some(destination)) = (&self.socket, self.destination) else {
            return;
        };
        let bytes = match serde_json::to_vec(&self.snapshot) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("Failed to encode status: {}", e);
                return;
            }
        };
        if let Err(e) = socket.try_send_to(&bytes, destination) {
            debug!("Failed to send status update: {}", e);
        }
    }

    /// Describe every script, test and instruction of the run as waiting.
    pub fn begin_suite(&mut self, scripts: impl IntoIterator<Item = ScriptStatus>) {
        self.started = Instant::now();
        self.snapshot = StatusSnapshot {
            status: Status::Active,
            elapsed_time: 0.0,
            scripts: scripts.into_iter().collect(),
        };
        self.publish();
    }

    pub fn end_suite(&mut self, status: Status) {
        self.snapshot.status = status;
        self.publish();
    }

    pub fn script(&mut self, index: usize, status: Status) {
        self.current_script = index;
        if let Some(script) = self.snapshot.scripts.get_mut(index) {
            script.status = status;
            self.publish();
        }
    }

    pub fn test(&mut self, test: usize, status: Status) {
        let updated = self
            .snapshot
            .scripts
            .get_mut(self.current_script)
            .and_then(|script| script.tests.get_mut(test))
            .map(|entry| entry.status = status)
            .is_some();
        if updated {
            self.publish();
        }
    }

    pub fn instruction(&mut self, test: usize, index: usize, status: Status, details: &str) {
        let updated = self
            .snapshot
            .scripts
            .get_mut(self.current_script)
            .and_then(|script| script.tests.get_mut(test))
            .and_then(|entry| entry.instructions.get_mut(index))
            .map(|entry| {
                entry.status = status;
                entry.details = details.to_string();
            })
            .is_some();
        if updated {
            self.publish();
        }
    }
}
