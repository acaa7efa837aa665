//! The external process a worker task is currently running.
//!
//! Tasks launch their processes through a [`ProcessSlot`] so that the owning
//! state machine can kill them without waiting for the task itself.

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::application::guarded::Guarded;
use crate::domain::errors::{DomainError, DomainResult};

const STDERR_TAIL: usize = 2048;

/// Holds the pid of at most one running child process.
#[derive(Debug, Clone, Default)]
pub struct ProcessSlot {
    pid: Guarded<Option<u32>>,
}

/// Clears the slot when the owning future completes or is dropped.
struct Occupied<'a> {
    slot: &'a ProcessSlot,
    pid: Option<u32>,
}

impl Drop for Occupied<'_> {
    fn drop(&mut self) {
        self.slot.pid.with(|current| {
            if *current == self.pid {
                *current = None;
            }
        });
    }
}

impl ProcessSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pid of the running process, if any.
    pub fn pid(&self) -> Option<u32> {
        *self.pid.acquire()
    }

    /// Run `command` to completion, recording its pid while it runs.
    ///
    /// A non-zero exit status is reported as [`DomainError::Process`] with
    /// the tail of the process's stderr.
    pub async fn run(&self, mut command: Command, label: &str) -> DomainResult<Output> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = command
            .spawn()
            .map_err(|e| DomainError::Process(format!("failed to spawn {label}: {e}")))?;

        let pid = child.id();
        self.pid.with(|current| *current = pid);
        let _occupied = Occupied { slot: self, pid };
        debug!(label, pid, "process started");

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| DomainError::Process(format!("failed to wait for {label}: {e}")))?;

        if !output.status.success() {
            return Err(DomainError::Process(format!(
                "{label} exited with {}: {}",
                output.status,
                stderr_tail(&output.stderr)
            )));
        }
        Ok(output)
    }

    /// Send SIGKILL to the running process and wait until it is gone.
    pub async fn kill(&self, timeout: Duration) -> DomainResult<()> {
        let Some(pid) = self.pid() else {
            return Ok(());
        };
        let target = Pid::from_raw(
            i32::try_from(pid).map_err(|_| DomainError::Process(format!("pid {pid} out of range")))?,
        );

        match signal::kill(target, Signal::SIGKILL) {
            Ok(()) => debug!(pid, "sent SIGKILL"),
            Err(Errno::ESRCH) => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let deadline = Instant::now() + timeout;
        loop {
            if self.pid() != Some(pid) || signal::kill(target, None) == Err(Errno::ESRCH) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(pid, "process still present after SIGKILL");
                return Err(DomainError::Process(format!(
                    "process {pid} did not exit within {}ms",
                    timeout.as_millis()
                )));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim_end();
    let start = trimmed.len().saturating_sub(STDERR_TAIL);
    let start = (start..trimmed.len())
        .find(|i| trimmed.is_char_boundary(*i))
        .unwrap_or(trimmed.len());
    trimmed[start..].to_string()
}
