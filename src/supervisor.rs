//! Subprocess lifecycle for one connection
//!
//! A `ProcessSupervisor` owns exactly one spawned MCP server process and its
//! three standard streams. The owning connection writes the initial payload
//! once, then pulls stdout lines until end-of-stream. Teardown is a
//! three-stage sequence (graceful signal, bounded wait, forced kill) and is
//! idempotent.

use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Handle to one running upstream process
pub struct ProcessSupervisor {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    session_id: Uuid,
    terminated: bool,
}

impl ProcessSupervisor {
    /// Launch the upstream command with all three standard streams piped
    ///
    /// stderr is drained by a detached task that relays each non-empty line
    /// to the log, so a chatty upstream cannot fill its pipe and stall.
    pub fn spawn(command: &str, args: &[String], session_id: Uuid) -> std::io::Result<Self> {
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdin = child.stdin.take().ok_or_else(|| {
            std::io::Error::other("upstream process has no stdin pipe")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            std::io::Error::other("upstream process has no stdout pipe")
        })?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let line = line.trim_end();
                    if !line.is_empty() {
                        warn!(target: "upstream", session_id = %session_id, "{}", line);
                    }
                }
            });
        }

        let pid = child.id().unwrap_or(0);
        info!(session_id = %session_id, command, pid, "Upstream process spawned");

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            session_id,
            terminated: false,
        })
    }

    /// OS process id, if the process has not been reaped yet
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Write the initial payload followed by a line terminator, then flush
    ///
    /// Single best-effort write: any failure surfaces to the caller, there
    /// is no retry. The pipe stays open afterwards; the upstream decides
    /// when the conversation ends.
    pub async fn write_initial(&mut self, payload: &[u8]) -> std::io::Result<()> {
        self.stdin.write_all(payload).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await
    }

    /// Wait for the next full stdout line
    ///
    /// `Ok(None)` means the upstream closed its output (clean end of
    /// stream), distinct from a read error.
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.stdout.next_line().await
    }

    /// Terminate the upstream process: graceful signal, bounded wait,
    /// forced kill
    ///
    /// Idempotent: a second call, or a call on an already-exited process,
    /// is a no-op. A signaling error escalates straight to the kill stage;
    /// the forced wait is unbounded since SIGKILL must eventually land.
    pub async fn terminate(&mut self, grace: Duration) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!(session_id = %self.session_id, ?status, "Upstream already exited");
                return;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "Failed to poll upstream status");
            }
        }

        if self.send_graceful_signal() {
            match tokio::time::timeout(grace, self.child.wait()).await {
                Ok(Ok(status)) => {
                    info!(session_id = %self.session_id, ?status, "Upstream exited gracefully");
                    return;
                }
                Ok(Err(e)) => {
                    warn!(session_id = %self.session_id, error = %e, "Error waiting for upstream exit");
                }
                Err(_) => {
                    warn!(
                        session_id = %self.session_id,
                        grace_secs = grace.as_secs(),
                        "Grace period exceeded, sending SIGKILL"
                    );
                }
            }
        }

        if let Err(e) = self.child.kill().await {
            // kill() also reaps; an error here means the process is gone
            debug!(session_id = %self.session_id, error = %e, "Forced kill returned error");
        } else {
            info!(session_id = %self.session_id, "Upstream force-killed");
        }
    }

    /// Send SIGTERM (or the platform equivalent). Returns false when the
    /// signal could not be delivered, which escalates directly to the kill
    /// stage.
    fn send_graceful_signal(&mut self) -> bool {
        let Some(pid) = self.child.id() else {
            return false;
        };

        debug!(session_id = %self.session_id, pid, "Sending SIGTERM to upstream");

        #[cfg(unix)]
        {
            unsafe { libc::kill(pid as i32, libc::SIGTERM) == 0 }
        }

        #[cfg(not(unix))]
        {
            self.child.start_kill().is_ok()
        }
    }
}
