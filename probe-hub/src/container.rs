//! Toolchain container orchestration.
//!
//! One live container serves exactly one probe, named `<base>-p<probeId>`.
//! Containers are compose services started lazily on first use; commands run
//! inside them via `docker exec`. The containers themselves (privileged,
//! `/dev:/dev`) are defined by the external compose descriptor; this module
//! only starts, executes and kills.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// How long a lazy container start may take.
pub const T_COMPOSE_UP: Duration = Duration::from_secs(30);

/// Errors from the container runtime.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum ContainerError {
    /// Container service `{service}` failed to start: {detail}
    StartFailed { service: String, detail: String },
    /// Container service `{service}` did not start in time.
    StartTimeout { service: String },
    /// Failed to execute a command inside `{container}`.
    Exec {
        container: String,
        #[source]
        source: std::io::Error,
    },
    /// Command inside `{container}` was interrupted by a stop request.
    Interrupted { container: String },
    /// The container runtime could not be invoked.
    Runtime(#[source] std::io::Error),
}

/// Captured result of a command run to completion inside a container.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout and stderr interleaved the way operators expect in `log`.
    pub fn combined_log(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (true, true) => String::new(),
            (false, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// The executable name a rendered command will run, for residual cleanup.
pub fn command_binary(command: &str) -> String {
    command
        .split_whitespace()
        .next()
        .map(|token| token.rsplit('/').next().unwrap_or(token))
        .unwrap_or("")
        .to_string()
}

/// Handle to a long-running server process inside a container.
#[derive(Debug)]
pub struct SpawnedServer {
    child: Child,
    container: String,
    binary: String,
}

impl SpawnedServer {
    /// Host-side pid of the exec client, while it is running.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Waits for the process to exit.
    pub async fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
        self.child.wait().await
    }

    /// Sends SIGTERM. A process that already exited is not an error.
    pub fn signal_term(&self) {
        if let Some(pid) = self.child.id() {
            match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                Err(errno) => {
                    tracing::warn!(pid, "SIGTERM failed: {errno}");
                }
            }
        }
    }

    /// SIGKILL and reap.
    pub async fn kill(&mut self) {
        if let Err(error) = self.child.kill().await {
            tracing::warn!("killing server process failed: {error}");
        }
    }
}

/// Starts compose services and runs commands inside the resulting containers.
#[derive(Debug, Clone, Default)]
pub struct ContainerManager {
    compose_file: Option<PathBuf>,
}

impl ContainerManager {
    pub fn new(compose_file: Option<PathBuf>) -> Self {
        Self { compose_file }
    }

    fn compose_command(&self) -> Command {
        let mut cmd = Command::new("docker");
        cmd.arg("compose");
        if let Some(file) = &self.compose_file {
            cmd.arg("-f").arg(file);
        }
        cmd
    }

    /// Makes sure the compose service for this container is up. Idempotent;
    /// an already-running service is a fast no-op for the runtime.
    #[tracing::instrument(skip(self))]
    pub async fn ensure_running(&self, service: &str) -> Result<(), ContainerError> {
        let mut cmd = self.compose_command();
        cmd.args(["up", "-d", service]);
        cmd.stdin(Stdio::null());

        let output = tokio::time::timeout(T_COMPOSE_UP, cmd.output())
            .await
            .map_err(|_| ContainerError::StartTimeout {
                service: service.to_string(),
            })?
            .map_err(ContainerError::Runtime)?;

        if !output.status.success() {
            return Err(ContainerError::StartFailed {
                service: service.to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        tracing::debug!(service, "container service up");
        Ok(())
    }

    /// Runs a command inside `container` to completion, capturing output.
    /// Cancelling the token kills the command and yields `Interrupted`.
    #[tracing::instrument(skip(self, command, cancel))]
    pub async fn exec(
        &self,
        container: &str,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, ContainerError> {
        let started = Instant::now();

        let mut cmd = Command::new("docker");
        cmd.args(["exec", container, "sh", "-c", command]);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| ContainerError::Exec {
            container: container.to_string(),
            source,
        })?;

        let output = tokio::select! {
            output = child.wait_with_output() => {
                output.map_err(|source| ContainerError::Exec {
                    container: container.to_string(),
                    source,
                })?
            }
            _ = cancel.cancelled() => {
                // Dropping the in-flight future drops the child, which kills
                // the exec client (kill_on_drop).
                return Err(ContainerError::Interrupted {
                    container: container.to_string(),
                });
            }
        };

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration: started.elapsed(),
        })
    }

    /// Spawns a long-running command inside `container` and hands back the
    /// process handle. Output is drained into the hub log.
    #[tracing::instrument(skip(self, command))]
    pub async fn spawn_server(
        &self,
        container: &str,
        command: &str,
    ) -> Result<SpawnedServer, ContainerError> {
        let mut cmd = Command::new("docker");
        // `exec` keeps the sh wrapper from outliving the server inside the
        // container, so pkill by name stays a fallback rather than the norm.
        cmd.args(["exec", container, "sh", "-c", &format!("exec {command}")]);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ContainerError::Exec {
            container: container.to_string(),
            source,
        })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(drain(stdout, container.to_string(), "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain(stderr, container.to_string(), "stderr"));
        }

        tracing::info!(container, pid = child.id(), "spawned server process");

        Ok(SpawnedServer {
            child,
            container: container.to_string(),
            binary: command_binary(command),
        })
    }

    /// Kills every instance of a named executable inside the container.
    /// Returns whether anything was there to kill.
    pub async fn kill_named(&self, container: &str, binary: &str) -> Result<bool, ContainerError> {
        if binary.is_empty() {
            return Ok(false);
        }
        let output = Command::new("docker")
            .args(["exec", container, "pkill", "-9", "-x", binary])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(ContainerError::Runtime)?;

        // pkill exits 1 when no process matched; that is the common case
        // after a clean SIGTERM.
        Ok(output.status.success())
    }
}

async fn drain(reader: impl AsyncRead + Unpin, container: String, stream: &'static str) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(%container, "[{stream}] {line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case("JLinkGDBServer -select usb=S1", "JLinkGDBServer")]
    #[test_case("/opt/openocd/bin/openocd -f board.cfg", "openocd")]
    #[test_case("  wlink   flash fw.bin", "wlink")]
    #[test_case("", "")]
    fn binary_name_is_first_token_basename(command: &str, expected: &str) {
        assert_eq!(command_binary(command), expected);
    }

    #[test]
    fn combined_log_merges_streams() {
        let output = ExecOutput {
            exit_code: 0,
            stdout: "flashed".into(),
            stderr: "warning: slow clock".into(),
            duration: Duration::from_millis(10),
        };
        assert!(output.success());
        assert_eq!(output.combined_log(), "flashed\nwarning: slow clock");

        let quiet = ExecOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "boom".into(),
            duration: Duration::from_millis(10),
        };
        assert!(!quiet.success());
        assert_eq!(quiet.combined_log(), "boom");
    }
}
