//! The sandbox driver (spec component C3).
//!
//! Builds and runs a single constrained container invocation, independent of
//! any specific container runtime: the runtime is an external command-capable
//! sandbox provider, invoked the same way the pack's Apptainer/Docker backends
//! build `tokio::process::Command` invocations with piped stdio and a
//! wall-clock deadline.

use coderunner_util::{CpuQuota, MemoryLimit, SandboxTimeout};
use slog::{debug, warn, Logger};
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

/// Per-stream cap on captured output (spec.md §4.3: "Capture stdout and stderr to bounded
/// buffers"). A flooding program can't grow the worker's own memory past this regardless of
/// how much it writes; bytes past the cap are drained and discarded, not buffered, so the
/// child never blocks on a full pipe.
const MAX_CAPTURED_BYTES: usize = 1024 * 1024;

/// Reads `pipe` to EOF, capturing at most `MAX_CAPTURED_BYTES`. Bytes past the cap are still
/// read and discarded rather than left in the pipe, so a flooding child never blocks on a full
/// pipe waiting for us to catch up. Returns whether the cap was hit.
async fn read_bounded(mut pipe: impl AsyncRead + Unpin) -> std::io::Result<(Vec<u8>, bool)> {
    let mut captured = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];
    loop {
        let n = pipe.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        if captured.len() < MAX_CAPTURED_BYTES {
            let take = n.min(MAX_CAPTURED_BYTES - captured.len());
            captured.extend_from_slice(&chunk[..take]);
        }
        if captured.len() >= MAX_CAPTURED_BYTES {
            truncated = true;
        }
    }
    Ok((captured, truncated))
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("sandbox runtime failed to start: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("error waiting on sandbox container: {0}")]
    Wait(#[source] std::io::Error),
    #[error("error reading sandbox output: {0}")]
    Io(#[source] std::io::Error),
    #[error("Timeout after {seconds} seconds")]
    Timeout { seconds: u64 },
}

/// The fixed resource envelope applied to every sandbox invocation (spec.md §4.3).
#[derive(Clone, Debug)]
pub struct SandboxLimits {
    pub memory: MemoryLimit,
    pub cpu: CpuQuota,
    pub timeout: SandboxTimeout,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            memory: MemoryLimit::default(),
            cpu: CpuQuota::default(),
            timeout: SandboxTimeout::default(),
        }
    }
}

/// Captured result of one sandbox invocation.
#[derive(Debug)]
pub struct SandboxOutcome {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// True iff the container exited with status 0 and the driver did not terminate it.
    pub exit_ok: bool,
    /// True iff `stdout` was cut off at `MAX_CAPTURED_BYTES`.
    pub stdout_truncated: bool,
    /// True iff `stderr` was cut off at `MAX_CAPTURED_BYTES`.
    pub stderr_truncated: bool,
}

/// Spawns one-shot, network-isolated, resource-capped containers via an external sandbox
/// runtime binary (default `docker`; `podman` is a drop-in substitute).
pub struct SandboxDriver {
    runtime_binary: String,
}

impl Default for SandboxDriver {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl SandboxDriver {
    pub fn new(runtime_binary: impl Into<String>) -> Self {
        Self {
            runtime_binary: runtime_binary.into(),
        }
    }

    /// Runs `command` inside `image`, with the shared code volume `volume_name` mounted
    /// read-write at `/code`. Matches the invocation shape of spec.md §6:
    /// `<runtime> run --rm --memory=... --cpus=... --network=none -v <volume>:/code -w /code
    /// <image> sh -c "<command>"`.
    pub async fn run(
        &self,
        image: &str,
        command: &str,
        volume_name: &str,
        limits: &SandboxLimits,
        log: &Logger,
    ) -> Result<SandboxOutcome, DriverError> {
        let mount_arg = format!("{volume_name}:/code");
        let memory_arg = format!("--memory={}", limits.memory.as_docker_arg());
        let cpu_arg = format!("--cpus={}", limits.cpu.0);

        debug!(log, "spawning sandbox container"; "image" => image, "command" => command);

        let mut child = Command::new(&self.runtime_binary)
            .args(["run", "--rm"])
            .arg(&memory_arg)
            .arg(&cpu_arg)
            .args(["--network", "none"])
            .args(["-v", &mount_arg])
            .args(["-w", "/code"])
            .arg(image)
            .args(["sh", "-c", command])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(DriverError::Spawn)?;

        let stdout_pipe = child.stdout.take().expect("stdout was piped");
        let stderr_pipe = child.stderr.take().expect("stderr was piped");
        let stdout_task = tokio::spawn(read_bounded(stdout_pipe));
        let stderr_task = tokio::spawn(read_bounded(stderr_pipe));

        match tokio::time::timeout(limits.timeout.0, child.wait()).await {
            Ok(Ok(status)) => {
                let (stdout, stdout_truncated) = stdout_task
                    .await
                    .expect("stdout reader task panicked")
                    .map_err(DriverError::Io)?;
                let (stderr, stderr_truncated) = stderr_task
                    .await
                    .expect("stderr reader task panicked")
                    .map_err(DriverError::Io)?;
                if stdout_truncated || stderr_truncated {
                    warn!(log, "sandbox output exceeded capture cap and was truncated";
                        "stdout_truncated" => stdout_truncated, "stderr_truncated" => stderr_truncated);
                }
                Ok(SandboxOutcome {
                    stdout,
                    stderr,
                    exit_ok: status.success(),
                    stdout_truncated,
                    stderr_truncated,
                })
            }
            Ok(Err(err)) => Err(DriverError::Wait(err)),
            Err(_elapsed) => {
                warn!(log, "sandbox invocation exceeded timeout, killing container"; "seconds" => limits.timeout.0.as_secs());
                let _ = child.start_kill();
                let _ = child.wait().await;
                stdout_task.abort();
                stderr_task.abort();
                Err(DriverError::Timeout {
                    seconds: limits.timeout.0.as_secs(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::Discard;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    fn test_logger() -> Logger {
        Logger::root(Discard, slog::o!())
    }

    /// Writes an executable shell script standing in for the sandbox runtime binary, so these
    /// tests exercise the driver's spawn/capture/timeout plumbing without needing a real
    /// container runtime installed.
    fn fake_runtime(body: &str) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake-runtime.sh");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh\n{body}").unwrap();
        let mut perms = file.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        (dir, path.to_string_lossy().into_owned())
    }

    #[tokio::test]
    async fn captures_stdout_of_a_successful_invocation() {
        let (_dir, runtime) = fake_runtime("echo hello");
        let driver = SandboxDriver::new(runtime);
        let limits = SandboxLimits::default();

        let outcome = driver
            .run("unused-image", "unused-command", "unused-volume", &limits, &test_logger())
            .await
            .unwrap();

        assert!(outcome.exit_ok);
        assert_eq!(outcome.stdout, b"hello\n");
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_as_not_ok() {
        let (_dir, runtime) = fake_runtime("echo boom 1>&2\nexit 1");
        let driver = SandboxDriver::new(runtime);
        let limits = SandboxLimits::default();

        let outcome = driver
            .run("unused", "unused", "unused", &limits, &test_logger())
            .await
            .unwrap();

        assert!(!outcome.exit_ok);
        assert_eq!(outcome.stderr, b"boom\n");
    }

    #[tokio::test]
    async fn timeout_kills_the_container_and_returns_timeout_error() {
        let (_dir, runtime) = fake_runtime("sleep 5");
        let driver = SandboxDriver::new(runtime);
        let limits = SandboxLimits {
            timeout: coderunner_util::SandboxTimeout(Duration::from_millis(50)),
            ..SandboxLimits::default()
        };

        let result = driver
            .run("unused", "unused", "unused", &limits, &test_logger())
            .await;

        assert!(matches!(result, Err(DriverError::Timeout { .. })));
    }
}
