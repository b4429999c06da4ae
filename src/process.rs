//! Bounded external-process execution.
//!
//! Builds run in their own process group so a timeout can take down the
//! whole tree (Maven forks surefire JVMs that outlive a killed parent).

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

use crate::error::{EvalError, Result};

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// stdout followed by stderr
    pub fn combined(&self) -> String {
        let mut combined = String::with_capacity(self.stdout.len() + self.stderr.len());
        combined.push_str(&self.stdout);
        combined.push_str(&self.stderr);
        combined
    }
}

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    max_output_bytes: usize,
}

/// Read to EOF, keeping only what fits in the budget shared by both streams.
/// Excess is drained so the child never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, budget: &AtomicUsize) -> std::io::Result<(Vec<u8>, bool)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut overflowed = false;
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let granted = budget
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |left| Some(left.saturating_sub(n)))
            .map(|left| left.min(n))
            .unwrap_or(0);
        if granted < n {
            overflowed = true;
        }
        buf.extend_from_slice(&chunk[..granted]);
    }
    Ok((buf, overflowed))
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        log::debug!("killpg {} failed: {}", pid, e);
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

async fn terminate(child: &mut Child, pid: Option<u32>) {
    if let Some(pid) = pid {
        kill_group(pid);
    }
    let _ = child.start_kill();
    if let Err(e) = child.wait().await {
        log::warn!("Failed to reap killed process: {}", e);
    }
}

impl ProcessRunner {
    pub fn new(max_output_bytes: usize) -> Self {
        Self { max_output_bytes }
    }

    pub async fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        timeout: Duration,
    ) -> Result<ProcessOutput> {
        let command = std::iter::once(program)
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        log::debug!("Running `{}` in {}", command, cwd.display());

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let started = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| EvalError::io(format!("spawning `{}` in {}", command, cwd.display()), e))?;
        let pid = child.id();

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(out), Some(err)) => (out, err),
            _ => {
                terminate(&mut child, pid).await;
                return Err(EvalError::io(
                    format!("capturing output of `{}`", command),
                    std::io::Error::new(std::io::ErrorKind::Other, "stdio not piped"),
                ));
            }
        };

        let limit = self.max_output_bytes;
        let budget = AtomicUsize::new(limit);
        let finished = tokio::time::timeout(timeout, async {
            let (out, err) = tokio::join!(read_capped(stdout, &budget), read_capped(stderr, &budget));
            let status = child.wait().await;
            (out, err, status)
        })
        .await;

        let (out, err, status) = match finished {
            Ok(parts) => parts,
            Err(_) => {
                log::warn!("`{}` exceeded {}s, killing process group", command, timeout.as_secs());
                terminate(&mut child, pid).await;
                return Err(EvalError::Timeout {
                    command,
                    after: timeout,
                });
            }
        };

        let io_ctx = |what: &str| format!("{} of `{}`", what, command);
        let (out, out_overflow) = out.map_err(|e| EvalError::io(io_ctx("reading stdout"), e))?;
        let (err, err_overflow) = err.map_err(|e| EvalError::io(io_ctx("reading stderr"), e))?;
        let status = status.map_err(|e| EvalError::io(io_ctx("waiting for exit"), e))?;

        if out_overflow || err_overflow {
            return Err(EvalError::OutputOverflow { command, limit });
        }

        Ok(ProcessOutput {
            status,
            stdout: String::from_utf8_lossy(&out).into_owned(),
            stderr: String::from_utf8_lossy(&err).into_owned(),
            elapsed: started.elapsed(),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn test_captures_both_streams() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new(1024);
        let output = runner
            .run("sh", &sh("echo out; echo err >&2"), dir.path(), Duration::from_secs(10))
            .await
            .unwrap();

        assert!(output.success());
        assert_eq!(output.combined(), "out\nerr\n");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new(1024);
        let output = runner
            .run("sh", &sh("echo failing; exit 3"), dir.path(), Duration::from_secs(10))
            .await
            .unwrap();

        assert!(!output.success());
        assert_eq!(output.status.code(), Some(3));
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new(1024);
        let started = Instant::now();
        let err = runner
            .run("sh", &sh("sleep 30"), dir.path(), Duration::from_millis(200))
            .await
            .unwrap_err();

        assert!(matches!(err, EvalError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_output_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new(100);
        let err = runner
            .run("sh", &sh("head -c 5000 /dev/zero"), dir.path(), Duration::from_secs(10))
            .await
            .unwrap_err();

        assert!(matches!(err, EvalError::OutputOverflow { limit: 100, .. }));
    }

    #[tokio::test]
    async fn test_output_limit_covers_both_streams() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new(100);
        let err = runner
            .run(
                "sh",
                &sh("head -c 60 /dev/zero; head -c 60 /dev/zero >&2"),
                dir.path(),
                Duration::from_secs(10),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EvalError::OutputOverflow { limit: 100, .. }));

        let output = runner
            .run("sh", &sh("head -c 40 /dev/zero; head -c 40 /dev/zero >&2"), dir.path(), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(output.combined().len(), 80);
    }
}
