//! Running ffmpeg and ffprobe as child processes.
//!
//! One-shot invocations (probing, muxing, encoder listing) go through
//! [`ToolCommand::execute`], which captures output and turns a non-zero exit
//! into [`px_core::Error::Tool`]. Frame streaming goes through
//! [`ToolCommand::spawn`], which hands back the child with the requested
//! pipe attached so the caller can feed or drain raw RGBA frames.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use px_core::{Error, Result};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// Probes and encoder listings finish in seconds; anything longer is hung.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Captured result of a finished tool run.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Which end of a streaming child carries frame data.
///
/// stderr is always piped so a failing encoder or decoder can be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pipe {
    /// Decoder: frames are read from the child's stdout.
    Stdout,
    /// Encoder: frames are written to the child's stdin.
    Stdin,
}

/// An ffmpeg-family invocation under construction.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl ToolCommand {
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn arg(&mut self, s: impl Into<String>) -> &mut Self {
        self.args.push(s.into());
        self
    }

    pub fn args(&mut self, iter: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    /// Upper bound for [`execute`](Self::execute). Streaming children spawned
    /// with [`spawn`](Self::spawn) are not bounded.
    pub fn timeout(&mut self, d: Duration) -> &mut Self {
        self.timeout = d;
        self
    }

    /// Short name used in errors and log fields, e.g. `ffprobe`.
    pub fn tool_name(&self) -> String {
        match self.program.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => self.program.to_string_lossy().into_owned(),
        }
    }

    fn base(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).kill_on_drop(true);
        cmd
    }

    fn spawn_failed(&self, e: std::io::Error) -> Error {
        Error::tool(self.tool_name(), format!("failed to spawn: {e}"))
    }

    /// Run to completion and capture output. Used for session-independent
    /// calls such as encoder listing and version checks.
    pub async fn execute(&self) -> Result<ToolOutput> {
        self.execute_cancellable(&CancellationToken::new()).await
    }

    /// Run to completion unless `cancel` fires first, in which case the child
    /// is killed and [`Error::Cancelled`] is returned. An already cancelled
    /// token never spawns the child.
    pub async fn execute_cancellable(&self, cancel: &CancellationToken) -> Result<ToolOutput> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let tool = self.tool_name();
        tracing::debug!(tool = %tool, args = ?self.args, "Running tool");

        let child = self
            .base()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_failed(e))?;

        // kill_on_drop reaps the child when the losing branch is dropped.
        let waited = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            r = tokio::time::timeout(self.timeout, child.wait_with_output()) => r,
        };

        let output = match waited {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(Error::tool(tool, format!("wait failed: {e}"))),
            Err(_) => return Err(Error::tool(tool, format!("timed out after {:?}", self.timeout))),
        };

        let captured = ToolOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !captured.status.success() {
            return Err(Error::tool(
                tool,
                format!("exited with {}: {}", captured.status, captured.stderr.trim()),
            ));
        }
        Ok(captured)
    }

    /// Start a streaming child with `pipe` attached for frame data.
    pub fn spawn(&self, pipe: Pipe) -> Result<Child> {
        let (stdin, stdout) = match pipe {
            Pipe::Stdout => (Stdio::null(), Stdio::piped()),
            Pipe::Stdin => (Stdio::piped(), Stdio::null()),
        };
        tracing::debug!(tool = %self.tool_name(), ?pipe, args = ?self.args, "Spawning tool");

        self.base()
            .stdin(stdin)
            .stdout(stdout)
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_failed(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn tool_name_is_file_name() {
        let cmd = ToolCommand::new(PathBuf::from("/opt/ffmpeg/bin/ffprobe"));
        assert_eq!(cmd.tool_name(), "ffprobe");
    }

    #[tokio::test]
    async fn missing_binary_is_a_tool_error() {
        let result = ToolCommand::new(PathBuf::from("/nonexistent/ffmpeg-px-test"))
            .arg("-version")
            .execute()
            .await;
        assert_matches!(result, Err(Error::Tool { ref tool, .. }) if tool == "ffmpeg-px-test");
    }

    #[tokio::test]
    async fn non_zero_exit_carries_stderr() {
        let result = ToolCommand::new(PathBuf::from("sh"))
            .args(["-c", "echo 'Invalid data found' >&2; exit 1"])
            .execute()
            .await;
        match result {
            Err(Error::Tool { message, .. }) if message.contains("failed to spawn") => {}
            Err(Error::Tool { message, .. }) => assert!(message.contains("Invalid data found"), "{message}"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn hung_tool_times_out() {
        let result = ToolCommand::new(PathBuf::from("sleep"))
            .arg("10")
            .timeout(Duration::from_millis(100))
            .execute()
            .await;
        let err = result.unwrap_err().to_string();
        assert!(err.contains("timed out") || err.contains("failed to spawn"), "{err}");
    }

    #[tokio::test]
    async fn cancellation_kills_child() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let result = ToolCommand::new(PathBuf::from("sleep"))
            .arg("10")
            .execute_cancellable(&cancel)
            .await;
        if let Err(Error::Tool { .. }) = result {
            return;
        }
        assert_matches!(result, Err(Error::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancelled_token_never_spawns() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        // A missing binary would fail to spawn; cancellation wins first.
        let result = ToolCommand::new(PathBuf::from("/nonexistent/ffprobe-px-test"))
            .execute_cancellable(&cancel)
            .await;
        assert_matches!(result, Err(Error::Cancelled));
    }
}
