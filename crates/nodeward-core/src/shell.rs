use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::{debug, error, info};

/// Default per-command timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    /// Exit code, or -1 when the process was killed by a signal.
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

/// An external command with structured logging, timing, and a timeout.
///
/// Arguments added with [`Cmd::secret`] are passed to the process but
/// replaced with `***` in every log line.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: String,
    args: Vec<(String, bool)>,
    envs: Vec<(String, String)>,
    timeout: Duration,
}

impl Cmd {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            envs: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Run a script through `bash -c`.
    pub fn script(script: &str) -> Self {
        Self::new("bash").arg("-c").arg(script)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push((arg.into(), false));
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(|a| (a.into(), false)));
        self
    }

    pub fn secret(mut self, arg: impl Into<String>) -> Self {
        self.args.push((arg.into(), true));
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.envs.push((key.to_string(), value.to_string()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Command line as it appears in logs.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().map(|(a, secret)| {
            if *secret {
                "***".to_string()
            } else {
                a.clone()
            }
        }));
        parts.join(" ")
    }

    /// Run and capture output. A non-zero exit is not an error here.
    pub async fn output(&self) -> Result<CmdOutput> {
        let shown = self.display();
        info!(command = %shown, "Running");

        let mut command = Command::new(&self.program);
        command
            .args(self.args.iter().map(|(a, _)| a.as_str()))
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let start = Instant::now();
        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| {
                error!(command = %shown, timeout_secs = self.timeout.as_secs(), "Command timed out");
                anyhow::anyhow!("Command timed out after {}s: {}", self.timeout.as_secs(), shown)
            })?
            .with_context(|| format!("Failed to run: {}", shown))?;

        let result = CmdOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration: start.elapsed(),
        };

        if result.success() {
            debug!(
                command = %shown,
                duration_ms = result.duration.as_millis() as u64,
                "Command succeeded"
            );
        } else {
            error!(
                command = %shown,
                code = result.code,
                duration_ms = result.duration.as_millis() as u64,
                stderr = %excerpt(&result.stderr),
                "Command failed"
            );
        }
        Ok(result)
    }

    /// Run and fail on a non-zero exit.
    pub async fn checked(&self) -> Result<CmdOutput> {
        let result = self.output().await?;
        if !result.success() {
            anyhow::bail!(
                "Command failed (exit {}): {}: {}",
                result.code,
                self.display(),
                excerpt(&result.stderr)
            );
        }
        Ok(result)
    }
}

/// First 500 characters of a command's stderr, trimmed.
pub fn excerpt(s: &str) -> String {
    s.trim().chars().take(500).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_redacts_secrets() {
        let cmd = Cmd::new("kubeadm")
            .args(["join", "10.0.0.5:6443", "--token"])
            .secret("abcdef.0123456789abcdef");
        let shown = cmd.display();
        assert_eq!(shown, "kubeadm join 10.0.0.5:6443 --token ***");
    }

    #[test]
    fn test_excerpt_truncates() {
        let long = "x".repeat(2000);
        assert_eq!(excerpt(&long).len(), 500);
        assert_eq!(excerpt("  short \n"), "short");
    }

    #[tokio::test]
    async fn test_output_captures_stdout() {
        let out = Cmd::script("echo hello").output().await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout_trimmed(), "hello");
    }

    #[tokio::test]
    async fn test_checked_fails_on_nonzero_exit() {
        let err = Cmd::script("echo boom >&2; exit 3")
            .checked()
            .await
            .unwrap_err();
        let msg = format!("{}", err);
        assert!(msg.contains("exit 3"));
        assert!(msg.contains("boom"));
    }

    #[tokio::test]
    async fn test_timeout() {
        let err = Cmd::script("sleep 5")
            .timeout(Duration::from_millis(50))
            .output()
            .await
            .unwrap_err();
        assert!(format!("{}", err).contains("timed out"));
    }
}
