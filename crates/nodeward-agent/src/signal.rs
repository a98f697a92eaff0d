use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info, warn};

use nodeward_core::shell::Cmd;

const SIGNAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Final boot outcome handed to the provisioning layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootVerdict {
    pub success: bool,
    pub reason: Option<String>,
}

impl BootVerdict {
    pub fn success() -> Self {
        Self {
            success: true,
            reason: None,
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: Some(reason.into()),
        }
    }
}

/// Where boot signals go. Fire-and-forget from the caller's view.
#[async_trait]
pub trait BootSignalSink: Send + Sync {
    fn name(&self) -> &str;

    async fn signal(&self, verdict: &BootVerdict) -> Result<()>;
}

/// CloudFormation `cfn-signal`.
#[derive(Debug, Clone)]
pub struct CfnSignalSink {
    stack: String,
    resource: String,
    region: String,
}

impl CfnSignalSink {
    pub fn new(stack: &str, resource: &str, region: &str) -> Self {
        Self {
            stack: stack.to_string(),
            resource: resource.to_string(),
            region: region.to_string(),
        }
    }

    fn command(&self, verdict: &BootVerdict) -> Cmd {
        let mut cmd = Cmd::new("cfn-signal")
            .args(["--success", if verdict.success { "true" } else { "false" }])
            .args(["--stack", self.stack.as_str()])
            .args(["--resource", self.resource.as_str()])
            .args(["--region", self.region.as_str()]);
        if let Some(reason) = &verdict.reason {
            cmd = cmd.args(["--reason", reason.as_str()]);
        }
        cmd.timeout(SIGNAL_TIMEOUT)
    }
}

#[async_trait]
impl BootSignalSink for CfnSignalSink {
    fn name(&self) -> &str {
        "cfn-signal"
    }

    async fn signal(&self, verdict: &BootVerdict) -> Result<()> {
        self.command(verdict).checked().await?;
        Ok(())
    }
}

/// Logs the verdict. Used when no provisioning stack is configured.
#[derive(Debug, Clone, Default)]
pub struct LogSink;

#[async_trait]
impl BootSignalSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn signal(&self, verdict: &BootVerdict) -> Result<()> {
        if verdict.success {
            info!("Boot succeeded");
        } else {
            error!(reason = verdict.reason.as_deref().unwrap_or(""), "Boot failed");
        }
        Ok(())
    }
}

/// Keeps every verdict it receives.
#[derive(Debug, Default)]
pub struct RecordingSink {
    signals: Mutex<Vec<BootVerdict>>,
    fail: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that records and then reports a delivery error.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn signals(&self) -> Vec<BootVerdict> {
        self.signals.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl BootSignalSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn signal(&self, verdict: &BootVerdict) -> Result<()> {
        if let Ok(mut s) = self.signals.lock() {
            s.push(verdict.clone());
        }
        if self.fail {
            anyhow::bail!("signal endpoint unreachable");
        }
        Ok(())
    }
}

/// Sends the boot verdict once.
///
/// `report` consumes the reporter, so a second signal cannot be sent.
/// Delivery errors are logged and swallowed.
pub struct BootSignalReporter {
    sink: Arc<dyn BootSignalSink>,
}

impl BootSignalReporter {
    pub fn new(sink: Arc<dyn BootSignalSink>) -> Self {
        Self { sink }
    }

    pub async fn report(self, verdict: &BootVerdict) {
        let sink = self.sink.name().to_string();
        match tokio::time::timeout(SIGNAL_TIMEOUT, self.sink.signal(verdict)).await {
            Ok(Ok(())) => info!(sink = %sink, success = verdict.success, "Boot signal sent"),
            Ok(Err(e)) => warn!(sink = %sink, error = %format!("{:#}", e), "Boot signal failed"),
            Err(_) => warn!(sink = %sink, "Boot signal timed out"),
        }
    }
}
