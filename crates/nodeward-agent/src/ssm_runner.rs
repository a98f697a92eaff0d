use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use nodeward_core::automation::{AutomationRun, RunId, RunStatus, StepFailure};
use nodeward_core::shell::{Cmd, excerpt};

use crate::automation::{AutomationError, AutomationRunner};

/// SSM Automation through the `aws` CLI.
#[derive(Debug, Clone)]
pub struct SsmAutomationRunner {
    region: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StartOutput {
    automation_execution_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetOutput {
    automation_execution: Execution,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Execution {
    automation_execution_status: String,
    #[serde(default)]
    step_executions: Vec<StepExecution>,
    #[serde(default)]
    failure_message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StepExecution {
    step_name: String,
    step_status: String,
    #[serde(default)]
    failure_message: Option<String>,
}

impl SsmAutomationRunner {
    pub fn new(region: &str) -> Self {
        Self {
            region: region.to_string(),
        }
    }

    fn aws(&self, op: &str) -> Cmd {
        Cmd::new("aws")
            .args(["ssm", op])
            .args(["--region", self.region.as_str(), "--output", "json"])
    }

    async fn run(&self, cmd: Cmd) -> Result<String, AutomationError> {
        let out = cmd
            .output()
            .await
            .map_err(|e| AutomationError::Unreachable(format!("{:#}", e)))?;
        if out.success() {
            Ok(out.stdout)
        } else {
            Err(classify_cli_error(&out.stderr))
        }
    }
}

pub fn classify_cli_error(stderr: &str) -> AutomationError {
    if stderr.contains("AutomationDefinitionNotFound") || stderr.contains("InvalidDocument") {
        AutomationError::DefinitionNotFound(excerpt(stderr))
    } else if stderr.contains("Could not connect to the endpoint")
        || stderr.contains("Unable to locate credentials")
        || stderr.contains("EndpointConnectionError")
    {
        AutomationError::Unreachable(excerpt(stderr))
    } else {
        AutomationError::Backend(excerpt(stderr))
    }
}

/// Map an SSM `AutomationExecutionStatus` to a run status.
pub fn map_status(raw: &str) -> RunStatus {
    match raw {
        "Pending" | "Waiting" | "Scheduled" | "PendingApproval" | "Approved" => RunStatus::Pending,
        "InProgress" | "Cancelling" | "RunbookInProgress" | "PendingChangeCalendarOverride" => {
            RunStatus::InProgress
        }
        "Success" | "CompletedWithSuccess" => RunStatus::Success,
        "Failed" | "Exited" | "CompletedWithFailure" | "Rejected"
        | "ChangeCalendarOverrideRejected" => RunStatus::Failed,
        "Cancelled" => RunStatus::Cancelled,
        "TimedOut" => RunStatus::TimedOut,
        other => {
            warn!(status = other, "Unrecognized automation status, treating as in progress");
            RunStatus::InProgress
        }
    }
}

fn parameters_json(parameters: &BTreeMap<String, String>) -> String {
    let map: BTreeMap<&str, [&str; 1]> = parameters
        .iter()
        .map(|(k, v)| (k.as_str(), [v.as_str()]))
        .collect();
    serde_json::to_string(&map).unwrap_or_else(|_| "{}".to_string())
}

fn parse_status(run_id: &RunId, json: &str) -> Result<AutomationRun, AutomationError> {
    let out: GetOutput = serde_json::from_str(json).map_err(|e| {
        AutomationError::Backend(format!("unexpected get-automation-execution output: {}", e))
    })?;
    let exec = out.automation_execution;
    let status = map_status(&exec.automation_execution_status);

    let mut step_failures: Vec<StepFailure> = exec
        .step_executions
        .iter()
        .filter(|s| matches!(s.step_status.as_str(), "Failed" | "TimedOut" | "Cancelled"))
        .map(|s| {
            StepFailure::new(
                &s.step_name,
                s.failure_message.as_deref().unwrap_or(&s.step_status),
            )
        })
        .collect();
    if step_failures.is_empty()
        && !status.is_success()
        && status.is_terminal()
        && let Some(msg) = exec.failure_message
    {
        step_failures.push(StepFailure::new("execution", &msg));
    }

    Ok(AutomationRun {
        run_id: run_id.clone(),
        status,
        step_failures,
    })
}

#[async_trait]
impl AutomationRunner for SsmAutomationRunner {
    async fn start(
        &self,
        name: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<RunId, AutomationError> {
        let mut cmd = self
            .aws("start-automation-execution")
            .args(["--document-name", name]);
        if !parameters.is_empty() {
            cmd = cmd.args(["--parameters".to_string(), parameters_json(parameters)]);
        }
        let stdout = self.run(cmd).await?;
        let out: StartOutput = serde_json::from_str(&stdout).map_err(|e| {
            AutomationError::Backend(format!("unexpected start-automation-execution output: {}", e))
        })?;
        Ok(RunId::new(out.automation_execution_id))
    }

    async fn get_status(&self, run_id: &RunId) -> Result<AutomationRun, AutomationError> {
        let cmd = self
            .aws("get-automation-execution")
            .args(["--automation-execution-id", run_id.as_str()]);
        let stdout = self.run(cmd).await?;
        parse_status(run_id, &stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_status() {
        assert_eq!(map_status("Waiting"), RunStatus::Pending);
        assert_eq!(map_status("Cancelling"), RunStatus::InProgress);
        assert_eq!(map_status("Success"), RunStatus::Success);
        assert_eq!(map_status("TimedOut"), RunStatus::TimedOut);
        assert_eq!(map_status("Exited"), RunStatus::Failed);
        assert_eq!(map_status("SomethingNew"), RunStatus::InProgress);
    }

    #[test]
    fn test_classify_cli_error() {
        assert!(matches!(
            classify_cli_error(
                "An error occurred (AutomationDefinitionNotFoundException) when calling the StartAutomationExecution operation"
            ),
            AutomationError::DefinitionNotFound(_)
        ));
        assert!(matches!(
            classify_cli_error("Could not connect to the endpoint URL: \"https://ssm.eu-west-1.amazonaws.com/\""),
            AutomationError::Unreachable(_)
        ));
        assert!(matches!(
            classify_cli_error("An error occurred (ThrottlingException)"),
            AutomationError::Backend(_)
        ));
    }

    #[test]
    fn test_parameters_json() {
        let mut params = BTreeMap::new();
        params.insert("Role".to_string(), "control-plane".to_string());
        params.insert("Environment".to_string(), "development".to_string());
        assert_eq!(
            parameters_json(&params),
            r#"{"Environment":["development"],"Role":["control-plane"]}"#
        );
    }

    #[test]
    fn test_parse_failed_execution() {
        let json = r#"{
            "AutomationExecution": {
                "AutomationExecutionId": "exec-1",
                "AutomationExecutionStatus": "Failed",
                "StepExecutions": [
                    {"StepName": "validateAmi", "StepStatus": "Success"},
                    {"StepName": "initKubeadm", "StepStatus": "Failed", "FailureMessage": "exit 1"},
                    {"StepName": "installCalico", "StepStatus": "TimedOut"}
                ]
            }
        }"#;
        let run = parse_status(&RunId::new("exec-1"), json).unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(
            run.step_failures,
            vec![
                StepFailure::new("initKubeadm", "exit 1"),
                StepFailure::new("installCalico", "TimedOut"),
            ]
        );
    }

    #[test]
    fn test_parse_execution_level_failure() {
        let json = r#"{
            "AutomationExecution": {
                "AutomationExecutionStatus": "Failed",
                "FailureMessage": "Step fails when it is verifying the command"
            }
        }"#;
        let run = parse_status(&RunId::new("exec-2"), json).unwrap();
        assert_eq!(run.step_failures.len(), 1);
        assert_eq!(run.step_failures[0].step_name, "execution");
    }

    #[test]
    fn test_parse_in_progress() {
        let json = r#"{"AutomationExecution": {"AutomationExecutionStatus": "InProgress"}}"#;
        let run = parse_status(&RunId::new("exec-3"), json).unwrap();
        assert_eq!(run.status, RunStatus::InProgress);
        assert!(run.step_failures.is_empty());
    }
}
