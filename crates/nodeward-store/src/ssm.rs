use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use nodeward_core::shell::{Cmd, excerpt};

use super::{CoordinationStore, Entry, PutOptions, StoreError};

/// AWS SSM Parameter Store through the `aws` CLI.
///
/// Secure values are written as `SecureString`; every read passes
/// `--with-decryption`, so a caller without KMS decrypt permission gets
/// `AccessDenied` rather than ciphertext.
#[derive(Debug, Clone)]
pub struct SsmStore {
    region: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Parameter {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetParameterOutput {
    parameter: Parameter,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetParametersByPathOutput {
    #[serde(default)]
    parameters: Vec<Parameter>,
}

impl SsmStore {
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

    async fn run(&self, cmd: Cmd, path: &str) -> Result<String, StoreError> {
        let out = cmd
            .output()
            .await
            .map_err(|e| StoreError::backend(path, format!("{:#}", e)))?;
        if out.success() {
            Ok(out.stdout)
        } else {
            Err(classify_cli_error(path, &out.stderr))
        }
    }
}

/// Map `aws ssm` stderr onto the store taxonomy.
pub fn classify_cli_error(path: &str, stderr: &str) -> StoreError {
    if stderr.contains("ParameterNotFound") {
        StoreError::NotFound(path.to_string())
    } else if stderr.contains("AccessDenied") || stderr.contains("not authorized") {
        StoreError::AccessDenied(format!("{}: {}", path, excerpt(stderr)))
    } else {
        StoreError::backend(path, excerpt(stderr))
    }
}

fn parse_get_parameter(path: &str, json: &str) -> Result<String, StoreError> {
    let out: GetParameterOutput = serde_json::from_str(json)
        .map_err(|e| StoreError::backend(path, format!("unexpected get-parameter output: {}", e)))?;
    Ok(out.parameter.value)
}

fn parse_parameters_by_path(prefix: &str, json: &str) -> Result<Vec<Entry>, StoreError> {
    let out: GetParametersByPathOutput = serde_json::from_str(json).map_err(|e| {
        StoreError::backend(prefix, format!("unexpected get-parameters-by-path output: {}", e))
    })?;
    let mut entries: Vec<Entry> = out
        .parameters
        .into_iter()
        .filter(|p| p.name.starts_with(prefix))
        .map(|p| Entry {
            path: p.name,
            value: p.value,
        })
        .collect();
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

#[async_trait]
impl CoordinationStore for SsmStore {
    async fn get(&self, path: &str) -> Result<String, StoreError> {
        let cmd = self
            .aws("get-parameter")
            .args(["--name", path, "--with-decryption"]);
        let stdout = self.run(cmd, path).await?;
        parse_get_parameter(path, &stdout)
    }

    async fn put(&self, path: &str, value: &str, opts: PutOptions) -> Result<(), StoreError> {
        let kind = if opts.secure { "SecureString" } else { "String" };
        let cmd = self
            .aws("put-parameter")
            .args(["--name", path, "--type", kind, "--overwrite", "--value"]);
        let cmd = if opts.secure {
            cmd.secret(value)
        } else {
            cmd.arg(value)
        };
        self.run(cmd, path).await?;
        debug!(path, kind, "SSM parameter written");
        Ok(())
    }

    async fn get_with_prefix(&self, prefix: &str) -> Result<Vec<Entry>, StoreError> {
        // get-parameters-by-path wants a hierarchy, not an arbitrary string prefix.
        let hierarchy = match prefix.rfind('/') {
            Some(0) | None => "/",
            Some(i) => &prefix[..i],
        };
        let cmd = self.aws("get-parameters-by-path").args([
            "--path",
            hierarchy,
            "--recursive",
            "--with-decryption",
        ]);
        let stdout = self.run(cmd, prefix).await?;
        parse_parameters_by_path(prefix, &stdout)
    }
}
