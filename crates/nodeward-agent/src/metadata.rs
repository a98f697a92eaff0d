use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

/// Link-local instance metadata service address.
pub const IMDS_ENDPOINT: &str = "http://169.254.169.254";

const TOKEN_TTL_SECS: &str = "21600";

/// Facts about the instance this agent runs on.
#[async_trait]
pub trait InstanceMetadata: Send + Sync {
    /// Raw metadata value at `path`, `None` if the service has no such key.
    async fn get(&self, path: &str) -> Result<Option<String>>;

    async fn instance_id(&self) -> Result<String> {
        self.required("instance-id").await
    }

    /// Machine image the instance booted from.
    async fn image_id(&self) -> Result<String> {
        self.required("ami-id").await
    }

    async fn local_ipv4(&self) -> Result<String> {
        self.required("local-ipv4").await
    }

    async fn public_ipv4(&self) -> Result<Option<String>> {
        self.get("public-ipv4").await
    }

    async fn required(&self, path: &str) -> Result<String> {
        self.get(path)
            .await?
            .filter(|v| !v.trim().is_empty())
            .with_context(|| format!("Instance metadata has no value for {}", path))
    }
}

/// IMDSv2 client: session token via PUT, then token-authenticated GETs.
pub struct Imds {
    client: reqwest::Client,
    endpoint: String,
}

impl Imds {
    pub fn new() -> Result<Self> {
        Self::with_endpoint(IMDS_ENDPOINT)
    }

    pub fn with_endpoint(endpoint: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("nodeward/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    async fn session_token(&self) -> Result<String> {
        let url = format!("{}/latest/api/token", self.endpoint);
        let resp = self
            .client
            .put(&url)
            .header("X-aws-ec2-metadata-token-ttl-seconds", TOKEN_TTL_SECS)
            .send()
            .await
            .with_context(|| format!("IMDS token request failed: {}", url))?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("HTTP {} for {}", status, url);
        }
        resp.text()
            .await
            .with_context(|| format!("Failed to read IMDS token from {}", url))
    }
}

#[async_trait]
impl InstanceMetadata for Imds {
    async fn get(&self, path: &str) -> Result<Option<String>> {
        let token = self.session_token().await?;
        let url = format!("{}/latest/meta-data/{}", self.endpoint, path);
        let resp = self
            .client
            .get(&url)
            .header("X-aws-ec2-metadata-token", token)
            .send()
            .await
            .with_context(|| format!("HTTP request failed: {}", url))?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            debug!(path, "Metadata key absent");
            return Ok(None);
        }
        if !status.is_success() {
            anyhow::bail!("HTTP {} for {}", status, url);
        }
        let body = resp
            .text()
            .await
            .with_context(|| format!("Failed to read response body from {}", url))?;
        Ok(Some(body.trim().to_string()))
    }
}

/// Fixed metadata, for dry runs and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticMetadata {
    values: HashMap<String, String>,
}

impl StaticMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, path: &str, value: &str) -> Self {
        self.values.insert(path.to_string(), value.to_string());
        self
    }
}

#[async_trait]
impl InstanceMetadata for StaticMetadata {
    async fn get(&self, path: &str) -> Result<Option<String>> {
        Ok(self.values.get(path).cloned())
    }
}
