use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use nodeward_core::failover::{FloatingAddressBinding, InstanceInfo, InstanceState, MembershipTag};
use nodeward_core::shell::{Cmd, CmdOutput, excerpt};

use crate::provider::ComputeProvider;

/// EC2 through the `aws` CLI.
#[derive(Debug, Clone)]
pub struct Ec2Provider {
    region: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeAddresses {
    #[serde(default)]
    addresses: Vec<Address>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Address {
    allocation_id: String,
    #[serde(default)]
    public_ip: Option<String>,
    #[serde(default)]
    instance_id: Option<String>,
    #[serde(default)]
    association_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstances {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<Instance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Instance {
    instance_id: String,
    state: State,
    #[serde(default)]
    tags: Vec<Tag>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct State {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Tag {
    key: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssociateOutput {
    association_id: String,
}

impl Ec2Provider {
    pub fn new(region: &str) -> Self {
        Self {
            region: region.to_string(),
        }
    }

    fn aws(&self, op: &str) -> Cmd {
        Cmd::new("aws")
            .args(["ec2", op])
            .args(["--region", self.region.as_str(), "--output", "json"])
    }

    async fn run(&self, cmd: Cmd) -> Result<CmdOutput> {
        let shown = cmd.display();
        cmd.output()
            .await
            .with_context(|| format!("Failed to run {}", shown))
    }
}

fn parse_binding(allocation_id: &str, json: &str) -> Result<FloatingAddressBinding> {
    let out: DescribeAddresses =
        serde_json::from_str(json).context("Unexpected describe-addresses output")?;
    let Some(address) = out
        .addresses
        .into_iter()
        .find(|a| a.allocation_id == allocation_id)
    else {
        bail!("No floating address with allocation id {}", allocation_id);
    };
    Ok(FloatingAddressBinding {
        allocation_id: address.allocation_id,
        current_owner_instance_id: address.instance_id,
        association_id: address.association_id,
        public_ip: address.public_ip,
    })
}

fn parse_instances(json: &str) -> Result<Vec<InstanceInfo>> {
    let out: DescribeInstances =
        serde_json::from_str(json).context("Unexpected describe-instances output")?;
    Ok(out
        .reservations
        .into_iter()
        .flat_map(|r| r.instances)
        .map(|i| {
            let mut info = InstanceInfo::new(&i.instance_id, InstanceState::parse(&i.state.name));
            for tag in i.tags {
                info.tags.insert(tag.key, tag.value);
            }
            info
        })
        .collect())
}

#[async_trait]
impl ComputeProvider for Ec2Provider {
    async fn describe_binding(&self, allocation_id: &str) -> Result<FloatingAddressBinding> {
        let out = self
            .run(
                self.aws("describe-addresses")
                    .args(["--allocation-ids", allocation_id]),
            )
            .await?;
        if !out.success() {
            bail!("describe-addresses failed: {}", excerpt(&out.stderr));
        }
        parse_binding(allocation_id, &out.stdout)
    }

    async fn describe_instance(&self, instance_id: &str) -> Result<Option<InstanceInfo>> {
        let out = self
            .run(
                self.aws("describe-instances")
                    .args(["--instance-ids", instance_id]),
            )
            .await?;
        if !out.success() {
            if out.stderr.contains("InvalidInstanceID.NotFound") {
                return Ok(None);
            }
            bail!("describe-instances failed: {}", excerpt(&out.stderr));
        }
        Ok(parse_instances(&out.stdout)?.into_iter().next())
    }

    async fn list_members(&self, tag: &MembershipTag) -> Result<Vec<InstanceInfo>> {
        let out = self
            .run(self.aws("describe-instances").args([
                "--filters".to_string(),
                format!("Name=tag:{},Values={}", tag.key, tag.value),
                "Name=instance-state-name,Values=running".to_string(),
            ]))
            .await?;
        if !out.success() {
            bail!("describe-instances failed: {}", excerpt(&out.stderr));
        }
        let members = parse_instances(&out.stdout)?;
        debug!(count = members.len(), tag = %tag.key, "Listed cluster members");
        Ok(members)
    }

    async fn disassociate(&self, association_id: &str) -> Result<()> {
        let out = self
            .run(
                self.aws("disassociate-address")
                    .args(["--association-id", association_id]),
            )
            .await?;
        if out.success() || out.stderr.contains("InvalidAssociationID.NotFound") {
            return Ok(());
        }
        bail!("disassociate-address failed: {}", excerpt(&out.stderr))
    }

    async fn associate(&self, allocation_id: &str, instance_id: &str) -> Result<String> {
        let out = self
            .run(self.aws("associate-address").args([
                "--allocation-id",
                allocation_id,
                "--instance-id",
                instance_id,
                "--allow-reassociation",
            ]))
            .await?;
        if !out.success() {
            bail!("associate-address failed: {}", excerpt(&out.stderr));
        }
        let parsed: AssociateOutput =
            serde_json::from_str(&out.stdout).context("Unexpected associate-address output")?;
        info!(
            allocation_id,
            instance = instance_id,
            association_id = %parsed.association_id,
            "Floating address associated"
        );
        Ok(parsed.association_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_binding() {
        let json = r#"{
            "Addresses": [{
                "AllocationId": "eipalloc-1",
                "PublicIp": "203.0.113.10",
                "InstanceId": "i-1",
                "AssociationId": "eipassoc-9",
                "Domain": "vpc"
            }]
        }"#;
        let binding = parse_binding("eipalloc-1", json).unwrap();
        assert!(binding.is_owned_by("i-1"));
        assert_eq!(binding.association_id.as_deref(), Some("eipassoc-9"));
        assert_eq!(binding.public_ip.as_deref(), Some("203.0.113.10"));
    }

    #[test]
    fn test_parse_unassociated_binding() {
        let json = r#"{"Addresses": [{"AllocationId": "eipalloc-1", "PublicIp": "203.0.113.10"}]}"#;
        let binding = parse_binding("eipalloc-1", json).unwrap();
        assert_eq!(binding.current_owner_instance_id, None);
        assert!(parse_binding("eipalloc-2", json).is_err());
    }

    #[test]
    fn test_parse_instances_flattens_reservations() {
        let json = r#"{
            "Reservations": [
                {"Instances": [{
                    "InstanceId": "i-2",
                    "State": {"Code": 16, "Name": "running"},
                    "Tags": [{"Key": "Cluster", "Value": "k8s-development"}]
                }]},
                {"Instances": [{"InstanceId": "i-3", "State": {"Name": "stopped"}}]}
            ]
        }"#;
        let instances = parse_instances(json).unwrap();
        assert_eq!(instances.len(), 2);
        assert!(instances[0].is_healthy_member(&MembershipTag::new("Cluster", "k8s-development")));
        assert_eq!(instances[1].state, InstanceState::Stopped);
    }
}
