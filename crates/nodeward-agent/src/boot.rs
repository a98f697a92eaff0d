use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use nodeward_core::clock::{Clock, Deadline};
use nodeward_core::config::NodewardConfig;
use nodeward_core::join::ControlPlaneEndpoint;
use nodeward_core::naming::StorePaths;
use nodeward_core::role::NodeRole;
use nodeward_store::CoordinationStore;

use crate::automation::{AutomationExecutor, AutomationRunner, LocalBootstrap};
use crate::consumer::JoinConsumer;
use crate::control_plane::ControlPlane;
use crate::error::BootError;
use crate::gate::{GoldenImageGate, InstallPath};
use crate::install::PackageInstaller;
use crate::join::JoinExecutor;
use crate::metadata::InstanceMetadata;
use crate::publisher::{ControlPlaneRecords, JoinPublisher};
use crate::signal::{BootSignalReporter, BootVerdict};
use crate::steps::{Marker, StepRunner};
use crate::validate::ImageValidator;

const PUBLISHED_MARKER: &str = "join-materials.published";
const INSTALLED_MARKER: &str = "packages.installed";

/// Collaborators a boot sequence drives.
pub struct BootDeps {
    pub store: Arc<dyn CoordinationStore>,
    pub metadata: Arc<dyn InstanceMetadata>,
    pub control_plane: Arc<dyn ControlPlane>,
    pub joiner: Arc<dyn JoinExecutor>,
    /// Remote runner; used only when `[automation].document` is set.
    pub automation: Option<Arc<dyn AutomationRunner>>,
    pub clock: Arc<dyn Clock>,
    pub installer: PackageInstaller,
    pub validator: ImageValidator,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    pub name: &'static str,
    pub detail: String,
}

/// A node's whole boot: gate, prepare, then the role's join or
/// control-plane steps, ending in exactly one boot signal.
pub struct BootSequence {
    role: NodeRole,
    config: NodewardConfig,
    paths: StorePaths,
    deps: BootDeps,
}

impl BootSequence {
    pub fn new(role: NodeRole, config: NodewardConfig, deps: BootDeps) -> Result<Self> {
        let paths = config.paths()?;
        Ok(Self {
            role,
            config,
            paths,
            deps,
        })
    }

    pub fn plan(&self) -> Vec<PlannedStep> {
        let boot = &self.config.boot;
        let mut plan = vec![
            PlannedStep {
                name: "golden-image-gate",
                detail: format!(
                    "compare booted image with {}",
                    self.paths.golden_image_baseline()
                ),
            },
            PlannedStep {
                name: "prepare-image",
                detail: "validate-image (pre-baked) or install-packages (full install)".into(),
            },
        ];
        if self.role.is_control_plane() {
            plan.push(PlannedStep {
                name: "init-control-plane",
                detail: format!(
                    "kubeadm init v{}, or renew certificates if {} exists",
                    boot.k8s_version,
                    boot.admin_conf.display()
                ),
            });
            plan.push(PlannedStep {
                name: "configure-kubectl",
                detail: "copy admin kubeconfig to operator accounts".into(),
            });
            plan.push(PlannedStep {
                name: "publish-join-materials",
                detail: format!("write join materials under {}", self.paths.prefix()),
            });
            plan.push(PlannedStep {
                name: "verify-cluster",
                detail: "node readiness and system pod health, warnings only".into(),
            });
        } else {
            plan.push(PlannedStep {
                name: "join-cluster",
                detail: format!(
                    "wait up to {} x {}s for join materials, join once as {}, wait for kubelet",
                    self.config.join.max_attempts,
                    self.config.join.retry_interval_secs,
                    self.role.node_label()
                ),
            });
        }
        if let Some(doc) = &self.config.automation.document {
            plan.insert(
                0,
                PlannedStep {
                    name: "automation",
                    detail: format!("run {} remotely; steps below are the local fallback", doc),
                },
            );
        }
        plan
    }

    /// Boot to a verdict and report it once.
    pub async fn run(&self, reporter: BootSignalReporter) -> BootVerdict {
        let clock = self.deps.clock.as_ref();
        let deadline = Deadline::after(clock, self.config.boot.deadline());
        info!(
            role = %self.role,
            deadline_secs = self.config.boot.deadline_secs,
            prefix = self.paths.prefix(),
            "Boot starting"
        );

        let verdict = match (&self.config.automation.document, &self.deps.automation) {
            (Some(document), Some(runner)) => {
                let mut parameters = self.config.automation.parameters.clone();
                parameters.insert("NodeRole".to_string(), self.role.to_string());
                let fallback = LocalRun {
                    sequence: self,
                    deadline,
                };
                AutomationExecutor::new(runner.as_ref(), self.deps.store.as_ref(), &self.paths, clock)
                    .interval(self.config.automation.poll_interval())
                    .deadline(deadline)
                    .execute(document, &parameters, &fallback)
                    .await
            }
            _ => match self.run_local(deadline).await {
                Ok(()) => BootVerdict::success(),
                Err(e) => BootVerdict::failure(e.to_string()),
            },
        };

        reporter.report(&verdict).await;
        verdict
    }

    /// The local step list for this role.
    pub async fn run_local(&self, deadline: Deadline) -> Result<(), BootError> {
        let clock = self.deps.clock.as_ref();
        let store = self.deps.store.as_ref();
        let boot = &self.config.boot;
        // A control plane that already exists also renews certificates.
        let total = if !self.role.is_control_plane() {
            3
        } else if boot.admin_conf.exists() {
            7
        } else {
            6
        };
        let mut steps = StepRunner::new(&boot.status_file, self.role.as_str(), total)
            .publish_to(store, self.paths.step_status());

        deadline.check(clock)?;
        let metadata = self.deps.metadata.as_ref();
        let gate = GoldenImageGate::new(store, &self.paths, &boot.state_dir);
        let gate = &gate;
        let decision = steps
            .run("golden-image-gate", Marker::None, move || async move {
                let image_id = metadata.image_id().await?;
                let decision = gate.evaluate(&image_id).await?;
                Ok::<_, BootError>(decision)
            })
            .await?;
        let install_path = decision.map(|d| d.path).unwrap_or(InstallPath::FullInstall);

        deadline.check(clock)?;
        match install_path {
            InstallPath::PreBaked => {
                let validator = &self.deps.validator;
                steps
                    .run("validate-image", Marker::None, move || async move {
                        let report = validator.validate();
                        if !report.is_ok() {
                            return Err(BootError::ValidationFailed(report.summary()));
                        }
                        Ok(())
                    })
                    .await?;
            }
            InstallPath::FullInstall => {
                let installer = &self.deps.installer;
                steps
                    .run(
                        "install-packages",
                        Marker::Touch(boot.state_dir.join(INSTALLED_MARKER)),
                        move || async move {
                            installer.install().await?;
                            Ok::<_, BootError>(())
                        },
                    )
                    .await?;
            }
        }

        if self.role.is_control_plane() {
            self.control_plane_steps(&mut steps, deadline).await
        } else {
            self.worker_steps(&mut steps, deadline).await
        }
    }

    async fn control_plane_steps(
        &self,
        steps: &mut StepRunner<'_>,
        deadline: Deadline,
    ) -> Result<(), BootError> {
        let clock = self.deps.clock.as_ref();
        let boot = &self.config.boot;
        let metadata = self.deps.metadata.as_ref();
        let control_plane = self.deps.control_plane.as_ref();
        let private_ip = metadata.local_ipv4().await?;
        let public_ip = metadata.public_ipv4().await?;
        let endpoint = ControlPlaneEndpoint::new(&private_ip, ControlPlaneEndpoint::DEFAULT_PORT);
        let extra_sans: Vec<String> = public_ip.iter().cloned().collect();

        deadline.check(clock)?;
        let (endpoint_ref, sans) = (&endpoint, &extra_sans);
        let initialized = steps
            .run(
                "init-control-plane",
                Marker::Produced(boot.admin_conf.clone()),
                move || async move {
                    control_plane.init(endpoint_ref, sans).await?;
                    if !control_plane.wait_ready(clock).await {
                        warn!("Continuing before the API server answered");
                    }
                    Ok::<_, BootError>(())
                },
            )
            .await?;
        if initialized.is_none() {
            deadline.check(clock)?;
            steps
                .run("renew-certificates", Marker::None, move || async move {
                    if let Err(e) = control_plane.renew_certificates().await {
                        warn!(error = %format!("{:#}", e), "Certificate renewal failed");
                    }
                    Ok::<_, BootError>(())
                })
                .await?;
        }

        deadline.check(clock)?;
        steps
            .run("configure-kubectl", Marker::None, move || async move {
                control_plane.configure_kubectl().await?;
                Ok::<_, BootError>(())
            })
            .await?;

        deadline.check(clock)?;
        let publisher = JoinPublisher::new(self.deps.store.as_ref(), &self.paths, clock);
        let publisher = &publisher;
        steps
            .run(
                "publish-join-materials",
                Marker::Touch(boot.state_dir.join(PUBLISHED_MARKER)),
                move || async move {
                    // The floating address may have been attached while init ran.
                    let floating_address = metadata.public_ipv4().await?.or(public_ip);
                    let records = ControlPlaneRecords {
                        instance_id: metadata.instance_id().await?,
                        floating_address,
                    };
                    let generation = publisher.rotate(control_plane, endpoint, &records).await?;
                    info!(generation = %generation, "Join materials published");
                    Ok::<_, BootError>(())
                },
            )
            .await?;

        deadline.check(clock)?;
        steps
            .run("verify-cluster", Marker::None, move || async move {
                match control_plane.verify().await {
                    Ok(health) => {
                        let warnings = health.warnings();
                        if warnings.is_empty() {
                            info!("Post-boot checks passed");
                        } else {
                            warn!(warnings = ?warnings, "Post-boot checks completed with warnings");
                        }
                    }
                    Err(e) => warn!(error = %format!("{:#}", e), "Post-boot checks could not run"),
                }
                Ok::<_, BootError>(())
            })
            .await?;
        Ok(())
    }

    async fn worker_steps(
        &self,
        steps: &mut StepRunner<'_>,
        deadline: Deadline,
    ) -> Result<(), BootError> {
        let clock = self.deps.clock.as_ref();
        let join = &self.config.join;
        let consumer = JoinConsumer::new(self.deps.store.as_ref(), &self.paths, clock)
            .max_attempts(join.max_attempts)
            .interval(join.retry_interval())
            .deadline(deadline);
        let consumer = &consumer;
        let joiner = self.deps.joiner.as_ref();
        let role = self.role;

        deadline.check(clock)?;
        steps
            .run(
                "join-cluster",
                Marker::Produced(join.kubelet_conf.clone()),
                move || async move {
                    let materials = consumer.fetch().await?;
                    joiner
                        .join(&materials, role)
                        .await
                        .map_err(|e| BootError::JoinFailed(format!("{:#}", e)))?;
                    joiner.wait_for_kubelet(clock).await;
                    Ok::<_, BootError>(())
                },
            )
            .await?;
        Ok(())
    }
}

struct LocalRun<'a> {
    sequence: &'a BootSequence,
    deadline: Deadline,
}

#[async_trait]
impl LocalBootstrap for LocalRun<'_> {
    async fn run_local(&self) -> Result<(), BootError> {
        self.sequence.run_local(self.deadline).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use nodeward_core::automation::{AutomationRun, RunId, RunStatus};
    use nodeward_core::clock::ManualClock;
    use nodeward_core::join::{CaFingerprint, JoinMaterials, JoinToken};
    use nodeward_store::memory::MemoryStore;
    use nodeward_store::PutOptions;

    use crate::automation::AutomationError;
    use crate::control_plane::ClusterHealth;
    use crate::metadata::StaticMetadata;
    use crate::signal::RecordingSink;
    use crate::steps::{StatusReport, StepState};
    use crate::validate::ImageRequirements;

    #[derive(Default)]
    struct FakeControlPlane {
        inits: Mutex<u32>,
        tokens: Mutex<Vec<String>>,
        renewals: Mutex<u32>,
        kubectl_setups: Mutex<u32>,
        verifications: Mutex<u32>,
    }

    #[async_trait]
    impl ControlPlane for FakeControlPlane {
        async fn init(&self, _: &ControlPlaneEndpoint, _: &[String]) -> anyhow::Result<()> {
            *self.inits.lock().unwrap() += 1;
            Ok(())
        }

        async fn register_token(&self, token: &JoinToken) -> anyhow::Result<()> {
            self.tokens.lock().unwrap().push(token.expose().to_string());
            Ok(())
        }

        async fn ca_fingerprint(&self) -> anyhow::Result<CaFingerprint> {
            Ok("sha256:xyz".parse()?)
        }

        async fn renew_certificates(&self) -> anyhow::Result<()> {
            *self.renewals.lock().unwrap() += 1;
            anyhow::bail!("kubeadm certs renew exited 1")
        }

        async fn configure_kubectl(&self) -> anyhow::Result<()> {
            *self.kubectl_setups.lock().unwrap() += 1;
            Ok(())
        }

        async fn verify(&self) -> anyhow::Result<ClusterHealth> {
            *self.verifications.lock().unwrap() += 1;
            Ok(ClusterHealth {
                node_ready: false,
                namespaces: BTreeMap::new(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingJoin {
        joins: Mutex<Vec<JoinMaterials>>,
        kubelet_waits: Mutex<u32>,
        fail: bool,
    }

    #[async_trait]
    impl JoinExecutor for RecordingJoin {
        async fn join(&self, materials: &JoinMaterials, _: NodeRole) -> anyhow::Result<()> {
            self.joins.lock().unwrap().push(materials.clone());
            if self.fail {
                anyhow::bail!("kubeadm join exited 1");
            }
            Ok(())
        }

        async fn wait_for_kubelet(&self, _: &dyn Clock) -> bool {
            *self.kubelet_waits.lock().unwrap() += 1;
            false
        }
    }

    /// Reports a different public address once the floating address is
    /// attached, after the first read.
    struct ReassociatedMetadata {
        inner: StaticMetadata,
        public_reads: Mutex<u32>,
    }

    #[async_trait]
    impl InstanceMetadata for ReassociatedMetadata {
        async fn get(&self, path: &str) -> anyhow::Result<Option<String>> {
            if path == "public-ipv4" {
                let mut reads = self.public_reads.lock().unwrap();
                *reads += 1;
                if *reads > 1 {
                    return Ok(Some("198.51.100.7".to_string()));
                }
            }
            self.inner.get(path).await
        }
    }

    fn stock_metadata() -> StaticMetadata {
        StaticMetadata::new()
            .with("instance-id", "i-1")
            .with("ami-id", "ami-stock")
            .with("local-ipv4", "10.0.0.5")
            .with("public-ipv4", "203.0.113.10")
    }

    fn step_states(status_file: &std::path::Path) -> Vec<(String, StepState)> {
        let report: StatusReport =
            serde_json::from_str(&std::fs::read_to_string(status_file).unwrap()).unwrap();
        report
            .steps
            .into_iter()
            .map(|s| (s.step_name, s.status))
            .collect()
    }

    struct Harness {
        _dir: tempfile::TempDir,
        config: NodewardConfig,
        store: Arc<MemoryStore>,
        control_plane: Arc<FakeControlPlane>,
        joiner: Arc<RecordingJoin>,
        clock: Arc<ManualClock>,
        sink: Arc<RecordingSink>,
    }

    impl Harness {
        fn new(join_fails: bool) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut config = NodewardConfig::parse(
                r#"
[cluster]
name = "k8s"
environment = "development"

[store]
backend = "memory"

[join]
max_attempts = 3
retry_interval_secs = 1

[boot]
install_script = "true"
"#,
            )
            .unwrap();
            config.boot.state_dir = dir.path().join("state");
            config.boot.status_file = dir.path().join("bootstrap-status.json");
            config.boot.admin_conf = dir.path().join("admin.conf");
            config.join.kubelet_conf = dir.path().join("kubelet.conf");
            Self {
                _dir: dir,
                config,
                store: Arc::new(MemoryStore::new()),
                control_plane: Arc::new(FakeControlPlane::default()),
                joiner: Arc::new(RecordingJoin {
                    fail: join_fails,
                    ..RecordingJoin::default()
                }),
                clock: Arc::new(ManualClock::new()),
                sink: Arc::new(RecordingSink::new()),
            }
        }

        fn sequence(&self, role: NodeRole, automation: Option<Arc<dyn AutomationRunner>>) -> BootSequence {
            self.sequence_with(role, automation, Arc::new(stock_metadata()))
        }

        fn sequence_with(
            &self,
            role: NodeRole,
            automation: Option<Arc<dyn AutomationRunner>>,
            metadata: Arc<dyn InstanceMetadata>,
        ) -> BootSequence {
            let deps = BootDeps {
                store: self.store.clone(),
                metadata,
                control_plane: self.control_plane.clone(),
                joiner: self.joiner.clone(),
                automation,
                clock: self.clock.clone(),
                installer: PackageInstaller::new(Some("true"), "1.35.1"),
                validator: ImageValidator::new(ImageRequirements::default()),
            };
            BootSequence::new(role, self.config.clone(), deps).unwrap()
        }

        fn reporter(&self) -> BootSignalReporter {
            BootSignalReporter::new(self.sink.clone())
        }
    }

    #[tokio::test]
    async fn test_control_plane_then_worker() {
        let h = Harness::new(false);

        let cp = h.sequence(NodeRole::ControlPlane, None);
        assert_eq!(cp.run(h.reporter()).await, BootVerdict::success());
        assert_eq!(*h.control_plane.inits.lock().unwrap(), 1);

        let worker = h.sequence(NodeRole::ApplicationWorker, None);
        assert_eq!(worker.run(h.reporter()).await, BootVerdict::success());

        let joins = h.joiner.joins.lock().unwrap().clone();
        assert_eq!(joins.len(), 1);
        let token = h.control_plane.tokens.lock().unwrap()[0].clone();
        assert_eq!(joins[0].token.expose(), token);
        assert_eq!(joins[0].endpoint.to_string(), "10.0.0.5:6443");
        assert_eq!(h.sink.signals().len(), 2);

        assert_eq!(*h.control_plane.kubectl_setups.lock().unwrap(), 1);
        // Verification warnings and a slow kubelet do not fail the boot.
        assert_eq!(*h.control_plane.verifications.lock().unwrap(), 1);
        assert_eq!(*h.joiner.kubelet_waits.lock().unwrap(), 1);
        assert_eq!(*h.control_plane.renewals.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_worker_without_materials_fails_once() {
        let h = Harness::new(false);
        let verdict = h
            .sequence(NodeRole::MonitoringWorker, None)
            .run(h.reporter())
            .await;
        assert!(!verdict.success);
        assert!(verdict.reason.as_deref().unwrap().contains("join materials not found"));
        assert!(h.joiner.joins.lock().unwrap().is_empty());
        assert_eq!(h.sink.signals(), vec![verdict]);
    }

    #[tokio::test]
    async fn test_failed_join_is_not_retried() {
        let h = Harness::new(true);
        h.sequence(NodeRole::ControlPlane, None).run(h.reporter()).await;

        let verdict = h
            .sequence(NodeRole::ApplicationWorker, None)
            .run(h.reporter())
            .await;
        assert!(!verdict.success);
        assert!(verdict.reason.unwrap().contains("kubeadm join exited 1"));
        assert_eq!(h.joiner.joins.lock().unwrap().len(), 1);
        assert_eq!(*h.joiner.kubelet_waits.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pre_baked_image_is_validated_not_installed() {
        let h = Harness::new(false);
        h.store
            .put(
                &h.config.paths().unwrap().golden_image_baseline(),
                "ami-parent",
                PutOptions::plain(),
            )
            .await
            .unwrap();
        let mut seq = h.sequence(NodeRole::ControlPlane, None);
        seq.deps.validator = ImageValidator::new(ImageRequirements {
            binaries: vec!["definitely-not-installed-binary".into()],
            kernel_modules: Vec::new(),
            sysctls: Vec::new(),
        });

        let verdict = seq.run(h.reporter()).await;
        assert!(!verdict.success);
        assert!(verdict.reason.unwrap().contains("definitely-not-installed-binary"));
        assert_eq!(*h.control_plane.inits.lock().unwrap(), 0);
        assert!(!h.config.boot.state_dir.join(INSTALLED_MARKER).exists());
    }

    #[tokio::test]
    async fn test_rerun_skips_completed_steps() {
        let h = Harness::new(false);
        h.sequence(NodeRole::ControlPlane, None).run(h.reporter()).await;
        std::fs::write(&h.config.boot.admin_conf, "").unwrap();

        let verdict = h.sequence(NodeRole::ControlPlane, None).run(h.reporter()).await;
        assert_eq!(verdict, BootVerdict::success());
        assert_eq!(*h.control_plane.inits.lock().unwrap(), 1);
        assert_eq!(h.control_plane.tokens.lock().unwrap().len(), 1);

        // The second run does maintenance instead of init; a failed
        // renewal is logged and the boot still succeeds.
        assert_eq!(*h.control_plane.renewals.lock().unwrap(), 1);
        assert_eq!(*h.control_plane.kubectl_setups.lock().unwrap(), 2);
        let states = step_states(&h.config.boot.status_file);
        assert!(states.contains(&("init-control-plane".to_string(), StepState::Skipped)));
        assert!(states.contains(&("renew-certificates".to_string(), StepState::Success)));
        assert!(states.contains(&("publish-join-materials".to_string(), StepState::Skipped)));
    }

    #[tokio::test]
    async fn test_floating_address_is_read_again_before_publishing() {
        let h = Harness::new(false);
        let metadata = Arc::new(ReassociatedMetadata {
            inner: stock_metadata(),
            public_reads: Mutex::new(0),
        });
        let verdict = h
            .sequence_with(NodeRole::ControlPlane, None, metadata)
            .run(h.reporter())
            .await;
        assert_eq!(verdict, BootVerdict::success());
        let paths = h.config.paths().unwrap();
        assert_eq!(h.store.get(&paths.floating_address()).await.unwrap(), "198.51.100.7");
    }

    struct UnpublishedDocument;

    #[async_trait]
    impl AutomationRunner for UnpublishedDocument {
        async fn start(
            &self,
            name: &str,
            _: &BTreeMap<String, String>,
        ) -> Result<RunId, AutomationError> {
            Err(AutomationError::DefinitionNotFound(name.to_string()))
        }

        async fn get_status(&self, run_id: &RunId) -> Result<AutomationRun, AutomationError> {
            Ok(AutomationRun {
                run_id: run_id.clone(),
                status: RunStatus::Failed,
                step_failures: Vec::new(),
            })
        }
    }

    #[tokio::test]
    async fn test_automation_falls_back_to_local_steps() {
        let mut h = Harness::new(false);
        h.config.automation.document = Some("k8s-bootstrap-control-plane".into());
        let seq = h.sequence(NodeRole::ControlPlane, Some(Arc::new(UnpublishedDocument)));
        assert_eq!(seq.plan()[0].name, "automation");

        let verdict = seq.run(h.reporter()).await;
        assert_eq!(verdict, BootVerdict::success());
        assert_eq!(*h.control_plane.inits.lock().unwrap(), 1);
        assert_eq!(h.sink.signals().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_deadline_fails_before_any_step() {
        let mut h = Harness::new(false);
        h.config.boot.deadline_secs = 0;
        let verdict = h
            .sequence(NodeRole::ApplicationWorker, None)
            .run(h.reporter())
            .await;
        assert!(!verdict.success);
        assert!(verdict.reason.unwrap().contains("deadline exceeded"));
        assert!(!h.config.boot.status_file.exists());
    }

    #[test]
    fn test_plan_per_role() {
        let h = Harness::new(false);
        let names = |role| {
            h.sequence(role, None)
                .plan()
                .iter()
                .map(|s| s.name)
                .collect::<Vec<_>>()
        };
        assert_eq!(
            names(NodeRole::ControlPlane),
            vec![
                "golden-image-gate",
                "prepare-image",
                "init-control-plane",
                "configure-kubectl",
                "publish-join-materials",
                "verify-cluster"
            ]
        );
        assert_eq!(
            names(NodeRole::ApplicationWorker),
            vec!["golden-image-gate", "prepare-image", "join-cluster"]
        );
    }
}
