use std::io::Read;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};

use crate::logging::{self, LogFormat};
use crate::ui;

use nodeward_agent::boot::{BootDeps, BootSequence};
use nodeward_agent::consumer::JoinConsumer;
use nodeward_agent::control_plane::{ControlPlane, KubeadmControlPlane};
use nodeward_agent::gate::GoldenImageGate;
use nodeward_agent::install::PackageInstaller;
use nodeward_agent::join::{JoinExecutor, KubeadmJoin};
use nodeward_agent::metadata::{Imds, InstanceMetadata};
use nodeward_agent::publisher::{ControlPlaneRecords, JoinPublisher};
use nodeward_agent::signal::{BootSignalReporter, BootSignalSink, BootVerdict, CfnSignalSink, LogSink};
use nodeward_agent::ssm_runner::SsmAutomationRunner;
use nodeward_agent::validate::ImageValidator;
use nodeward_core::clock::{Clock, Deadline, SystemClock};
use nodeward_core::config::NodewardConfig;
use nodeward_core::join::ControlPlaneEndpoint;
use nodeward_core::role::NodeRole;
use nodeward_failover::ec2::Ec2Provider;
use nodeward_failover::server::{self, Reply};
use nodeward_failover::{FailoverController, TerminationEvent};
use nodeward_store::{CoordinationStore, PutOptions};

#[derive(Parser)]
#[command(
    name = "nodeward",
    version,
    about = "Cluster node bootstrap and floating-IP failover orchestrator"
)]
struct Cli {
    /// Config file (default: $NODEWARD_CONFIG or /etc/nodeward/nodeward.toml)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot this node: gate, prepare, join or initialize, then signal
    Boot {
        /// control-plane, monitoring-worker or application-worker
        #[arg(long)]
        role: String,
        /// Print the step plan without running anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Publish join materials from the control plane
    Publish {
        /// Generate and publish a new token even if current materials exist
        #[arg(long)]
        rotate: bool,
    },
    /// Wait for join materials and join the cluster
    Join {
        #[arg(long)]
        role: String,
    },
    /// Decide and print the install path for the booted image
    Gate,
    /// Send a boot signal by hand
    Signal {
        #[arg(long, conflicts_with = "failure", required_unless_present = "failure")]
        success: bool,
        #[arg(long)]
        failure: bool,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Remote automation runs
    Automation {
        #[command(subcommand)]
        action: AutomationCmd,
    },
    /// Floating address failover
    Failover {
        #[command(subcommand)]
        action: FailoverCmd,
    },
    /// Read and write the coordination store
    Store {
        #[command(subcommand)]
        action: StoreCmd,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum AutomationCmd {
    /// Run an automation document, falling back to local boot if it is missing
    Run {
        document: String,
        #[arg(long)]
        role: String,
    },
}

#[derive(Subcommand)]
enum FailoverCmd {
    /// Handle one termination event from a file, or stdin when omitted
    Handle { event: Option<PathBuf> },
    /// Listen for newline-delimited termination events
    Serve {
        /// Override [failover].listen
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
}

#[derive(Subcommand)]
enum StoreCmd {
    Get {
        path: String,
    },
    Put {
        path: String,
        value: String,
        /// Store as an encrypted value
        #[arg(long)]
        secure: bool,
    },
    /// List every entry under a prefix (default: this cluster's prefix)
    List {
        prefix: Option<String>,
    },
}

/// Clap command tree, for completions and man pages.
pub fn command() -> clap::Command {
    Cli::command()
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let log_format = match &cli.command {
        Commands::Boot { dry_run: false, .. }
        | Commands::Automation { .. }
        | Commands::Failover {
            action: FailoverCmd::Serve { .. },
        } => LogFormat::Json,
        _ => LogFormat::Human,
    };
    logging::init(log_format);

    if let Commands::Completions { shell } = cli.command {
        return cmd_completions(shell);
    }

    let config = NodewardConfig::load(cli.config.as_deref())?;
    match cli.command {
        Commands::Boot { role, dry_run } => block_on(cmd_boot(&config, &role, dry_run, None)),
        Commands::Publish { rotate } => block_on(cmd_publish(&config, rotate)),
        Commands::Join { role } => block_on(cmd_join(&config, &role)),
        Commands::Gate => block_on(cmd_gate(&config)),
        Commands::Signal {
            success,
            failure: _,
            reason,
        } => block_on(cmd_signal(&config, success, reason)),
        Commands::Automation {
            action: AutomationCmd::Run { document, role },
        } => block_on(cmd_boot(&config, &role, false, Some(document))),
        Commands::Failover { action } => block_on(cmd_failover(&config, action)),
        Commands::Store { action } => block_on(cmd_store(&config, action)),
        Commands::Completions { .. } => Ok(()),
    }
}

fn block_on<F, T>(f: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .with_context(|| "Failed to create tokio runtime")?;
    runtime.block_on(f)
}

fn cmd_completions(shell: clap_complete::Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "nodeward", &mut std::io::stdout());
    Ok(())
}

fn signal_sink(config: &NodewardConfig) -> Arc<dyn BootSignalSink> {
    match (&config.boot.signal.stack, &config.boot.signal.resource) {
        (Some(stack), Some(resource)) => {
            Arc::new(CfnSignalSink::new(stack, resource, &config.cluster.region))
        }
        _ => Arc::new(LogSink),
    }
}

fn control_plane(config: &NodewardConfig) -> KubeadmControlPlane {
    let boot = &config.boot;
    KubeadmControlPlane::new(&boot.admin_conf, &boot.k8s_version, &boot.pod_cidr, &boot.service_cidr)
}

async fn boot_deps(config: &NodewardConfig, with_automation: bool) -> Result<BootDeps> {
    Ok(BootDeps {
        store: nodeward_store::open(config).await?,
        metadata: Arc::new(Imds::new()?),
        control_plane: Arc::new(control_plane(config)),
        joiner: Arc::new(KubeadmJoin::new(config.join.join_timeout())),
        automation: if with_automation {
            Some(Arc::new(SsmAutomationRunner::new(&config.cluster.region)))
        } else {
            None
        },
        clock: Arc::new(SystemClock::new()),
        installer: PackageInstaller::new(config.boot.install_script.as_deref(), &config.boot.k8s_version),
        validator: ImageValidator::default(),
    })
}

async fn cmd_boot(
    config: &NodewardConfig,
    role: &str,
    dry_run: bool,
    document: Option<String>,
) -> Result<()> {
    let mut config = config.clone();
    if document.is_some() {
        config.automation.document = document;
    }
    if dry_run {
        return print_boot_plan(role.parse()?, config);
    }

    // Anything that stops the sequence from starting still owes the
    // provisioning layer a failure signal.
    let reporter = BootSignalReporter::new(signal_sink(&config));
    let sequence = match prepare_boot(role, config).await {
        Ok(sequence) => sequence,
        Err(e) => {
            let reason = format!("{:#}", e);
            reporter.report(&BootVerdict::failure(&reason)).await;
            ui::error(&format!("Boot failed: {}", reason));
            return Err(e.context("boot aborted before the first step"));
        }
    };
    finish(sequence.run(reporter).await)
}

async fn prepare_boot(role: &str, config: NodewardConfig) -> Result<BootSequence> {
    let role: NodeRole = role.parse()?;
    let with_automation = config.automation.document.is_some();
    let deps = boot_deps(&config, with_automation).await?;
    BootSequence::new(role, config, deps)
}

fn print_boot_plan(role: NodeRole, config: NodewardConfig) -> Result<()> {
    let store: Arc<dyn CoordinationStore> = Arc::new(nodeward_store::memory::MemoryStore::new());
    let deps = BootDeps {
        store,
        metadata: Arc::new(Imds::new()?),
        control_plane: Arc::new(control_plane(&config)),
        joiner: Arc::new(KubeadmJoin::new(config.join.join_timeout())),
        automation: None,
        clock: Arc::new(SystemClock::new()),
        installer: PackageInstaller::new(None, &config.boot.k8s_version),
        validator: ImageValidator::default(),
    };
    let plan = BootSequence::new(role, config, deps)?.plan();
    ui::info(&format!("Boot plan for {}", role));
    for (i, step) in plan.iter().enumerate() {
        ui::step(i + 1, plan.len(), &format!("{} ({})", step.name, step.detail));
    }
    Ok(())
}

fn finish(verdict: BootVerdict) -> Result<()> {
    if verdict.success {
        ui::success("Boot succeeded");
        Ok(())
    } else {
        let reason = verdict.reason.unwrap_or_default();
        ui::error(&format!("Boot failed: {}", reason));
        anyhow::bail!("boot failed: {}", reason)
    }
}

async fn cmd_publish(config: &NodewardConfig, rotate: bool) -> Result<()> {
    let paths = config.paths()?;
    let store = nodeward_store::open(config).await?;
    let clock = SystemClock::new();
    let publisher = JoinPublisher::new(store.as_ref(), &paths, &clock);

    if !rotate && let Some(current) = publisher.current().await? {
        ui::info(&format!(
            "Join materials already published for {} (use --rotate for a new token)",
            current.endpoint
        ));
        return Ok(());
    }

    let metadata = Imds::new()?;
    let endpoint = ControlPlaneEndpoint::new(
        &metadata.local_ipv4().await?,
        ControlPlaneEndpoint::DEFAULT_PORT,
    );
    let records = ControlPlaneRecords {
        instance_id: metadata.instance_id().await?,
        floating_address: metadata.public_ipv4().await?,
    };
    let cp = control_plane(config);
    let generation = publisher.rotate(&cp as &dyn ControlPlane, endpoint, &records).await?;
    ui::success(&format!("Published join materials generation {}", generation));
    Ok(())
}

async fn cmd_join(config: &NodewardConfig, role: &str) -> Result<()> {
    let role: NodeRole = role.parse()?;
    let paths = config.paths()?;
    let store = nodeward_store::open(config).await?;
    let clock = SystemClock::new();
    let deadline = Deadline::after(&clock as &dyn Clock, config.boot.deadline());

    let materials = JoinConsumer::new(store.as_ref(), &paths, &clock)
        .max_attempts(config.join.max_attempts)
        .interval(config.join.retry_interval())
        .deadline(deadline)
        .fetch()
        .await?;
    ui::info(&format!("Joining {} as {}", materials.endpoint, role));
    KubeadmJoin::new(config.join.join_timeout())
        .join(&materials, role)
        .await?;
    ui::success("Joined the cluster");
    Ok(())
}

async fn cmd_gate(config: &NodewardConfig) -> Result<()> {
    let paths = config.paths()?;
    let store = nodeward_store::open(config).await?;
    let image_id = Imds::new()?.image_id().await?;
    let decision = GoldenImageGate::new(store.as_ref(), &paths, &config.boot.state_dir)
        .evaluate(&image_id)
        .await?;
    ui::field("Install path", &decision.path.to_string());
    ui::field("Image", &decision.image_id);
    ui::field("Baseline", decision.baseline.as_deref().unwrap_or("unknown"));
    ui::field("Decided at", &decision.decided_at);
    Ok(())
}

async fn cmd_signal(config: &NodewardConfig, success: bool, reason: Option<String>) -> Result<()> {
    let verdict = if success {
        BootVerdict::success()
    } else {
        BootVerdict::failure(reason.unwrap_or_else(|| "signalled by operator".to_string()))
    };
    let sink = signal_sink(config);
    sink.signal(&verdict)
        .await
        .with_context(|| format!("Failed to send boot signal via {}", sink.name()))?;
    ui::success(&format!("Boot signal sent via {}", sink.name()));
    Ok(())
}

fn failover_controller(config: &NodewardConfig, store: Arc<dyn CoordinationStore>) -> Result<FailoverController> {
    let failover = config.failover()?;
    let paths = config.paths()?;
    Ok(FailoverController::new(
        Arc::new(Ec2Provider::new(&config.cluster.region)),
        &failover.allocation_id,
        failover.membership_tag(),
    )
    .record_owner_to(store, paths.floating_address_owner()))
}

fn read_event(path: Option<&Path>) -> Result<String> {
    match path {
        Some(p) => std::fs::read_to_string(p)
            .with_context(|| format!("Failed to read event file {}", p.display())),
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .with_context(|| "Failed to read event from stdin")?;
            Ok(buf)
        }
    }
}

async fn cmd_failover(config: &NodewardConfig, action: FailoverCmd) -> Result<()> {
    match action {
        FailoverCmd::Handle { event } => {
            let raw = read_event(event.as_deref())?;
            let result = match TerminationEvent::parse(&raw) {
                Ok(event) => {
                    let store = nodeward_store::open(config).await?;
                    failover_controller(config, store)?.handle(&event).await
                }
                Err(e) => Err(e),
            };
            println!("{}", serde_json::to_string(&Reply::from_result(&result))?);
            result.map(|_| ()).map_err(anyhow::Error::from)
        }
        FailoverCmd::Serve { listen } => {
            let addr = match listen {
                Some(addr) => addr,
                None => config.failover()?.listen,
            };
            let store = nodeward_store::open(config).await?;
            server::serve(failover_controller(config, store)?, addr).await
        }
    }
}

async fn cmd_store(config: &NodewardConfig, action: StoreCmd) -> Result<()> {
    let store = nodeward_store::open(config).await?;
    match action {
        StoreCmd::Get { path } => {
            println!("{}", store.get(&path).await?);
        }
        StoreCmd::Put {
            path,
            value,
            secure,
        } => {
            let opts = if secure {
                PutOptions::secure()
            } else {
                PutOptions::plain()
            };
            store.put(&path, &value, opts).await?;
            ui::success(&format!("Wrote {}", path));
        }
        StoreCmd::List { prefix } => {
            let prefix = match prefix {
                Some(p) => p,
                None => config.paths()?.prefix().to_string(),
            };
            let entries = store.get_with_prefix(&prefix).await?;
            if entries.is_empty() {
                ui::warn(&format!("No entries under {}", prefix));
            }
            for entry in entries {
                ui::field(&entry.path, &entry.value);
            }
        }
    }
    Ok(())
}
