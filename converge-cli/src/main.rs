use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use converge_core::{
    AgentPackage, CommandSpec, Mutation, Platform, PlannedMutation, PolicyTable, Reconciler,
    ReconcilerConfig, Removal, ResourceConfig, RuleTypePolicy, SubResourceKind,
    normalize_desired,
};
use tabled::{Table, Tabled};
use tokio::process::Command;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod file_remote;

use file_remote::FileRemote;

#[derive(Parser)]
#[command(name = "converge")]
#[command(about = "Converge resources to declared configuration", long_about = None)]
struct Cli {
    /// Directory holding the file-backed remote state (default: platform state dir)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Deadline for each remote call, in seconds
    #[arg(long, default_value = "30", global = true)]
    timeout_secs: u64,

    /// JSON document with per-kind policy overrides
    #[arg(long, global = true)]
    policies: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Converge a resource to a desired-state document
    Apply {
        /// Path to the desired-state document
        file: PathBuf,
    },

    /// Show the mutations `apply` would issue, without issuing them
    Plan {
        /// Path to the desired-state document
        file: PathBuf,
    },

    /// Remove a resource, or only some of its sub-resources
    Remove {
        /// Resource name
        resource: String,

        /// Sub-resource kinds to clear (comma separated); the resource itself when omitted
        #[arg(long, value_delimiter = ',')]
        kinds: Vec<SubResourceKind>,

        /// Delete the resource even if it still holds sub-resources
        #[arg(long)]
        force: bool,
    },

    /// Show the observed state of a resource
    Show {
        /// Resource name
        resource: String,

        /// Kinds to fetch (comma separated, default: all)
        #[arg(long, value_delimiter = ',')]
        kinds: Vec<SubResourceKind>,
    },

    /// Show platform details and manage agent packages
    Platform {
        /// Override the detected platform
        #[arg(long)]
        platform: Option<Platform>,

        #[command(subcommand)]
        action: Option<PlatformAction>,
    },
}

#[derive(Subcommand)]
enum PlatformAction {
    /// Install an agent package
    Install {
        /// Package name
        name: String,

        /// Installer download URL
        installer_url: String,

        /// Install location (default: platform specific)
        #[arg(long)]
        install_dir: Option<PathBuf>,

        /// Run the steps instead of printing them
        #[arg(long)]
        execute: bool,
    },

    /// Uninstall an agent package
    Uninstall {
        /// Package name
        name: String,

        /// Install location (default: platform specific)
        #[arg(long)]
        install_dir: Option<PathBuf>,

        /// Run the steps instead of printing them
        #[arg(long)]
        execute: bool,
    },
}

#[derive(Tabled)]
struct MutationRow {
    #[tabled(rename = "KIND")]
    kind: String,
    #[tabled(rename = "OPERATION")]
    op: String,
    #[tabled(rename = "DETAIL")]
    detail: String,
}

impl From<&PlannedMutation> for MutationRow {
    fn from(planned: &PlannedMutation) -> Self {
        Self {
            kind: planned.kind.to_string(),
            op: planned.mutation.name().to_string(),
            detail: describe(&planned.mutation),
        }
    }
}

fn describe(mutation: &Mutation) -> String {
    match mutation {
        Mutation::DeleteResource { force } => format!("force={}", force),
        Mutation::SetVersioning { status } => format!("{:?}", status),
        Mutation::SetRequesterPays { enabled } => format!("enabled={}", enabled),
        Mutation::PutTags { tags } => tags
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(","),
        Mutation::ReplaceRules { rules } => format!("{} rule(s)", rules.len()),
        Mutation::PutRule { replaces, .. } if replaces.is_some() => "replace 1 rule".to_string(),
        Mutation::PutRule { .. } => "add 1 rule".to_string(),
        Mutation::DeleteRule { .. } => "remove 1 rule".to_string(),
        Mutation::PutWebsite { config } => serde_json::to_string(config).unwrap_or_default(),
        Mutation::PutDhcpOptions { options } => serde_json::to_string(options).unwrap_or_default(),
        Mutation::PutLogging { config } => {
            format!("{}/{}", config.target_bucket, config.target_prefix)
        }
        Mutation::AttachPolicy { arn } | Mutation::DetachPolicy { arn } => arn.clone(),
        _ => "-".to_string(),
    }
}

fn print_mutations(mutations: &[PlannedMutation]) {
    if mutations.is_empty() {
        println!("No changes");
        return;
    }
    let rows: Vec<MutationRow> = mutations.iter().map(MutationRow::from).collect();
    println!("{}", Table::new(rows));
}

fn load_desired(path: &Path) -> Result<converge_core::DesiredState> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config: ResourceConfig = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    normalize_desired(&config).with_context(|| format!("Invalid configuration in {}", path.display()))
}

fn load_policies(path: Option<&Path>) -> Result<PolicyTable> {
    let Some(path) = path else {
        return Ok(PolicyTable::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let overrides: BTreeMap<SubResourceKind, RuleTypePolicy> = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    PolicyTable::default()
        .with_overrides(overrides)
        .context("Invalid policy overrides")
}

async fn run_steps(steps: &[CommandSpec], execute: bool) -> Result<()> {
    if steps.is_empty() {
        println!("Nothing to do");
        return Ok(());
    }
    for step in steps {
        if !execute {
            println!("{}", step);
            continue;
        }
        info!(command = %step, "Running");
        let output = Command::new(&step.program)
            .args(&step.args)
            .output()
            .await
            .with_context(|| format!("Failed to start {}", step.program))?;
        if !output.status.success() {
            bail!(
                "{} failed: {}",
                step,
                String::from_utf8_lossy(&output.stderr)
            );
        }
    }
    Ok(())
}

async fn platform_command(platform: Option<Platform>, action: Option<PlatformAction>) -> Result<()> {
    let ops = platform.unwrap_or_else(Platform::detect).ops();
    match action {
        None => {
            println!("platform:  {}", ops.platform());
            println!("state dir: {}", ops.default_state_dir().display());
            Ok(())
        }
        Some(PlatformAction::Install {
            name,
            installer_url,
            install_dir,
            execute,
        }) => {
            let package = AgentPackage {
                install_dir,
                ..AgentPackage::new(name, installer_url)
            };
            run_steps(&ops.install_steps(&package), execute).await
        }
        Some(PlatformAction::Uninstall {
            name,
            install_dir,
            execute,
        }) => {
            let package = AgentPackage {
                install_dir,
                ..AgentPackage::new(name, String::new())
            };
            run_steps(&ops.uninstall_steps(&package), execute).await
        }
    }
}

fn build_reconciler(
    state_dir: Option<PathBuf>,
    policies: Option<&Path>,
    timeout_secs: u64,
) -> Result<Reconciler> {
    let state_dir = state_dir.unwrap_or_else(|| Platform::detect().ops().default_state_dir());
    let policies = load_policies(policies)?;
    info!(state_dir = %state_dir.display(), "Using file-backed remote");
    let remote = Arc::new(FileRemote::new(state_dir));
    Ok(
        Reconciler::new(remote.clone(), remote, policies).with_config(ReconcilerConfig {
            call_timeout: Duration::from_secs(timeout_secs),
        }),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "converge=info,converge_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let Cli {
        state_dir,
        timeout_secs,
        policies,
        json,
        command,
    } = Cli::parse();
    let reconciler = || build_reconciler(state_dir.clone(), policies.as_deref(), timeout_secs);

    match command {
        Commands::Apply { file } => {
            let desired = load_desired(&file)?;
            let outcome = reconciler()?
                .reconcile(&desired)
                .await
                .with_context(|| format!("Failed to apply {}", file.display()))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome.final_state)?);
            } else {
                print_mutations(&outcome.mutations);
                println!("changed: {}", outcome.changed);
            }
        }

        Commands::Plan { file } => {
            let desired = load_desired(&file)?;
            let (_, plan, mutations) = reconciler()?
                .plan(&desired)
                .await
                .with_context(|| format!("Failed to plan {}", file.display()))?;
            if json {
                let ops: Vec<_> = mutations
                    .iter()
                    .map(|m| serde_json::json!({ "kind": m.kind, "mutation": m.mutation }))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&ops)?);
            } else {
                print_mutations(&mutations);
                println!("changed: {}", plan.changed());
            }
        }

        Commands::Remove {
            resource,
            kinds,
            force,
        } => {
            let removal = if kinds.is_empty() {
                Removal::Resource { force }
            } else {
                Removal::SubResources(kinds)
            };
            let outcome = reconciler()?
                .remove(&resource, &removal)
                .await
                .with_context(|| format!("Failed to remove {}", resource))?;
            print_mutations(&outcome.mutations);
            println!("changed: {}", outcome.changed);
        }

        Commands::Show { resource, kinds } => {
            let kinds = if kinds.is_empty() {
                SubResourceKind::ALL.to_vec()
            } else {
                kinds
            };
            let state = reconciler()?
                .observe(&resource, &kinds)
                .await
                .with_context(|| format!("Failed to read {}", resource))?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }

        Commands::Platform { platform, action } => platform_command(platform, action).await?,
    }

    Ok(())
}
