//! CF-040: CLI subcommands: validate, schema, render, plan, create, delete.
//!
//! No remote provider ships with the binary: `create` and `delete` run
//! against the in-memory simulation when `--simulate` is given and refuse
//! otherwise. The lock file under the state directory records what a
//! simulated run deployed, so `plan` and `delete` can pick it up later.

use crate::core::planner::{self, DesiredStack, StackAction};
use crate::core::state::{self, StackLock};
use crate::core::types::ClusterConfig;
use crate::core::parser;
use crate::error::{Error, Result};
use crate::provider::memory::MemoryProvider;
use crate::provider::{Stack, StackStatus};
use crate::stack::{self, Settings, StackManager, StackReport, CLUSTER_NAME_TAG, TEMPLATE_HASH_TAG};
use crate::tasks::{RetryPolicy, TaskContext};
use clap::Subcommand;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Poll delay of simulated stack waits.
const SIMULATED_POLL_DELAY: Duration = Duration::from_millis(200);

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate cluster.yaml without contacting any API
    Validate {
        /// Path to cluster.yaml
        #[arg(short, long, default_value = "cluster.yaml")]
        file: PathBuf,
    },

    /// Print the JSON schema of cluster.yaml
    Schema,

    /// Render every stack template into the state directory
    Render {
        #[arg(short, long, default_value = "cluster.yaml")]
        file: PathBuf,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Print the cluster stack template to stdout instead
        #[arg(long)]
        stdout: bool,
    },

    /// Show which stacks would be created, updated or deleted
    Plan {
        #[arg(short, long, default_value = "cluster.yaml")]
        file: PathBuf,

        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },

    /// Create or update every stack of the cluster
    Create {
        #[arg(short, long, default_value = "cluster.yaml")]
        file: PathBuf,

        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Delete every stack of the cluster, node pools first
    Delete {
        /// Cluster name
        #[arg(short, long)]
        name: String,

        /// Region of the cluster
        #[arg(short, long, default_value = "us-west-2")]
        region: String,

        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        #[command(flatten)]
        run: RunArgs,
    },
}

/// Flags shared by commands that drive stacks.
#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    /// Run against the in-memory simulated provider
    #[arg(long)]
    pub simulate: bool,

    /// Maximum time to wait for one stack, in minutes
    #[arg(long, default_value_t = 25)]
    pub wait_timeout: u64,

    /// Service role the provisioning API assumes
    #[arg(long)]
    pub role_arn: Option<String>,

    /// Keep failed resources for troubleshooting
    #[arg(long)]
    pub disable_rollback: bool,
}

impl RunArgs {
    fn settings(&self, region: &str) -> Settings {
        let mut settings =
            Settings::new(region).with_wait_timeout(Duration::from_secs(self.wait_timeout * 60));
        settings.role_arn = self.role_arn.clone();
        settings.disable_rollback = self.disable_rollback;
        if self.simulate {
            settings = settings.with_poll(RetryPolicy::fixed(SIMULATED_POLL_DELAY, 0));
        }
        settings
    }

    fn provider(&self, region: &str) -> Result<Arc<MemoryProvider>> {
        if !self.simulate {
            return Err(Error::invalid_config(
                "no provisioning API is configured; rerun with --simulate",
            ));
        }
        Ok(Arc::new(MemoryProvider::new(region)))
    }
}

/// Dispatch a CLI command.
pub async fn dispatch(cmd: Commands) -> Result<()> {
    match cmd {
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Schema => cmd_schema(),
        Commands::Render {
            file,
            state_dir,
            stdout,
        } => cmd_render(&file, &state_dir, stdout).await,
        Commands::Plan { file, state_dir } => cmd_plan(&file, &state_dir).await,
        Commands::Create {
            file,
            state_dir,
            run,
        } => cmd_create(&file, &state_dir, &run).await,
        Commands::Delete {
            name,
            region,
            state_dir,
            run,
        } => cmd_delete(&name, &region, &state_dir, &run).await,
    }
}

fn cmd_validate(file: &Path) -> Result<()> {
    let config = parser::parse_config_file(file)?;
    let errors = parser::validate_config(&config);

    if errors.is_empty() {
        println!(
            "OK: {} in {} ({} node pools, {} access entries)",
            config.metadata.name,
            config.metadata.region,
            config.node_pools().count(),
            config.access_entries.len()
        );
        Ok(())
    } else {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        Err(Error::invalid_config(format!("{} validation error(s)", errors.len())))
    }
}

fn cmd_schema() -> Result<()> {
    let schema = schemars::schema_for!(ClusterConfig);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

async fn cmd_render(file: &Path, state_dir: &Path, stdout: bool) -> Result<()> {
    let config = parser::load_config(file)?;
    let (templates, _) = stack::render_cluster(&config).await?;

    if stdout {
        let cluster_stack = stack::cluster_stack_name(&config.metadata.name);
        if let Some(t) = templates.iter().find(|t| t.stack == cluster_stack) {
            println!("{}", String::from_utf8_lossy(&t.template));
        }
        return Ok(());
    }

    for t in &templates {
        let path = state::save_template(state_dir, &config.metadata.name, &t.stack, &t.template)?;
        println!("  {} {} -> {}", t.hash, t.stack, path.display());
    }
    println!("Rendered {} stack(s).", templates.len());
    Ok(())
}

/// Stack name → recorded hash from the lock file.
fn locked_hashes(state_dir: &Path, cluster: &str) -> Result<BTreeMap<String, Option<String>>> {
    Ok(state::load_lock(state_dir, cluster)?
        .map(|lock| {
            lock.stacks
                .into_iter()
                .map(|(name, s)| (name, Some(s.hash)))
                .collect()
        })
        .unwrap_or_default())
}

async fn cmd_plan(file: &Path, state_dir: &Path) -> Result<()> {
    let config = parser::load_config(file)?;
    let (templates, _) = stack::render_cluster(&config).await?;
    let desired: Vec<DesiredStack> = templates
        .iter()
        .map(|t| DesiredStack {
            name: t.stack.clone(),
            hash: t.hash.clone(),
        })
        .collect();
    let live = locked_hashes(state_dir, &config.metadata.name)?;
    let plan = planner::plan(&config.metadata.name, &desired, &live);

    println!("Planning: {} ({} stacks)", plan.cluster, plan.changes.len());
    println!();
    for change in &plan.changes {
        let symbol = match change.action {
            StackAction::Create => "+",
            StackAction::Update => "~",
            StackAction::Delete => "-",
            StackAction::Skip => " ",
        };
        println!("  {} {}", symbol, change.description);
    }
    println!();
    println!(
        "Plan: {} to add, {} to change, {} to destroy, {} unchanged.",
        plan.to_create, plan.to_update, plan.to_delete, plan.unchanged
    );
    Ok(())
}

/// Context cancelled on Ctrl-C.
fn interruptible_context() -> TaskContext {
    let ctx = TaskContext::new();
    let token = ctx.token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling pending tasks");
            token.cancel();
        }
    });
    ctx
}

fn record_reports(state_dir: &Path, cluster: &str, reports: &[StackReport]) -> Result<()> {
    let mut lock =
        state::load_lock(state_dir, cluster)?.unwrap_or_else(|| state::new_lock(cluster));
    lock.generated_at = state::now_iso8601();
    for report in reports {
        lock.stacks.insert(
            report.stack.clone(),
            StackLock {
                hash: report.hash.clone(),
                status: report.status.to_string(),
                outputs: report.outputs.clone(),
            },
        );
    }
    state::save_lock(state_dir, &lock)
}

async fn cmd_create(file: &Path, state_dir: &Path, run: &RunArgs) -> Result<()> {
    let config = parser::load_config(file)?;
    let region = config.metadata.region.clone();
    let cluster = config.metadata.name.clone();
    let provider = run.provider(&region)?;
    let manager = StackManager::new(provider.clone(), provider.clone(), run.settings(&region));

    let outcome = stack::create_cluster(manager, config, &interruptible_context()).await?;
    for report in &outcome.stacks {
        if let Some(template) = provider.stack_template(&report.stack) {
            state::save_template(state_dir, &cluster, &report.stack, &template)?;
        }
        println!("  {} {} ({})", report.stack, report.action, report.status);
    }
    record_reports(state_dir, &cluster, &outcome.stacks)?;

    if let Some(endpoint) = outcome.config.status.as_ref().and_then(|s| s.endpoint.as_deref()) {
        info!(cluster = %cluster, endpoint = %endpoint, "cluster is ready");
    }
    println!("Cluster {:?} is ready ({} stacks).", cluster, outcome.stacks.len());
    Ok(())
}

/// Seed the simulated provider with the stacks a previous run recorded.
fn seed_from_lock(provider: &MemoryProvider, state_dir: &Path, cluster: &str) -> Result<usize> {
    let Some(lock) = state::load_lock(state_dir, cluster)? else {
        return Ok(0);
    };
    for (name, entry) in &lock.stacks {
        let status = entry.status.parse().unwrap_or(StackStatus::CreateComplete);
        provider.insert_stack(Stack {
            name: name.clone(),
            id: name.clone(),
            status,
            status_reason: None,
            outputs: entry.outputs.clone(),
            tags: [
                (CLUSTER_NAME_TAG.to_string(), cluster.to_string()),
                (TEMPLATE_HASH_TAG.to_string(), entry.hash.clone()),
            ]
            .into(),
        });
    }
    Ok(lock.stacks.len())
}

async fn cmd_delete(cluster: &str, region: &str, state_dir: &Path, run: &RunArgs) -> Result<()> {
    let provider = run.provider(region)?;
    let seeded = seed_from_lock(&provider, state_dir, cluster)?;
    info!(cluster = %cluster, stacks = seeded, "loaded recorded stacks");
    let manager = StackManager::new(provider.clone(), provider.clone(), run.settings(region));

    let description = stack::delete_cluster(manager, cluster, &interruptible_context()).await?;
    println!("{}", description.trim());

    let lock_path = state::lock_file_path(state_dir, cluster);
    if lock_path.exists() {
        std::fs::remove_file(&lock_path)?;
    }
    println!("Cluster {:?} deleted.", cluster);
    Ok(())
}
