//! CF-033: Cluster task trees.
//!
//! Create: cluster stack, then access entries in parallel, then every node
//! pool in parallel. Each pool is a sequential sub-tree (deploy, collect).
//! Delete runs the same groups in reverse.
//!
//! Outputs are collected into one config shared by all tasks, so a pool
//! stack is built only after the cluster stack's outputs are on the config.

use super::{
    access_entry_stack_name, classify, cluster_stack_name, nodegroup_stack_name, DeployResult,
    Deployed, Settings, StackKind, StackManager,
};
use crate::builder::access_entry::build_access_entry_stack;
use crate::builder::cluster::build_cluster_stack;
use crate::builder::managed_nodegroup::build_managed_nodegroup_stack;
use crate::builder::nodegroup::build_nodegroup_stack;
use crate::builder::ClusterImports;
use crate::core::outputs::OutputCollectors;
use crate::core::template::RenderedStack;
use crate::core::types::{ClusterConfig, NodePool};
use crate::error::{Error, Result};
use crate::placement::select_subnets;
use crate::provider::memory::MemoryProvider;
use crate::provider::StackStatus;
use crate::tasks::{FnTask, NamedTask, RetryPolicy, Task, TaskContext, TaskTree};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Result of deploying one stack, for reporting and the lock file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackReport {
    pub stack: String,
    pub action: Deployed,
    pub hash: String,
    pub status: StackStatus,
    pub outputs: BTreeMap<String, String>,
}

/// A deployed stack whose outputs have not been collected yet.
struct Pending {
    stack: String,
    outputs: OutputCollectors,
    live: BTreeMap<String, String>,
}

type Slot = Arc<Mutex<Option<Pending>>>;

/// State shared by the tasks of one create run.
#[derive(Clone)]
pub struct ClusterRun {
    manager: StackManager,
    config: Arc<Mutex<ClusterConfig>>,
    reports: Arc<std::sync::Mutex<Vec<StackReport>>>,
}

impl ClusterRun {
    pub fn new(manager: StackManager, config: ClusterConfig) -> Self {
        Self {
            manager,
            config: Arc::new(Mutex::new(config)),
            reports: Arc::default(),
        }
    }

    /// Config as collected so far.
    pub async fn snapshot(&self) -> ClusterConfig {
        self.config.lock().await.clone()
    }

    pub fn reports(&self) -> Vec<StackReport> {
        self.reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn record(&self, rendered_hash: &str, deployed: &DeployResult) {
        let report = StackReport {
            stack: deployed.stack.name.clone(),
            action: deployed.action,
            hash: rendered_hash.to_string(),
            status: deployed.stack.status,
            outputs: deployed.stack.outputs.clone(),
        };
        self.reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(report);
    }

    async fn collect(&self, pending: Pending) -> Result<()> {
        let report = pending
            .outputs
            .read(&pending.stack, &pending.live)?
            .collect_shared(&self.config)
            .await?;
        debug!(
            stack = %pending.stack,
            collected = report.collected.len(),
            skipped = report.skipped.len(),
            "collected stack outputs"
        );
        Ok(())
    }

    async fn deploy(
        &self,
        ctx: &TaskContext,
        cfg: &ClusterConfig,
        name: &str,
        rendered: RenderedStack,
        pool: Option<&str>,
    ) -> Result<Pending> {
        let deployed = self.manager.deploy(ctx, cfg, name, &rendered, pool).await?;
        self.record(&rendered.hash, &deployed);
        Ok(Pending {
            stack: name.to_string(),
            outputs: rendered.outputs,
            live: deployed.stack.outputs,
        })
    }

    pub async fn deploy_cluster(&self, ctx: &TaskContext) -> Result<()> {
        let cfg = self.snapshot().await;
        let name = cluster_stack_name(&cfg.metadata.name);
        let rendered = build_cluster_stack(&cfg, self.manager.ec2()).await?.finish()?;
        let pending = self.deploy(ctx, &cfg, &name, rendered, None).await?;
        self.collect(pending).await
    }

    pub async fn deploy_access_entry(&self, ctx: &TaskContext, principal_arn: &str) -> Result<()> {
        let cfg = self.snapshot().await;
        let entry = cfg
            .access_entries
            .iter()
            .find(|e| e.principal_arn == principal_arn)
            .ok_or_else(|| {
                Error::invalid_config(format!("no access entry for {}", principal_arn))
            })?;
        let name = access_entry_stack_name(&cfg.metadata.name, principal_arn);
        let rendered = build_access_entry_stack(&cfg, entry)?.finish()?;
        self.deploy(ctx, &cfg, &name, rendered, None).await?;
        Ok(())
    }

    async fn deploy_pool(&self, ctx: &TaskContext, pool_name: &str, slot: &Slot) -> Result<()> {
        let cfg = self.snapshot().await;
        let cluster = &cfg.metadata.name;
        let pool = cfg
            .node_pools()
            .find(|p| p.name() == pool_name)
            .ok_or_else(|| {
                Error::invalid_config(format!("no node pool named {:?}", pool_name))
            })?;
        let imports = ClusterImports::new(cluster_stack_name(cluster));
        let ec2 = self.manager.ec2();
        let subnets = select_subnets(ec2, &cfg, pool).await?;
        let rs = match pool {
            NodePool::Unmanaged(ng) => {
                build_nodegroup_stack(&cfg, ng, &imports, &subnets, ec2).await?
            }
            NodePool::Managed(mng) => {
                build_managed_nodegroup_stack(&cfg, mng, &imports, &subnets, ec2).await?
            }
        };
        let name = nodegroup_stack_name(cluster, pool_name);
        let pending = self.deploy(ctx, &cfg, &name, rs.finish()?, Some(pool_name)).await?;
        *slot.lock().await = Some(pending);
        Ok(())
    }

    async fn collect_pool(&self, pool_name: &str, slot: &Slot) -> Result<()> {
        let pending = slot.lock().await.take().ok_or_else(|| {
            Error::collect(pool_name, "node pool stack was not deployed")
        })?;
        self.collect(pending).await
    }
}

fn pool_sub_tree(run: &ClusterRun, pool: NodePool<'_>) -> TaskTree {
    let kind = if pool.is_managed() { "managed nodegroup" } else { "nodegroup" };
    let slot: Slot = Arc::default();
    let mut sub = TaskTree::sequential().as_sub_task();

    let (deploy_run, deploy_slot) = (run.clone(), slot.clone());
    sub.append(NamedTask::new(format!("create {} stack", kind), pool.name(), move |ctx, name| {
        let (run, slot) = (deploy_run.clone(), deploy_slot.clone());
        async move { run.deploy_pool(&ctx, &name, &slot).await }
    }));

    let collect_run = run.clone();
    sub.append(NamedTask::new(format!("collect {} outputs", kind), pool.name(), move |_, name| {
        let (run, slot) = (collect_run.clone(), slot.clone());
        async move { run.collect_pool(&name, &slot).await }
    }));
    sub
}

/// Tree that creates (or updates) every stack of `cfg`.
pub fn create_cluster_tasks(run: &ClusterRun, cfg: &ClusterConfig) -> TaskTree {
    let mut tree = TaskTree::sequential();

    let cluster_run = run.clone();
    tree.append(FnTask::new(
        format!("create cluster control plane {:?}", cfg.metadata.name),
        move |ctx| {
            let run = cluster_run.clone();
            async move { run.deploy_cluster(&ctx).await }
        },
    ));

    if !cfg.access_entries.is_empty() {
        let mut entries = TaskTree::parallel().as_sub_task();
        for entry in &cfg.access_entries {
            let run = run.clone();
            entries.append(NamedTask::new(
                "create access entry for principal",
                entry.principal_arn.as_str(),
                move |ctx, arn| {
                    let run = run.clone();
                    async move { run.deploy_access_entry(&ctx, &arn).await }
                },
            ));
        }
        tree.append(entries);
    }

    let mut pools = TaskTree::parallel().as_sub_task();
    for pool in cfg.node_pools() {
        pools.append(pool_sub_tree(run, pool));
    }
    if !pools.is_empty() {
        tree.append(pools);
    }
    tree
}

/// Outcome of a create run.
#[derive(Debug, Clone)]
pub struct CreateOutcome {
    /// Config with every collected output applied
    pub config: ClusterConfig,
    pub stacks: Vec<StackReport>,
}

fn into_result(mut errors: Vec<Error>) -> Result<()> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(Error::Tasks(errors)),
    }
}

/// Create or update every stack of the cluster.
pub async fn create_cluster(
    manager: StackManager,
    cfg: ClusterConfig,
    ctx: &TaskContext,
) -> Result<CreateOutcome> {
    let run = ClusterRun::new(manager, cfg.clone());
    let tree = create_cluster_tasks(&run, &cfg);
    info!(cluster = %cfg.metadata.name, plan = %tree.describe().trim(), "creating cluster");
    into_result(tree.run_all(ctx).await)?;
    Ok(CreateOutcome {
        config: run.snapshot().await,
        stacks: run.reports(),
    })
}

fn delete_leaf(manager: &StackManager, cluster: &str, stack: String) -> impl Task + 'static {
    let manager = manager.clone();
    let cluster = cluster.to_string();
    NamedTask::new("delete stack", stack, move |ctx, name| {
        let (manager, cluster) = (manager.clone(), cluster.clone());
        async move { manager.delete(&ctx, &cluster, &name).await.map(|_| ()) }
    })
}

/// Tree that deletes every stack of `cluster` found live, dependents first.
pub async fn delete_cluster_tasks(
    manager: &StackManager,
    cluster: &str,
    ctx: &TaskContext,
) -> Result<TaskTree> {
    let mut pools = TaskTree::parallel().as_sub_task();
    let mut entries = TaskTree::parallel().as_sub_task();
    let mut control_plane = None;
    for stack in manager.list_cluster_stacks(ctx, cluster).await? {
        match classify(cluster, &stack.name) {
            Some(StackKind::NodeGroup(_)) => {
                pools.append(delete_leaf(manager, cluster, stack.name))
            }
            Some(StackKind::AccessEntry(_)) => {
                entries.append(delete_leaf(manager, cluster, stack.name))
            }
            Some(StackKind::Cluster) => control_plane = Some(stack.name),
            None => debug!(stack = %stack.name, "ignoring stack of unknown kind"),
        }
    }

    let mut tree = TaskTree::sequential();
    if !pools.is_empty() {
        tree.append(pools);
    }
    if !entries.is_empty() {
        tree.append(entries);
    }
    if let Some(name) = control_plane {
        tree.append(delete_leaf(manager, cluster, name));
    }
    Ok(tree)
}

/// Delete every stack of the cluster. Returns the tree that ran.
pub async fn delete_cluster(
    manager: StackManager,
    cluster: &str,
    ctx: &TaskContext,
) -> Result<String> {
    let tree = delete_cluster_tasks(&manager, cluster, ctx).await?;
    let description = tree.describe();
    info!(cluster = %cluster, plan = %description.trim(), "deleting cluster");
    into_result(tree.run_all(ctx).await)?;
    Ok(description)
}

/// A template as the simulated provider received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedTemplate {
    pub stack: String,
    pub hash: String,
    pub template: Vec<u8>,
}

/// Render every stack of the cluster by running the create tree against the
/// in-memory provider. Node pool stacks need the cluster's outputs, so they
/// can only be rendered after a (simulated) cluster stack exists.
pub async fn render_cluster(cfg: &ClusterConfig) -> Result<(Vec<RenderedTemplate>, CreateOutcome)> {
    let provider = Arc::new(MemoryProvider::new(&cfg.metadata.region).settle_after(0));
    let settings = Settings::new(cfg.metadata.region.as_str())
        .with_poll(RetryPolicy::fixed(Duration::from_millis(10), 0));
    let manager = StackManager::new(provider.clone(), provider.clone(), settings);
    let outcome = create_cluster(manager, cfg.clone(), &TaskContext::new()).await?;
    let templates = outcome
        .stacks
        .iter()
        .map(|report| RenderedTemplate {
            stack: report.stack.clone(),
            hash: report.hash.clone(),
            template: provider.stack_template(&report.stack).unwrap_or_default(),
        })
        .collect();
    Ok((templates, outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser::load_config;
    use crate::provider::ApiError;
    use crate::stack::CLUSTER_NAME_TAG;
    use std::io::Write;

    const CLUSTER: &str = r#"
metadata:
  name: demo
  region: us-west-2
accessEntries:
  - principalARN: arn:aws:iam::111122223333:role/admin
    accessPolicies:
      - policyARN: arn:aws:eks::aws:cluster-access-policy/AmazonEKSAdminPolicy
        accessScope: {type: cluster}
nodeGroups:
  - name: ng-1
    instanceType: m5.large
managedNodeGroups:
  - name: mng-1
    instanceType: m5.large
    privateNetworking: true
"#;

    fn config() -> ClusterConfig {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CLUSTER.as_bytes()).unwrap();
        load_config(file.path()).unwrap()
    }

    fn manager(provider: &Arc<MemoryProvider>) -> StackManager {
        let settings =
            Settings::new("us-west-2").with_poll(RetryPolicy::fixed(Duration::from_secs(5), 0));
        StackManager::new(provider.clone(), provider.clone(), settings)
    }

    #[test]
    fn test_cf033_create_tree_shape() {
        let provider = Arc::new(MemoryProvider::new("us-west-2"));
        let cfg = config();
        let run = ClusterRun::new(manager(&provider), cfg.clone());
        let tree = create_cluster_tasks(&run, &cfg);
        assert_eq!(tree.len(), 3);
        let described = tree.describe();
        assert!(described
            .starts_with("\n3 sequential tasks: { create cluster control plane \"demo\""));
        assert!(described
            .contains("create access entry for principal \"arn:aws:iam::111122223333:role/admin\""));
        assert!(described.contains("2 parallel sub-tasks"));
        assert!(described.contains("create managed nodegroup stack \"mng-1\""));
        assert!(described.contains("collect nodegroup outputs \"ng-1\""));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cf033_create_cluster_collects_outputs() {
        let provider = Arc::new(MemoryProvider::new("us-west-2"));
        let outcome =
            create_cluster(manager(&provider), config(), &TaskContext::new()).await.unwrap();

        let names = provider.stack_names();
        assert_eq!(names.len(), 4, "{names:?}");
        assert!(names.contains(&"clusterforge-demo-cluster".to_string()));
        assert!(names.contains(&"clusterforge-demo-nodegroup-ng-1".to_string()));
        assert!(names.contains(&"clusterforge-demo-nodegroup-mng-1".to_string()));
        assert!(names.iter().any(|n| n.starts_with("clusterforge-demo-accessentry-")));

        // the cluster stack is deployed before anything else
        assert_eq!(outcome.stacks[0].stack, "clusterforge-demo-cluster");
        assert!(outcome.stacks.iter().all(|s| s.action == Deployed::Created));

        let status = outcome.config.status.as_ref().unwrap();
        assert!(status.endpoint.as_deref().unwrap().starts_with("https://"));
        let ca = status.certificate_authority_data.as_deref().unwrap();
        assert!(ca.contains("BEGIN CERTIFICATE"));
        assert!(outcome.config.vpc.id.as_deref().unwrap().starts_with("vpc-"));
        assert!(outcome.config.vpc.subnets.private.values().all(|s| s.id.is_some()));

        // the pool stack imports the cluster stack's exports
        let template = provider.stack_template("clusterforge-demo-nodegroup-ng-1").unwrap();
        let text = String::from_utf8(template).unwrap();
        assert!(text.contains("clusterforge-demo-cluster::SharedNodeSecurityGroup"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cf033_second_run_changes_nothing() {
        let provider = Arc::new(MemoryProvider::new("us-west-2"));
        create_cluster(manager(&provider), config(), &TaskContext::new()).await.unwrap();
        let again =
            create_cluster(manager(&provider), config(), &TaskContext::new()).await.unwrap();
        assert!(again.stacks.iter().all(|s| s.action == Deployed::Unchanged), "{:?}", again.stacks);
        assert_eq!(provider.calls("update_stack"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cf033_cluster_failure_stops_the_tree() {
        let provider = Arc::new(MemoryProvider::new("us-west-2"));
        provider.fail_stack("clusterforge-demo-cluster", "Resource limit exceeded");
        let err = create_cluster(manager(&provider), config(), &TaskContext::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Resource limit exceeded"), "{err}");
        assert_eq!(provider.stack_names(), vec!["clusterforge-demo-cluster".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cf033_pool_failures_aggregated() {
        let provider = Arc::new(MemoryProvider::new("us-west-2"));
        provider.fail_stack("clusterforge-demo-nodegroup-ng-1", "ng-1 broke");
        provider.fail_stack("clusterforge-demo-nodegroup-mng-1", "mng-1 broke");
        let err = create_cluster(manager(&provider), config(), &TaskContext::new())
            .await
            .unwrap_err();
        match err {
            Error::Tasks(errors) => {
                assert_eq!(errors.len(), 2);
                let text = errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("\n");
                assert!(text.contains("ng-1 broke"));
                assert!(text.contains("mng-1 broke"));
            }
            other => panic!("expected aggregated errors, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cf033_retry_state_isolated_between_pools() {
        // stacks settle after several polls and one describe is throttled;
        // with a shared attempt counter the second pool would run out
        let provider = Arc::new(MemoryProvider::new("us-west-2").settle_after(3));
        provider.fail_next("describe_stack", ApiError::throttling("Rate exceeded"));
        let settings =
            Settings::new("us-west-2").with_poll(RetryPolicy::fixed(Duration::from_secs(5), 5));
        let mgr = StackManager::new(provider.clone(), provider.clone(), settings);
        let outcome = create_cluster(mgr, config(), &TaskContext::new()).await.unwrap();
        assert_eq!(outcome.stacks.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cf033_delete_in_reverse_order() {
        let provider = Arc::new(MemoryProvider::new("us-west-2"));
        let mgr = manager(&provider);
        let ctx = TaskContext::new();
        create_cluster(mgr.clone(), config(), &ctx).await.unwrap();

        let tree = delete_cluster_tasks(&mgr, "demo", &ctx).await.unwrap();
        assert_eq!(tree.len(), 3);
        let described = tree.describe();
        let pool = described.find("nodegroup-ng-1").unwrap();
        let entry = described.find("accessentry-").unwrap();
        let cluster = described.find("clusterforge-demo-cluster").unwrap();
        assert!(pool < entry && entry < cluster, "{described}");

        tree.run(&ctx).await.unwrap();
        assert!(provider.stack_names().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cf033_delete_skips_foreign_and_keeps_going() {
        let provider = Arc::new(MemoryProvider::new("us-west-2"));
        let mgr = manager(&provider);
        let ctx = TaskContext::new();
        create_cluster(mgr.clone(), config(), &ctx).await.unwrap();
        provider.insert_stack(crate::provider::Stack {
            name: "clusterforge-demo-nodegroup-imported".into(),
            id: "x".into(),
            status: StackStatus::CreateComplete,
            status_reason: None,
            outputs: BTreeMap::new(),
            tags: [(CLUSTER_NAME_TAG.to_string(), "other".to_string())].into(),
        });

        let err = delete_cluster(mgr, "demo", &ctx).await.unwrap_err();
        assert!(
            matches!(
                err,
                Error::Context { ref source, .. } if matches!(**source, Error::ForeignStack { .. })
            ),
            "{err:?}"
        );
        // the parallel pool group reports the failure and the tree stops before the cluster stack
        let remaining = provider.stack_names();
        assert!(remaining.contains(&"clusterforge-demo-cluster".to_string()));
        assert!(!remaining.contains(&"clusterforge-demo-nodegroup-ng-1".to_string()));
    }

    #[tokio::test]
    async fn test_cf033_render_cluster_offline() {
        let (templates, outcome) = render_cluster(&config()).await.unwrap();
        assert_eq!(templates.len(), 4);
        assert!(templates.iter().all(|t| t.hash.starts_with("blake3:") && !t.template.is_empty()));
        assert!(outcome.config.status.is_some());

        let (again, _) = render_cluster(&config()).await.unwrap();
        let hashes = |ts: &[RenderedTemplate]| {
            ts.iter().map(|t| (t.stack.clone(), t.hash.clone())).collect::<BTreeMap<_, _>>()
        };
        assert_eq!(hashes(&templates), hashes(&again));
    }
}
