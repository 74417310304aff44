//! CF-031: Stack manager.
//!
//! Names, tags and deploys the stacks of one cluster. Every remote call goes
//! through `retry_transient`; every wait goes through `StackManager::wait`
//! with the configured deadline.

pub mod tree;
pub mod waiter;

pub use tree::{
    create_cluster, delete_cluster, render_cluster, ClusterRun, RenderedTemplate, StackReport,
};
pub use waiter::{Acceptance, WaitFor};

use crate::core::template::RenderedStack;
use crate::core::types::ClusterConfig;
use crate::error::{Error, Result};
use crate::provider::{Ec2Api, Stack, StackApi, StackRequest, StackStatus};
use crate::tasks::{retry_transient, RetryPolicy, TaskContext};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub const STACK_NAME_PREFIX: &str = "clusterforge";

pub const CLUSTER_NAME_TAG: &str = "alpha.clusterforge.io/cluster-name";
/// Ownership tag written by older releases; still honoured on delete
pub const OLD_CLUSTER_NAME_TAG: &str = "clusterforge.cluster.k8s.io/v1alpha1/cluster-name";
pub const TEMPLATE_HASH_TAG: &str = "clusterforge.io/template-hash";
pub const NODE_POOL_NAME_TAG: &str = "alpha.clusterforge.io/nodegroup-name";

pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(25 * 60);

/// Runtime settings of a stack manager.
#[derive(Debug, Clone)]
pub struct Settings {
    pub region: String,
    /// Upper bound for a single stack wait
    pub wait_timeout: Duration,
    /// Service role assumed by the provisioning API
    pub role_arn: Option<String>,
    pub disable_rollback: bool,
    /// Template for stack waiters; cloned per wait
    pub poll: RetryPolicy,
    /// Template for retrying transient API errors
    pub api_retry: RetryPolicy,
}

impl Settings {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            role_arn: None,
            disable_rollback: false,
            poll: RetryPolicy::stack_waiter(),
            api_retry: RetryPolicy::default(),
        }
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn with_poll(mut self, poll: RetryPolicy) -> Self {
        self.poll = poll;
        self
    }
}

pub fn stack_prefix(cluster: &str) -> String {
    format!("{}-{}-", STACK_NAME_PREFIX, cluster)
}

pub fn cluster_stack_name(cluster: &str) -> String {
    format!("{}cluster", stack_prefix(cluster))
}

pub fn nodegroup_stack_name(cluster: &str, pool: &str) -> String {
    format!("{}nodegroup-{}", stack_prefix(cluster), pool)
}

/// Access entry stacks are keyed by a short hash of the principal so that
/// reordering entries in the config keeps their stacks.
pub fn access_entry_stack_name(cluster: &str, principal_arn: &str) -> String {
    let hex = blake3::hash(principal_arn.as_bytes()).to_hex();
    format!("{}accessentry-{}", stack_prefix(cluster), &hex[..8])
}

/// What a stack of this cluster holds, derived from its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackKind {
    Cluster,
    NodeGroup(String),
    AccessEntry(String),
}

pub fn classify(cluster: &str, stack_name: &str) -> Option<StackKind> {
    let rest = stack_name.strip_prefix(&stack_prefix(cluster))?;
    if rest == "cluster" {
        return Some(StackKind::Cluster);
    }
    if let Some(pool) = rest.strip_prefix("nodegroup-") {
        return Some(StackKind::NodeGroup(pool.to_string()));
    }
    rest.strip_prefix("accessentry-")
        .map(|id| StackKind::AccessEntry(id.to_string()))
}

/// Tags every stack of the cluster carries: user tags, ownership, template hash.
pub fn stack_tags(cfg: &ClusterConfig, hash: &str, pool: Option<&str>) -> BTreeMap<String, String> {
    let mut tags = cfg.metadata.tags.clone();
    let cluster = cfg.metadata.name.clone();
    tags.insert(CLUSTER_NAME_TAG.to_string(), cluster.clone());
    tags.insert(OLD_CLUSTER_NAME_TAG.to_string(), cluster);
    tags.insert(TEMPLATE_HASH_TAG.to_string(), hash.to_string());
    if let Some(pool) = pool {
        tags.insert(NODE_POOL_NAME_TAG.to_string(), pool.to_string());
    }
    tags
}

/// Refuse to touch a stack that does not carry this cluster's ownership tag.
pub fn ensure_owned(stack: &Stack, cluster: &str) -> Result<()> {
    let owned = [CLUSTER_NAME_TAG, OLD_CLUSTER_NAME_TAG]
        .iter()
        .any(|tag| stack.tags.get(*tag).map(String::as_str) == Some(cluster));
    if owned {
        Ok(())
    } else {
        Err(Error::ForeignStack {
            stack: stack.name.clone(),
            tag: CLUSTER_NAME_TAG.to_string(),
        })
    }
}

fn can_update(status: StackStatus) -> bool {
    matches!(
        status,
        StackStatus::CreateComplete
            | StackStatus::UpdateComplete
            | StackStatus::UpdateRollbackComplete
    )
}

/// How a deploy ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deployed {
    Created,
    Updated,
    Unchanged,
}

impl std::fmt::Display for Deployed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
        })
    }
}

#[derive(Debug, Clone)]
pub struct DeployResult {
    pub action: Deployed,
    /// Live stack after the deploy settled
    pub stack: Stack,
}

/// Stack operations against the injected provider.
#[derive(Clone)]
pub struct StackManager {
    stacks: Arc<dyn StackApi>,
    ec2: Arc<dyn Ec2Api>,
    settings: Arc<Settings>,
}

impl StackManager {
    pub fn new(stacks: Arc<dyn StackApi>, ec2: Arc<dyn Ec2Api>, settings: Settings) -> Self {
        Self {
            stacks,
            ec2,
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn ec2(&self) -> &dyn Ec2Api {
        self.ec2.as_ref()
    }

    pub async fn describe(&self, ctx: &TaskContext, name: &str) -> Result<Option<Stack>> {
        let operation = format!("describing stack {:?}", name);
        retry_transient(&self.settings.api_retry, ctx, &operation, || async {
            Ok(self.stacks.describe_stack(name).await?)
        })
        .await
    }

    /// Live stacks of one cluster, in name order.
    pub async fn list_cluster_stacks(
        &self,
        ctx: &TaskContext,
        cluster: &str,
    ) -> Result<Vec<Stack>> {
        let prefix = stack_prefix(cluster);
        let mut stacks = retry_transient(&self.settings.api_retry, ctx, "listing stacks", || async {
            Ok(self.stacks.list_stacks(&prefix).await?)
        })
        .await?;
        stacks.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(stacks)
    }

    /// Create the stack, or update it when its template hash changed.
    pub async fn deploy(
        &self,
        ctx: &TaskContext,
        cfg: &ClusterConfig,
        name: &str,
        rendered: &RenderedStack,
        pool: Option<&str>,
    ) -> Result<DeployResult> {
        let request = StackRequest {
            name: name.to_string(),
            template: rendered.template.clone(),
            tags: stack_tags(cfg, &rendered.hash, pool),
            capabilities: rendered.capabilities.clone(),
            role_arn: self.settings.role_arn.clone(),
            disable_rollback: self.settings.disable_rollback,
        };

        let Some(existing) = self.describe(ctx, name).await? else {
            info!(stack = %name, hash = %rendered.hash, "deploying stack");
            let operation = format!("creating stack {:?}", name);
            retry_transient(&self.settings.api_retry, ctx, &operation, || async {
                Ok(self.stacks.create_stack(&request).await?)
            })
            .await?;
            let stack = self.wait_present(ctx, name, WaitFor::Create).await?;
            return Ok(DeployResult {
                action: Deployed::Created,
                stack,
            });
        };

        ensure_owned(&existing, &cfg.metadata.name)?;
        if !can_update(existing.status) {
            return Err(Error::StackFailed {
                stack: name.to_string(),
                status: existing.status.to_string(),
                reason: "stack cannot be updated in this state, delete it first".to_string(),
            });
        }
        if existing.tags.get(TEMPLATE_HASH_TAG) == Some(&rendered.hash) {
            info!(stack = %name, "stack is up to date");
            return Ok(DeployResult {
                action: Deployed::Unchanged,
                stack: existing,
            });
        }

        info!(stack = %name, hash = %rendered.hash, "updating stack");
        let operation = format!("updating stack {:?}", name);
        let updated = retry_transient(&self.settings.api_retry, ctx, &operation, || async {
            Ok(self.stacks.update_stack(&request).await?)
        })
        .await;
        match updated {
            Err(Error::Api(e)) if e.is_no_op_update() => {
                info!(stack = %name, "no changes to deploy");
                Ok(DeployResult {
                    action: Deployed::Unchanged,
                    stack: existing,
                })
            }
            Err(e) => Err(e),
            Ok(()) => {
                let stack = self.wait_present(ctx, name, WaitFor::Update).await?;
                Ok(DeployResult {
                    action: Deployed::Updated,
                    stack,
                })
            }
        }
    }

    async fn wait_present(&self, ctx: &TaskContext, name: &str, op: WaitFor) -> Result<Stack> {
        self.wait(ctx, name, op).await?.ok_or_else(|| Error::StackNotFound {
            stack: name.to_string(),
        })
    }

    /// Delete a stack of `cluster` and wait for it to go. Returns false when
    /// there was nothing to delete.
    pub async fn delete(&self, ctx: &TaskContext, cluster: &str, name: &str) -> Result<bool> {
        let Some(existing) = self.describe(ctx, name).await? else {
            info!(stack = %name, "stack already deleted");
            return Ok(false);
        };
        ensure_owned(&existing, cluster)?;
        info!(stack = %name, "deleting stack");
        let operation = format!("deleting stack {:?}", name);
        retry_transient(&self.settings.api_retry, ctx, &operation, || async {
            Ok(self.stacks.delete_stack(name).await?)
        })
        .await?;
        self.wait(ctx, name, WaitFor::Delete).await?;
        Ok(true)
    }

    /// Log the failed resources of a stack.
    pub async fn troubleshoot(&self, name: &str) {
        let events = match self.stacks.describe_stack_events(name).await {
            Ok(events) => events,
            Err(e) => {
                warn!(stack = %name, error = %e, "cannot fetch stack events");
                return;
            }
        };
        let mut failed = 0;
        for event in events.iter().filter(|e| e.status.ends_with("_FAILED")) {
            failed += 1;
            error!(
                stack = %name,
                resource = %event.logical_id,
                resource_type = %event.resource_type,
                status = %event.status,
                reason = event.reason.as_deref().unwrap_or("unknown"),
                "resource failed"
            );
        }
        if failed == 0 {
            error!(
                stack = %name,
                events = events.len(),
                "stack failed without failed resource events"
            );
        }
    }
}
