//! CF-032: Stack waiters.
//!
//! A waiter polls the stack until an acceptor matches. Failure statuses end
//! the wait at once and dump the stack's failed events; the deadline comes
//! from the manager's wait timeout.

use super::StackManager;
use crate::error::{Error, Result};
use crate::provider::{Stack, StackStatus};
use crate::tasks::{poll_until, Progress, TaskContext};
use tracing::debug;

/// Operation being waited for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitFor {
    Create,
    Update,
    Delete,
}

/// What one observed status means for the wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    Success,
    Failure,
    Retry,
}

impl WaitFor {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// Classify a status; `None` means the stack does not exist.
    pub fn accept(self, status: Option<StackStatus>) -> Acceptance {
        use StackStatus::*;
        match (self, status) {
            (Self::Delete, None | Some(DeleteComplete)) => Acceptance::Success,
            (Self::Delete, Some(DeleteFailed)) => Acceptance::Failure,
            (Self::Delete, Some(_)) => Acceptance::Retry,

            (_, None) => Acceptance::Failure,

            (Self::Create, Some(CreateComplete)) => Acceptance::Success,
            (Self::Create, Some(CreateInProgress)) => Acceptance::Retry,
            (Self::Create, Some(_)) => Acceptance::Failure,

            (Self::Update, Some(UpdateComplete)) => Acceptance::Success,
            (Self::Update, Some(UpdateInProgress | UpdateCompleteCleanupInProgress)) => {
                Acceptance::Retry
            }
            (Self::Update, Some(_)) => Acceptance::Failure,
        }
    }
}

fn failure(name: &str, stack: Option<&Stack>) -> Error {
    match stack {
        None => Error::StackNotFound {
            stack: name.to_string(),
        },
        Some(stack) => Error::StackFailed {
            stack: name.to_string(),
            status: stack.status.to_string(),
            reason: stack
                .status_reason
                .clone()
                .unwrap_or_else(|| "no reason reported".to_string()),
        },
    }
}

impl StackManager {
    /// Poll `name` until `op` completes. Returns the final stack, `None`
    /// after a completed delete.
    pub async fn wait(&self, ctx: &TaskContext, name: &str, op: WaitFor) -> Result<Option<Stack>> {
        let ctx = ctx.child().with_timeout(self.settings.wait_timeout);
        let operation = format!("waiting for {} of stack {:?}", op.as_str(), name);
        poll_until(&self.settings.poll, &ctx, &operation, || async {
            let stack = self.stacks.describe_stack(name).await?;
            let status = stack.as_ref().map(|s| s.status);
            match op.accept(status) {
                Acceptance::Success => Ok(Progress::Done(stack)),
                Acceptance::Retry => {
                    debug!(stack = %name, status = ?status, "stack not settled yet");
                    Ok(Progress::Pending)
                }
                Acceptance::Failure => {
                    if stack.is_some() {
                        self.troubleshoot(name).await;
                    }
                    Err(failure(name, stack.as_ref()))
                }
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::MemoryProvider;
    use crate::stack::Settings;
    use crate::tasks::RetryPolicy;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_cf032_acceptors() {
        use StackStatus::*;
        assert_eq!(WaitFor::Create.accept(Some(CreateComplete)), Acceptance::Success);
        assert_eq!(WaitFor::Create.accept(Some(CreateInProgress)), Acceptance::Retry);
        for failed in [CreateFailed, RollbackInProgress, RollbackComplete, DeleteInProgress] {
            assert_eq!(WaitFor::Create.accept(Some(failed)), Acceptance::Failure, "{failed}");
        }
        assert_eq!(WaitFor::Create.accept(None), Acceptance::Failure);

        assert_eq!(
            WaitFor::Update.accept(Some(UpdateCompleteCleanupInProgress)),
            Acceptance::Retry
        );
        assert_eq!(WaitFor::Update.accept(Some(UpdateRollbackComplete)), Acceptance::Failure);

        assert_eq!(WaitFor::Delete.accept(None), Acceptance::Success);
        assert_eq!(WaitFor::Delete.accept(Some(DeleteInProgress)), Acceptance::Retry);
        assert_eq!(WaitFor::Delete.accept(Some(DeleteFailed)), Acceptance::Failure);
    }

    fn stuck_stack(provider: &MemoryProvider) {
        provider.insert_stack(Stack {
            name: "s".into(),
            id: "id".into(),
            status: StackStatus::CreateInProgress,
            status_reason: None,
            outputs: BTreeMap::new(),
            tags: BTreeMap::new(),
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_cf032_wait_times_out() {
        let provider = Arc::new(MemoryProvider::new("us-west-2"));
        stuck_stack(&provider);
        let settings = Settings::new("us-west-2")
            .with_wait_timeout(Duration::from_secs(60))
            .with_poll(RetryPolicy::fixed(Duration::from_secs(15), 0));
        let mgr = StackManager::new(provider.clone(), provider.clone(), settings);
        let err = mgr.wait(&TaskContext::new(), "s", WaitFor::Create).await.unwrap_err();
        assert!(matches!(
            err,
            Error::DeadlineExceeded { after, .. } if after == Duration::from_secs(60)
        ));
        assert!(err.is_cancellation());
        assert!(provider.calls("describe_stack") >= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cf032_wait_cancelled() {
        let provider = Arc::new(MemoryProvider::new("us-west-2"));
        stuck_stack(&provider);
        let mgr = StackManager::new(provider.clone(), provider.clone(), Settings::new("us-west-2"));
        let ctx = TaskContext::new();
        let waiting = {
            let ctx = ctx.clone();
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.wait(&ctx, "s", WaitFor::Create).await })
        };
        tokio::time::sleep(Duration::from_secs(40)).await;
        ctx.cancel();
        let err = waiting.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
    }
}
