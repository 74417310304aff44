//! CF-015: Task trees.
//!
//! A tree is either sequential or parallel and may nest further trees.
//! Every leaf reports its failure on the channel handed down from the root,
//! so a run yields the full list of failures rather than the first one.

pub mod context;
pub mod retry;

pub use context::TaskContext;
pub use retry::{poll_until, retry_transient, Progress, RetryPolicy};

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Error sink shared by all leaves of one run.
pub type ErrorSink = mpsc::UnboundedSender<Error>;

/// A unit of orchestration work.
#[async_trait]
pub trait Task: Send + Sync {
    fn describe(&self) -> String;

    async fn run(&self, ctx: &TaskContext) -> Result<()>;

    /// Run and push any failure to `errors`. Returns whether it succeeded.
    async fn run_into(&self, ctx: &TaskContext, errors: &ErrorSink) -> bool {
        let description = self.describe();
        debug!(task = %description, "started task");
        match self.run(ctx).await {
            Ok(()) => {
                debug!(task = %description, "completed task");
                true
            }
            Err(e) => {
                debug!(task = %description, error = %e, "task failed");
                report(errors, e);
                false
            }
        }
    }
}

fn report(errors: &ErrorSink, err: Error) {
    match err {
        Error::Tasks(all) => all.into_iter().for_each(|e| report(errors, e)),
        // receiver outlives every run; a closed channel only happens on teardown
        e => {
            let _ = errors.send(e);
        }
    }
}

/// Sequential or parallel composition of tasks.
#[derive(Default, Clone)]
pub struct TaskTree {
    tasks: Vec<Arc<dyn Task>>,
    pub parallel: bool,
    pub plan_mode: bool,
    pub is_sub_task: bool,
}

impl std::fmt::Debug for TaskTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe())
    }
}

impl TaskTree {
    pub fn sequential() -> Self {
        Self::default()
    }

    pub fn parallel() -> Self {
        Self {
            parallel: true,
            ..Self::default()
        }
    }

    /// Mark as nested inside another tree.
    pub fn as_sub_task(mut self) -> Self {
        self.is_sub_task = true;
        self
    }

    pub fn with_plan_mode(mut self, plan_mode: bool) -> Self {
        self.plan_mode = plan_mode;
        self
    }

    pub fn append(&mut self, task: impl Task + 'static) {
        self.tasks.push(Arc::new(task));
    }

    pub fn append_arc(&mut self, task: Arc<dyn Task>) {
        self.tasks.push(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Run every task and return all failures, in the order they were reported.
    pub async fn run_all(&self, ctx: &TaskContext) -> Vec<Error> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.run_into(ctx, &tx).await;
        drop(tx);
        let mut errors = Vec::new();
        while let Some(e) = rx.recv().await {
            errors.push(e);
        }
        errors
    }

    async fn run_sequential(&self, ctx: &TaskContext, errors: &ErrorSink) -> bool {
        for task in &self.tasks {
            if !task.run_into(ctx, errors).await {
                return false;
            }
        }
        true
    }

    async fn run_parallel(&self, ctx: &TaskContext, errors: &ErrorSink) -> bool {
        let handles: Vec<_> = self
            .tasks
            .iter()
            .map(|task| {
                let task = Arc::clone(task);
                let ctx = ctx.clone();
                let errors = errors.clone();
                let description = task.describe();
                let handle = tokio::spawn(async move { task.run_into(&ctx, &errors).await });
                (description, handle)
            })
            .collect();

        let mut ok = true;
        for (description, handle) in handles {
            match handle.await {
                Ok(true) => {}
                Ok(false) => ok = false,
                Err(_) => {
                    ok = false;
                    report(
                        errors,
                        Error::TaskPanicked {
                            task: description.trim().to_string(),
                        },
                    );
                }
            }
        }
        ok
    }
}

#[async_trait]
impl Task for TaskTree {
    fn describe(&self) -> String {
        if self.is_empty() {
            return "no tasks".to_string();
        }
        let descriptions: Vec<String> = self
            .tasks
            .iter()
            .map(|t| t.describe().trim_end_matches('\n').to_string())
            .collect();
        let noun = if self.is_sub_task { "sub-task" } else { "task" };
        if descriptions.len() == 1 {
            if self.is_sub_task {
                return descriptions[0].clone();
            }
            return format!("1 {noun}: {{ {} }}", descriptions[0]);
        }

        let mode = if self.parallel { "parallel" } else { "sequential" };
        let count = descriptions.len();
        let mut msg = String::new();
        if self.plan_mode {
            msg.push_str("(plan) ");
        }
        if self.is_sub_task {
            msg.push_str(&format!("\n    {count} {mode} {noun}s: {{ \n"));
            for d in &descriptions {
                if d.contains("sub-task") {
                    let nested: Vec<String> = d
                        .strip_prefix('\n')
                        .unwrap_or(d)
                        .lines()
                        .map(|line| format!("    {line}"))
                        .collect();
                    msg.push_str(&nested.join("\n"));
                } else {
                    msg.push_str("        ");
                    msg.push_str(d);
                }
                msg.push_str(",\n");
            }
            msg.push_str("    }");
        } else {
            msg.push_str(&format!("\n{count} {mode} {noun}s: {{ "));
            msg.push_str(&descriptions.join(", "));
            msg.push_str(" \n}");
        }
        msg.push('\n');
        msg
    }

    async fn run(&self, ctx: &TaskContext) -> Result<()> {
        let errors = self.run_all(ctx).await;
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Tasks(errors))
        }
    }

    async fn run_into(&self, ctx: &TaskContext, errors: &ErrorSink) -> bool {
        if self.is_empty() || self.plan_mode {
            debug!("no actual tasks");
            return true;
        }
        if self.parallel {
            self.run_parallel(ctx, errors).await
        } else {
            self.run_sequential(ctx, errors).await
        }
    }
}

/// Leaf task backed by a closure.
pub struct FnTask<F> {
    description: String,
    doer: F,
}

impl<F, Fut> FnTask<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    pub fn new(description: impl Into<String>, doer: F) -> Self {
        Self {
            description: description.into(),
            doer,
        }
    }
}

#[async_trait]
impl<F, Fut> Task for FnTask<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn describe(&self) -> String {
        self.description.clone()
    }

    async fn run(&self, ctx: &TaskContext) -> Result<()> {
        (self.doer)(ctx.clone()).await
    }
}

/// Leaf task that acts on one named item (a node pool, an access entry).
pub struct NamedTask<F> {
    info: String,
    name: String,
    call: F,
}

impl<F, Fut> NamedTask<F>
where
    F: Fn(TaskContext, String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    pub fn new(info: impl Into<String>, name: impl Into<String>, call: F) -> Self {
        Self {
            info: info.into(),
            name: name.into(),
            call,
        }
    }
}

#[async_trait]
impl<F, Fut> Task for NamedTask<F>
where
    F: Fn(TaskContext, String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn describe(&self) -> String {
        format!("{} {:?}", self.info, self.name)
    }

    async fn run(&self, ctx: &TaskContext) -> Result<()> {
        (self.call)(ctx.clone(), self.name.clone())
            .await
            .map_err(|e| e.context(format!("{} {:?}", self.info, self.name)))
    }
}
