//! CF-016: Cancellation token and deadline passed to every task.

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Shared by a whole task tree; cheap to clone.
#[derive(Debug, Clone)]
pub struct TaskContext {
    token: CancellationToken,
    deadline: Option<(Instant, Duration)>,
}

impl Default for TaskContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskContext {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Context driven by an external token (e.g. wired to Ctrl-C).
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Limit to `timeout` from now. An earlier existing deadline wins.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let at = Instant::now() + timeout;
        match self.deadline {
            Some((existing, _)) if existing <= at => {}
            _ => self.deadline = Some((at, timeout)),
        }
        self
    }

    /// Child context: cancelling it leaves the parent running.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline.map(|(at, _)| at)
    }

    fn deadline_error(&self, operation: &str) -> Error {
        Error::DeadlineExceeded {
            operation: operation.to_string(),
            after: self.deadline.map(|(_, t)| t).unwrap_or_default(),
        }
    }

    fn cancelled_error(operation: &str) -> Error {
        Error::Cancelled {
            operation: operation.to_string(),
        }
    }

    /// Fail if cancelled or past the deadline.
    pub fn check(&self, operation: &str) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Self::cancelled_error(operation));
        }
        match self.deadline {
            Some((at, _)) if Instant::now() >= at => Err(self.deadline_error(operation)),
            _ => Ok(()),
        }
    }

    /// Sleep unless cancellation or the deadline comes first.
    pub async fn sleep(&self, operation: &str, duration: Duration) -> Result<()> {
        self.run(operation, async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }

    /// Race `fut` against cancellation and the deadline.
    pub async fn run<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check(operation)?;
        let deadline = async {
            match self.deadline {
                Some((at, _)) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Self::cancelled_error(operation)),
            _ = deadline => Err(self.deadline_error(operation)),
            res = fut => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_cf016_deadline_interrupts_sleep() {
        let ctx = TaskContext::new().with_timeout(Duration::from_secs(5));
        let err = ctx
            .sleep("waiting for stack", Duration::from_secs(60))
            .await
            .unwrap_err();
        match err {
            Error::DeadlineExceeded { operation, after } => {
                assert_eq!(operation, "waiting for stack");
                assert_eq!(after, Duration::from_secs(5));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cf016_cancel_interrupts_sleep() {
        let ctx = TaskContext::new();
        let handle = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.sleep("poll", Duration::from_secs(3600)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        ctx.cancel();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
        assert!(err.is_cancellation());
    }

    #[tokio::test]
    async fn test_cf016_child_cancel_isolated() {
        let parent = TaskContext::new();
        let child = parent.child();
        child.cancel();
        assert!(child.check("x").is_err());
        assert!(parent.check("x").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cf016_earlier_deadline_wins() {
        let ctx = TaskContext::new()
            .with_timeout(Duration::from_secs(1))
            .with_timeout(Duration::from_secs(100));
        let err = ctx.sleep("op", Duration::from_secs(10)).await.unwrap_err();
        assert!(matches!(
            err,
            Error::DeadlineExceeded { after, .. } if after == Duration::from_secs(1)
        ));
    }
}
