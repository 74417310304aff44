//! CF-017: Retry policy with exponential backoff and jitter.
//!
//! A `RetryPolicy` value is a template: it carries attempt state, so every
//! poll works on its own clone. `poll_until` and `retry_transient` take the
//! template by reference and clone it internally.

use super::context::TaskContext;
use crate::error::{Error, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff configuration plus the attempt counter of one poll.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of retries (0 = bounded only by the context deadline)
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Delay is scaled by a random factor in `[1 - jitter, 1 + jitter]`
    pub jitter: f64,
    attempts: u32,
    delay: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: 0.5,
            attempts: 0,
            delay: None,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Stack waiter polling: a steady ~15 s, bounded by the wait timeout.
    pub fn stack_waiter() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_secs(15),
            max_delay: Duration::from_secs(15),
            backoff_multiplier: 1.0,
            jitter: 0.15,
            attempts: 0,
            delay: None,
        }
    }

    /// Fixed delay without jitter.
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
            jitter: 0.0,
            attempts: 0,
            delay: None,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether no attempt is left.
    pub fn done(&self) -> bool {
        self.max_attempts > 0 && self.attempts >= self.max_attempts
    }

    /// Record an attempt and return how long to wait before the next one.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.done() {
            return None;
        }
        self.attempts += 1;
        let base = match self.delay {
            None => self.initial_delay,
            Some(prev) => Duration::from_secs_f64(
                (prev.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
            ),
        };
        self.delay = Some(base);
        if self.jitter <= 0.0 {
            return Some(base);
        }
        let j = self.jitter.min(1.0);
        let factor = rand::thread_rng().gen_range((1.0 - j)..=(1.0 + j));
        Some(Duration::from_secs_f64(base.as_secs_f64() * factor))
    }
}

/// One observation of a polled condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress<T> {
    Done(T),
    Pending,
}

/// Poll `op` until it reports `Done`, sleeping per a clone of `template`.
///
/// Transient errors count as a pending observation; permanent errors and
/// cancellation return at once.
pub async fn poll_until<T, F, Fut>(
    template: &RetryPolicy,
    ctx: &TaskContext,
    operation: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Progress<T>>>,
{
    let mut policy = template.clone();
    loop {
        ctx.check(operation)?;
        match ctx.run(operation, op()).await {
            Ok(Progress::Done(v)) => return Ok(v),
            Ok(Progress::Pending) => {
                debug!(operation = %operation, attempt = policy.attempts(), "still waiting");
            }
            Err(e) if e.is_transient() => {
                warn!(
                    operation = %operation,
                    attempt = policy.attempts(),
                    error = %e,
                    "transient error, retrying"
                );
            }
            Err(e) => return Err(e),
        }
        let Some(delay) = policy.next_delay() else {
            return Err(Error::RetriesExhausted {
                operation: operation.to_string(),
                attempts: policy.attempts(),
            });
        };
        ctx.sleep(operation, delay).await?;
    }
}

/// Call `op` until it succeeds, retrying transient errors only.
pub async fn retry_transient<T, F, Fut>(
    template: &RetryPolicy,
    ctx: &TaskContext,
    operation: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    poll_until(template, ctx, operation, || {
        let fut = op();
        async move { fut.await.map(Progress::Done) }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ApiError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_cf017_backoff_capped() {
        let mut p = RetryPolicy {
            jitter: 0.0,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3),
            max_attempts: 4,
            ..Default::default()
        };
        let delays: Vec<_> = std::iter::from_fn(|| p.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(3),
                Duration::from_secs(3)
            ]
        );
        assert!(p.done());
    }

    #[test]
    fn test_cf017_jitter_within_bounds() {
        let mut p = RetryPolicy::stack_waiter();
        for _ in 0..50 {
            let d = p.next_delay().unwrap().as_secs_f64();
            assert!((12.75..=17.25).contains(&d), "delay {d}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cf017_clones_isolate_concurrent_polls() {
        let template = RetryPolicy::fixed(Duration::from_secs(1), 4);
        let ctx = TaskContext::new();

        let poll = |pending: u32| {
            let template = template.clone();
            let ctx = ctx.clone();
            let calls = Arc::new(AtomicU32::new(0));
            async move {
                let c = Arc::clone(&calls);
                let res = poll_until(&template, &ctx, "wait", move || {
                    let c = Arc::clone(&c);
                    async move {
                        if c.fetch_add(1, Ordering::SeqCst) < pending {
                            Ok(Progress::Pending)
                        } else {
                            Ok(Progress::Done(()))
                        }
                    }
                })
                .await;
                (res, calls.load(Ordering::SeqCst))
            }
        };

        // each poll needs 3 retries; 6 shared attempts would exceed the limit of 4
        let (a, b) = tokio::join!(poll(3), poll(3));
        assert!(a.0.is_ok());
        assert!(b.0.is_ok());
        assert_eq!(a.1, 4);
        assert_eq!(b.1, 4);
        assert_eq!(template.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cf017_shared_template_reused_by_reference() {
        let template = Arc::new(RetryPolicy::fixed(Duration::from_millis(10), 2));
        let ctx = TaskContext::new();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let template = Arc::clone(&template);
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                let n = Arc::new(AtomicU32::new(0));
                poll_until(&template, &ctx, "wait", move || {
                    let n = Arc::clone(&n);
                    async move {
                        if n.fetch_add(1, Ordering::SeqCst) < 2 {
                            Ok(Progress::Pending)
                        } else {
                            Ok(Progress::Done(()))
                        }
                    }
                })
                .await
            }));
        }
        for h in handles {
            assert!(h.await.unwrap().is_ok());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cf017_permanent_error_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let res: Result<()> =
            retry_transient(&RetryPolicy::default(), &TaskContext::new(), "create", move || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Api(ApiError::validation("bad template"))) }
        })
        .await;
        assert!(matches!(res, Err(Error::Api(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cf017_transient_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let res =
            retry_transient(&RetryPolicy::default(), &TaskContext::new(), "describe", move || {
            let n = c.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::Api(ApiError::throttling("rate exceeded")))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(res, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cf017_exhaustion_reports_attempts() {
        let res: Result<()> = poll_until(
            &RetryPolicy::fixed(Duration::from_secs(1), 3),
            &TaskContext::new(),
            "wait",
            || async { Ok(Progress::Pending) },
        )
        .await;
        match res {
            Err(Error::RetriesExhausted { operation, attempts }) => {
                assert_eq!(operation, "wait");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cf017_deadline_stops_unbounded_poll() {
        let ctx = TaskContext::new().with_timeout(Duration::from_secs(60));
        let res: Result<()> = poll_until(&RetryPolicy::stack_waiter(), &ctx, "wait", || async {
            Ok(Progress::Pending)
        })
        .await;
        assert!(matches!(res, Err(Error::DeadlineExceeded { .. })));
    }
}
