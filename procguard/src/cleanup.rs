//! Cleanup callbacks and the serial executor that runs them in order.

use std::future::Future;

use futures::future::BoxFuture;

use crate::error::CleanupFailure;

/// Boxed cleanup callback: takes the trigger parameter, returns a future.
/// Synchronous work simply completes before the returned future resolves,
/// so callers never need to distinguish the two.
pub(crate) type Cleanup<P> = Box<dyn FnMut(P) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

pub(crate) fn boxed<P, F, Fut>(mut f: F) -> Cleanup<P>
where
    F: FnMut(P) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Box::new(move |param| -> BoxFuture<'static, anyhow::Result<()>> { Box::pin(f(param)) })
}

/// What the executor does when a cleanup fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Run every remaining cleanup and surface the failures afterward. A
    /// failed cleanup must not block unrelated cleanups from running.
    #[default]
    Continue,
    /// Stop the list at the first failure.
    Abort,
}

/// Run `cleanups` strictly in registration order against `param`: cleanup
/// *i+1* is not invoked until cleanup *i*'s future has settled, no matter
/// how long that takes. Returns the failures encountered; intermediate
/// results are discarded. How failures are surfaced is the caller's call.
pub(crate) async fn run_serial<P: Clone>(
    mut cleanups: Vec<Cleanup<P>>,
    param: P,
    policy: FailurePolicy,
) -> Vec<CleanupFailure> {
    let mut failures = Vec::new();
    for (index, cleanup) in cleanups.iter_mut().enumerate() {
        if let Err(source) = cleanup(param.clone()).await {
            failures.push(CleanupFailure { index, source });
            if policy == FailurePolicy::Abort {
                break;
            }
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;

    type Log = Arc<Mutex<Vec<String>>>;

    fn logging_cleanup(log: &Log, label: &'static str) -> Cleanup<&'static str> {
        let log = log.clone();
        boxed(move |param| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(format!("{label}:{param}"));
                Ok(())
            }
        })
    }

    /// A slow asynchronous cleanup followed by an immediate one: the
    /// immediate one must not start (let alone finish) until the slow one
    /// has fully settled.
    #[tokio::test]
    async fn mixed_sync_async_cleanups_run_in_registration_order() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let mut cleanups: Vec<Cleanup<&'static str>> = Vec::new();

        let slow_log = log.clone();
        cleanups.push(boxed(move |param| {
            let log = slow_log.clone();
            async move {
                log.lock().unwrap().push(format!("slow:start:{param}"));
                tokio::time::sleep(Duration::from_millis(50)).await;
                log.lock().unwrap().push(format!("slow:end:{param}"));
                Ok(())
            }
        }));

        let fast_log = log.clone();
        cleanups.push(boxed(move |param| {
            // Synchronous work, already settled by the time the future is awaited.
            fast_log.lock().unwrap().push(format!("fast:{param}"));
            async { Ok(()) }
        }));

        let failures = run_serial(cleanups, "SIGTERM", FailurePolicy::Continue).await;
        assert!(failures.is_empty());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["slow:start:SIGTERM", "slow:end:SIGTERM", "fast:SIGTERM"]
        );
    }

    #[tokio::test]
    async fn every_cleanup_receives_the_shared_parameter_exactly_once() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let cleanups = vec![
            logging_cleanup(&log, "a"),
            logging_cleanup(&log, "b"),
            logging_cleanup(&log, "c"),
        ];

        let failures = run_serial(cleanups, "SIGINT", FailurePolicy::Continue).await;
        assert!(failures.is_empty());
        assert_eq!(*log.lock().unwrap(), vec!["a:SIGINT", "b:SIGINT", "c:SIGINT"]);
    }

    #[tokio::test]
    async fn continue_policy_runs_remaining_cleanups_after_a_failure() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let mut cleanups: Vec<Cleanup<&'static str>> = Vec::new();
        cleanups.push(boxed(|_| async { Err(anyhow::anyhow!("flush failed")) }));
        cleanups.push(logging_cleanup(&log, "later"));

        let failures = run_serial(cleanups, "SIGTERM", FailurePolicy::Continue).await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].index, 0);
        assert_eq!(*log.lock().unwrap(), vec!["later:SIGTERM"]);
    }

    #[tokio::test]
    async fn abort_policy_stops_at_the_first_failure() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let mut cleanups: Vec<Cleanup<&'static str>> = Vec::new();
        cleanups.push(logging_cleanup(&log, "first"));
        cleanups.push(boxed(|_| async { Err(anyhow::anyhow!("flush failed")) }));
        cleanups.push(logging_cleanup(&log, "never"));

        let failures = run_serial(cleanups, "SIGTERM", FailurePolicy::Abort).await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].index, 1);
        assert_eq!(*log.lock().unwrap(), vec!["first:SIGTERM"]);
    }
}
