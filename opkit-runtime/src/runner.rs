//! Cooperative lifecycle management for long-running parts.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Boxed error a [`Runnable`] may exit with.
pub type RunError = Box<dyn std::error::Error + Send + Sync>;

/// A long-running component driven by a cancellation token.
#[async_trait]
pub trait Runnable: Send + 'static {
    /// Name used in logs and error reports.
    fn name(&self) -> &str {
        "runnable"
    }

    /// Run until completion or until `cancel` fires.
    async fn run(self: Box<Self>, cancel: CancellationToken) -> Result<(), RunError>;
}

/// Errors surfaced by [`MultiRunner::run`].
#[derive(Debug, Error)]
pub enum Error {
    /// A child exited with an error
    #[error("runner {name} failed: {source}")]
    RunnableFailed {
        /// The child's name
        name: String,
        /// The child's error
        #[source]
        source: RunError,
    },
    /// A child panicked
    #[error("runner {name} panicked")]
    RunnablePanicked {
        /// The child's name
        name: String,
    },
    /// Children were abandoned after the shutdown grace period
    #[error("{count} runner(s) abandoned after the shutdown grace period")]
    GracePeriodExceeded {
        /// How many children were still running
        count: usize,
    },
}

/// Runs a set of [`Runnable`]s as one unit.
///
/// All children start together. When any child exits, or the external token
/// fires, the rest are cancelled and awaited (bounded by the optional grace
/// period). The first error encountered wins.
#[derive(Default)]
pub struct MultiRunner {
    runnables: Vec<Box<dyn Runnable>>,
    grace_period: Option<Duration>,
}

impl MultiRunner {
    /// An empty runner with no grace period (waits forever on shutdown).
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a child.
    pub fn add(&mut self, runnable: Box<dyn Runnable>) {
        self.runnables.push(runnable);
    }

    /// Abandon children still running this long after cancellation.
    pub fn set_grace_period(&mut self, grace: Option<Duration>) {
        self.grace_period = grace;
    }

    /// Run all children to completion.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), Error> {
        let child_cancel = cancel.child_token();
        let mut children: JoinSet<(String, Result<(), RunError>)> = JoinSet::new();
        for runnable in self.runnables {
            let name = runnable.name().to_string();
            let token = child_cancel.clone();
            children.spawn(async move { (name.clone(), runnable.run(token).await) });
        }
        info!(children = children.len(), "runner started");

        let mut first_error: Option<Error> = None;
        tokio::select! {
            () = cancel.cancelled() => {
                info!("runner cancelled externally");
            }
            exited = children.join_next() => {
                if let Some(exited) = exited {
                    first_error = Self::child_error(exited);
                }
            }
        }

        // one child down (or external cancel): bring down the rest
        child_cancel.cancel();
        let drain = async {
            while let Some(exited) = children.join_next().await {
                let error = Self::child_error(exited);
                if first_error.is_none() {
                    first_error = error;
                }
            }
        };
        match self.grace_period {
            Some(grace) => {
                if tokio::time::timeout(grace, drain).await.is_err() {
                    let count = children.len();
                    children.abort_all();
                    warn!(count, "abandoning runners after grace period");
                    if first_error.is_none() {
                        first_error = Some(Error::GracePeriodExceeded { count });
                    }
                }
            }
            None => drain.await,
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn child_error(
        exited: Result<(String, Result<(), RunError>), tokio::task::JoinError>,
    ) -> Option<Error> {
        match exited {
            Ok((_, Ok(()))) => None,
            Ok((name, Err(source))) => Some(Error::RunnableFailed { name, source }),
            Err(join_err) => {
                if join_err.is_cancelled() {
                    None
                } else {
                    Some(Error::RunnablePanicked {
                        name: "unknown".to_string(),
                    })
                }
            }
        }
    }
}

#[async_trait]
impl Runnable for MultiRunner {
    fn name(&self) -> &str {
        "multi-runner"
    }

    async fn run(self: Box<Self>, cancel: CancellationToken) -> Result<(), RunError> {
        (*self).run(cancel).await.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::time::sleep;

    use super::*;

    /// Runs until cancelled, optionally failing first after a delay.
    struct Child {
        name: String,
        fail_after: Option<Duration>,
        stopped: Arc<Mutex<Vec<String>>>,
        /// Delay between cancellation and actually returning.
        shutdown_lag: Duration,
    }

    impl Child {
        fn well_behaved(name: &str, stopped: &Arc<Mutex<Vec<String>>>) -> Box<Self> {
            Box::new(Self {
                name: name.to_string(),
                fail_after: None,
                stopped: stopped.clone(),
                shutdown_lag: Duration::ZERO,
            })
        }
    }

    #[async_trait]
    impl Runnable for Child {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(self: Box<Self>, cancel: CancellationToken) -> Result<(), RunError> {
            let outcome = match self.fail_after {
                Some(delay) => {
                    tokio::select! {
                        () = cancel.cancelled() => Ok(()),
                        () = sleep(delay) => Err(format!("{} blew up", self.name).into()),
                    }
                }
                None => {
                    cancel.cancelled().await;
                    Ok(())
                }
            };
            sleep(self.shutdown_lag).await;
            self.stopped.lock().push(self.name.clone());
            outcome
        }
    }

    #[tokio::test(start_paused = true)]
    async fn external_cancel_stops_every_child() {
        let stopped = Arc::new(Mutex::new(Vec::new()));
        let mut runner = MultiRunner::new();
        runner.add(Child::well_behaved("a", &stopped));
        runner.add(Child::well_behaved("b", &stopped));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(runner.run(cancel.clone()));
        sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        let mut names = stopped.lock().clone();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn first_failure_cancels_siblings_and_wins() {
        let stopped = Arc::new(Mutex::new(Vec::new()));
        let mut runner = MultiRunner::new();
        runner.add(Box::new(Child {
            name: "flaky".into(),
            fail_after: Some(Duration::from_secs(1)),
            stopped: stopped.clone(),
            shutdown_lag: Duration::ZERO,
        }));
        runner.add(Child::well_behaved("steady", &stopped));

        let err = runner.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::RunnableFailed { name, .. } if name == "flaky"));
        assert!(stopped.lock().contains(&"steady".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn grace_period_abandons_laggards() {
        let stopped = Arc::new(Mutex::new(Vec::new()));
        let mut runner = MultiRunner::new();
        runner.add(Box::new(Child {
            name: "laggard".into(),
            fail_after: None,
            stopped: stopped.clone(),
            shutdown_lag: Duration::from_secs(3600),
        }));
        runner.set_grace_period(Some(Duration::from_secs(5)));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(runner.run(cancel.clone()));
        sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::GracePeriodExceeded { count: 1 }));
        assert!(stopped.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn nested_runners_compose() {
        let stopped = Arc::new(Mutex::new(Vec::new()));
        let mut inner = MultiRunner::new();
        inner.add(Child::well_behaved("nested", &stopped));
        let mut outer = MultiRunner::new();
        outer.add(Box::new(inner));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(outer.run(cancel.clone()));
        sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(*stopped.lock(), vec!["nested"]);
    }
}
