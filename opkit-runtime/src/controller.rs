//! Multiplexes informers into per-pair event queues drained by reconcilers.
//!
//! Every registered (informer, reconciler) pair owns one [`EventQueue`] and
//! a set of workers. Pairs are isolated failure domains: an error in one
//! never touches another, and the only global surface is the advisory error
//! handler.

use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use ahash::AHashMap;
use futures::FutureExt;
use opkit_core::ObjectRef;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{task::JoinSet, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    informer::{self, EventHandler, HandlerError, Informer, ResourceEvent},
    queue::{Disposition, EventQueue, QueuedItem},
    ratelimit::{default_rate_limiter, RateLimiter},
    reconcile::{
        ObjectState, ReconcileAction, ReconcileError, ReconcileRequest, ReconcileResult,
        Reconciler, StateHint,
    },
};

/// Default period workers are given to finish in-flight reconciles on
/// shutdown.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(30);

/// Errors surfaced through the controller's error handler.
///
/// The handler is advisory: reporting has no side effects on controller
/// state.
#[derive(Debug, Error)]
pub enum Error {
    /// Forwarded from an informer's error callback
    #[error("informer {informer} failed: {source}")]
    Informer {
        /// The informer's registration id
        informer: String,
        /// The underlying informer error
        #[source]
        source: informer::Error,
    },
    /// A reconcile attempt returned an error
    #[error("reconcile failed for {obj_ref}: {source}")]
    ReconcileFailed {
        /// The key being reconciled
        obj_ref: ObjectRef,
        /// The reconciler's error
        #[source]
        source: ReconcileError,
    },
    /// A reconcile attempt panicked; treated as a transient failure
    #[error("reconciler panicked for {obj_ref}")]
    ReconcilePanicked {
        /// The key being reconciled
        obj_ref: ObjectRef,
    },
    /// A per-reconciler retry cap was hit and the key was dropped
    #[error("gave up on {obj_ref} after {attempts} attempts")]
    RetriesExhausted {
        /// The key that was dropped
        obj_ref: ObjectRef,
        /// Failed attempts at the moment of giving up
        attempts: u32,
    },
    /// Workers were abandoned because the drain grace period elapsed
    #[error("{pending} worker(s) abandoned after the shutdown grace period")]
    DrainTimedOut {
        /// Workers still running when the grace period ended
        pending: usize,
    },
    /// A reconciler was registered against an unknown informer id
    #[error("no informer registered under id {informer:?}")]
    UnknownInformer {
        /// The offending id
        informer: String,
    },
}

/// Callback receiving every [`Error`] the controller encounters.
pub type ErrorHandler = Arc<dyn Fn(Error) + Send + Sync>;

/// Per-reconciler retry opt-ins.
#[derive(Clone, Copy, Debug, Default)]
pub struct RetryPolicy {
    /// Drop a key after this many failed attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

/// Per-pair event gate, applied before enqueueing.
pub type EventFilter = Arc<dyn Fn(&ResourceEvent) -> bool + Send + Sync>;

/// Options for registering a reconciler.
#[derive(Clone, Default)]
pub struct ReconcilerOptions {
    /// Reject events before they reach this pair's queue.
    pub filter: Option<EventFilter>,
    /// Retry opt-ins for this pair.
    pub retry_policy: RetryPolicy,
}

struct Registration {
    informer_id: String,
    reconciler: Arc<dyn Reconciler>,
    options: ReconcilerOptions,
}

type PairQueue = EventQueue<ObjectRef, ResourceEvent>;

/// Composes N informers and M reconcilers under one lifecycle.
pub struct InformerController {
    informers: Vec<(String, Informer)>,
    registrations: Vec<Registration>,
    error_handler: ErrorHandler,
    rate_limiter: Arc<dyn RateLimiter>,
    workers_per_pair: usize,
    drain_grace: Option<Duration>,
}

impl Default for InformerController {
    fn default() -> Self {
        Self::new()
    }
}

impl InformerController {
    /// An empty controller with default error handling (structured logs),
    /// the default rate limiter and one worker per pair.
    pub fn new() -> Self {
        Self {
            informers: Vec::new(),
            registrations: Vec::new(),
            error_handler: Arc::new(|err| error!(error = %err, "controller error")),
            rate_limiter: Arc::new(default_rate_limiter()),
            workers_per_pair: 1,
            drain_grace: Some(DEFAULT_DRAIN_GRACE),
        }
    }

    /// Register an informer under an id reconcilers can bind to.
    pub fn add_informer(&mut self, id: &str, informer: Informer) {
        self.informers.push((id.to_string(), informer));
    }

    /// Register a reconciler against an informer id with default options.
    pub fn add_reconciler(&mut self, informer_id: &str, reconciler: Arc<dyn Reconciler>) {
        self.add_reconciler_with(informer_id, reconciler, ReconcilerOptions::default());
    }

    /// Register a reconciler with an event filter and/or retry policy.
    pub fn add_reconciler_with(
        &mut self,
        informer_id: &str,
        reconciler: Arc<dyn Reconciler>,
        options: ReconcilerOptions,
    ) {
        self.registrations.push(Registration {
            informer_id: informer_id.to_string(),
            reconciler,
            options,
        });
    }

    /// Replace the advisory error handler.
    pub fn set_error_handler(&mut self, handler: ErrorHandler) {
        self.error_handler = handler;
    }

    /// Replace the retry rate limiter.
    pub fn set_rate_limiter(&mut self, limiter: Arc<dyn RateLimiter>) {
        self.rate_limiter = limiter;
    }

    /// Workers draining each pair's queue concurrently. Keys stay serial
    /// regardless of this setting.
    pub fn set_workers_per_pair(&mut self, workers: usize) {
        self.workers_per_pair = workers.max(1);
    }

    /// How long workers get to finish in-flight reconciles on shutdown.
    /// `None` waits forever.
    pub fn set_drain_grace(&mut self, grace: Option<Duration>) {
        self.drain_grace = grace;
    }

    /// Run everything until `cancel` fires, then shut down in order:
    /// informers first (quiescing event production), then queues, then
    /// workers (with the drain grace period).
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), Error> {
        for registration in &self.registrations {
            if !self
                .informers
                .iter()
                .any(|(id, _)| *id == registration.informer_id)
            {
                return Err(Error::UnknownInformer {
                    informer: registration.informer_id.clone(),
                });
            }
        }

        // one queue and worker set per (informer, reconciler) pair
        let mut routes_by_informer: AHashMap<String, Vec<Route>> = AHashMap::new();
        let mut pairs = Vec::new();
        for registration in self.registrations.drain(..) {
            let queue = Arc::new(PairQueue::new());
            routes_by_informer
                .entry(registration.informer_id.clone())
                .or_default()
                .push(Route {
                    filter: registration.options.filter.clone(),
                    queue: queue.clone(),
                });
            pairs.push(Arc::new(Pair {
                queue,
                reconciler: registration.reconciler,
                retry_policy: registration.options.retry_policy,
                rate_limiter: self.rate_limiter.clone(),
                error_handler: self.error_handler.clone(),
                state_hints: Mutex::new(AHashMap::new()),
            }));
        }

        let informer_cancel = cancel.child_token();
        let mut informer_tasks = JoinSet::new();
        for (id, mut informer) in self.informers.drain(..) {
            let routes = routes_by_informer.remove(&id).unwrap_or_default();
            informer.add_event_handler(Arc::new(Router { routes }));
            let handler = self.error_handler.clone();
            let informer_id = id.clone();
            informer.set_error_callback(Arc::new(move |source| {
                handler(Error::Informer {
                    informer: informer_id.clone(),
                    source,
                });
            }));
            let token = informer_cancel.clone();
            debug!(informer = %id, "starting informer");
            informer_tasks.spawn(async move { informer.run(token).await });
        }

        let mut worker_tasks = JoinSet::new();
        for pair in &pairs {
            for _ in 0..self.workers_per_pair {
                let pair = pair.clone();
                worker_tasks.spawn(async move { pair.worker_loop().await });
            }
        }
        info!(
            informers = informer_tasks.len(),
            pairs = pairs.len(),
            "controller running"
        );

        cancel.cancelled().await;
        info!("controller shutting down");

        // informers stop first so event production quiesces
        informer_cancel.cancel();
        while informer_tasks.join_next().await.is_some() {}

        for pair in &pairs {
            pair.queue.shutdown();
        }

        let drain = async {
            while worker_tasks.join_next().await.is_some() {}
        };
        match self.drain_grace {
            Some(grace) => {
                if tokio::time::timeout(grace, drain).await.is_err() {
                    let pending = worker_tasks.len();
                    worker_tasks.abort_all();
                    warn!(pending, "abandoning workers after drain grace period");
                    (self.error_handler)(Error::DrainTimedOut { pending });
                }
            }
            None => drain.await,
        }
        Ok(())
    }
}

/// Fan-out from one informer into its pairs' queues.
struct Router {
    routes: Vec<Route>,
}

struct Route {
    filter: Option<EventFilter>,
    queue: Arc<PairQueue>,
}

#[async_trait::async_trait]
impl EventHandler for Router {
    async fn handle(&self, event: ResourceEvent) -> Result<(), HandlerError> {
        let key = event.object_ref();
        for route in &self.routes {
            if route.filter.as_ref().map_or(true, |accept| accept(&event)) {
                route.queue.add(key.clone(), event.clone());
            }
        }
        Ok(())
    }
}

/// Everything one (informer, reconciler) pair's workers share.
struct Pair {
    queue: Arc<PairQueue>,
    reconciler: Arc<dyn Reconciler>,
    retry_policy: RetryPolicy,
    rate_limiter: Arc<dyn RateLimiter>,
    error_handler: ErrorHandler,
    /// Opaque baggage returned by the last attempt per key.
    state_hints: Mutex<AHashMap<ObjectRef, StateHint>>,
}

impl Pair {
    async fn worker_loop(&self) {
        while let Some((key, item)) = self.queue.get().await {
            let disposition = self.process(&key, item).await;
            self.queue.done(&key, disposition);
        }
    }

    async fn process(&self, key: &ObjectRef, item: QueuedItem<ResourceEvent>) -> Disposition {
        let request = self.build_request(key, item.event, item.attempts);
        let attempt = AssertUnwindSafe(self.reconciler.reconcile(request))
            .catch_unwind()
            .await;
        match attempt {
            Ok(Ok(result)) => self.apply_success(key, result),
            Ok(Err(err)) => {
                let floor = err.retry_after();
                (self.error_handler)(Error::ReconcileFailed {
                    obj_ref: key.clone(),
                    source: err,
                });
                self.retry(key, item.attempts, floor)
            }
            Err(_panic) => {
                (self.error_handler)(Error::ReconcilePanicked {
                    obj_ref: key.clone(),
                });
                self.retry(key, item.attempts, None)
            }
        }
    }

    fn build_request(
        &self,
        key: &ObjectRef,
        event: ResourceEvent,
        attempt: u32,
    ) -> ReconcileRequest {
        let state_hint = self.state_hints.lock().get(key).cloned();
        let (action, object_state, object, old_object) = match event {
            ResourceEvent::Added(obj) => {
                (ReconcileAction::Created, ObjectState::NewObject, obj, None)
            }
            ResourceEvent::Updated { old, new } => (
                ReconcileAction::Updated,
                ObjectState::ExistingObject,
                new,
                Some(old),
            ),
            ResourceEvent::Deleted(obj) => {
                (ReconcileAction::Deleted, ObjectState::DeletedObject, obj, None)
            }
            ResourceEvent::Resynced(obj) => {
                (ReconcileAction::Resynced, ObjectState::ExistingObject, obj, None)
            }
        };
        ReconcileRequest {
            action,
            object,
            old_object,
            object_state,
            state_hint,
            attempt,
        }
    }

    fn apply_success(&self, key: &ObjectRef, result: ReconcileResult) -> Disposition {
        match result.state_hint {
            Some(hint) => {
                self.state_hints.lock().insert(key.clone(), hint);
            }
            None => {
                self.state_hints.lock().remove(key);
            }
        }
        match result.requeue_after {
            // a successful attempt always resets the attempt counter
            Some(delay) => Disposition::Requeue {
                not_before: Instant::now() + delay,
                attempts: 0,
            },
            None => {
                self.state_hints.lock().remove(key);
                Disposition::Forget
            }
        }
    }

    fn retry(&self, key: &ObjectRef, attempts: u32, floor: Option<Duration>) -> Disposition {
        let next_attempts = attempts + 1;
        if let Some(max) = self.retry_policy.max_attempts {
            if next_attempts >= max {
                (self.error_handler)(Error::RetriesExhausted {
                    obj_ref: key.clone(),
                    attempts: next_attempts,
                });
                self.state_hints.lock().remove(key);
                return Disposition::Forget;
            }
        }
        let mut delay = self.rate_limiter.when(attempts);
        if let Some(floor) = floor {
            // a reconciler-requested delay never shortens the backoff
            delay = delay.max(floor);
        }
        Disposition::Requeue {
            not_before: Instant::now() + delay,
            attempts: next_attempts,
        }
    }
}
