//! Watches one kind for changes, with caching and error recovery.
//!
//! An [`Informer`] maintains an in-memory index of a kind within one
//! namespace scope and emits a synthesized sequence of [`ResourceEvent`]s to
//! its subscribed handlers: a paginated list seeds the cache, a long watch
//! keeps it current, and periodic resync sweeps re-deliver cached objects so
//! downstream state can self-heal.

use std::{fmt, sync::Arc, time::Duration};

use ahash::AHashMap;
use async_trait::async_trait;
use futures::StreamExt;
use opkit_core::{
    Error as ClientError, ErrorResponse, ListParams, ObjectRef, Resource, ResourceClient,
    WatchEvent, WatchParams, WatchStream,
};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::time::{interval_at, sleep, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::queue::Coalescible;
use crate::utils::{Backoff, DefaultBackoff};

/// How often the cache is swept with `Resynced` events unless configured
/// otherwise. Zero disables the sweep.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(600);

/// Errors reported through an informer's error callback.
///
/// The informer itself never gives up: every failure backs off and restarts
/// the list/watch machinery.
#[derive(Debug, Error)]
pub enum Error {
    /// An object list call failed
    #[error("failed to perform object list: {0}")]
    ListFailed(#[source] ClientError),
    /// A watch could not be opened
    #[error("failed to start watching: {0}")]
    WatchStartFailed(#[source] ClientError),
    /// The server pushed an error frame on the watch stream
    #[error("error returned by the server during watch: {0}")]
    WatchError(#[source] ErrorResponse),
    /// The watch stream itself failed
    #[error("watch stream failed: {0}")]
    WatchFailed(#[source] ClientError),
    /// A subscribed handler rejected an event
    #[error("event handler failed for {obj_ref}: {source}")]
    HandlerFailed {
        /// The object whose event was being handled
        obj_ref: ObjectRef,
        /// The handler's error
        #[source]
        source: HandlerError,
    },
}

/// Boxed error type handlers may fail with.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A change observed (or synthesized) by an [`Informer`].
///
/// Events carry full object snapshots, never diffs.
#[derive(Clone, PartialEq)]
pub enum ResourceEvent {
    /// An object appeared.
    Added(Resource),
    /// An object changed.
    Updated {
        /// The last state seen before this change.
        old: Resource,
        /// The new state.
        new: Resource,
    },
    /// An object went away.
    Deleted(Resource),
    /// A cache sweep re-delivered an object without any change.
    Resynced(Resource),
}

impl ResourceEvent {
    /// The snapshot this event is about (the newer one for updates).
    pub fn resource(&self) -> &Resource {
        match self {
            ResourceEvent::Added(r)
            | ResourceEvent::Deleted(r)
            | ResourceEvent::Resynced(r) => r,
            ResourceEvent::Updated { new, .. } => new,
        }
    }

    /// Cache/queue identity of the object.
    pub fn object_ref(&self) -> ObjectRef {
        self.resource().object_ref()
    }
}

impl fmt::Debug for ResourceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceEvent::Added(r) => write!(f, "Added({})", r.object_ref()),
            ResourceEvent::Updated { new, .. } => write!(f, "Updated({})", new.object_ref()),
            ResourceEvent::Deleted(r) => write!(f, "Deleted({})", r.object_ref()),
            ResourceEvent::Resynced(r) => write!(f, "Resynced({})", r.object_ref()),
        }
    }
}

const PRIORITY_RESYNC: u8 = 1;
const PRIORITY_CHANGE: u8 = 2;
const PRIORITY_DELETE: u8 = 3;

impl Coalescible for ResourceEvent {
    fn coalesce(self, newer: Self) -> Self {
        use ResourceEvent::{Added, Deleted, Resynced, Updated};
        match (self, newer) {
            // a tombstone absorbs anything queued before it
            (_, tombstone @ Deleted(_)) => tombstone,
            // resync carries no information a stored event lacks
            (Resynced(_), newer) => newer,
            (stored, Resynced(_)) => stored,
            // an unobserved creation stays a creation through later edits
            (Added(_), Updated { new, .. }) => Added(new),
            // successive edits span from the oldest unobserved state
            (Updated { old, .. }, Updated { new, .. }) => Updated { old, new },
            (_, newer) => newer,
        }
    }

    fn priority(&self) -> u8 {
        match self {
            ResourceEvent::Deleted(_) => PRIORITY_DELETE,
            ResourceEvent::Added(_) | ResourceEvent::Updated { .. } => PRIORITY_CHANGE,
            ResourceEvent::Resynced(_) => PRIORITY_RESYNC,
        }
    }
}

/// Receives events from an [`Informer`].
///
/// A failing handler is reported to the informer's error callback and never
/// disturbs the informer or its other handlers.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one event.
    async fn handle(&self, event: ResourceEvent) -> Result<(), HandlerError>;
}

type ErrorCallback = Arc<dyn Fn(Error) + Send + Sync>;

/// The list+watch+cache pipeline for one kind in one namespace scope.
pub struct Informer {
    client: Arc<dyn ResourceClient>,
    name: String,
    namespace: Option<String>,
    list_params: ListParams,
    watch_params: WatchParams,
    resync_interval: Duration,
    cache: RwLock<AHashMap<ObjectRef, Resource>>,
    handlers: Vec<Arc<dyn EventHandler>>,
    error_callback: Option<ErrorCallback>,
}

impl Informer {
    /// Create an informer over `client`, watching at cluster scope with the
    /// default resync interval.
    pub fn new(client: Arc<dyn ResourceClient>) -> Self {
        Self {
            client,
            name: "informer".to_string(),
            namespace: None,
            list_params: ListParams::default(),
            watch_params: WatchParams::default(),
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            cache: RwLock::new(AHashMap::new()),
            handlers: Vec::new(),
            error_callback: None,
        }
    }

    /// Label used in logs and error reports.
    #[must_use]
    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Restrict to one namespace.
    #[must_use]
    pub fn namespaced(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    /// Restrict to objects matching a label selector.
    #[must_use]
    pub fn with_label_selector(mut self, selector: &str) -> Self {
        self.list_params.label_selector = Some(selector.to_string());
        self.watch_params.label_selector = Some(selector.to_string());
        self
    }

    /// Restrict list calls with a field selector.
    #[must_use]
    pub fn with_field_selector(mut self, selector: &str) -> Self {
        self.list_params.field_selector = Some(selector.to_string());
        self
    }

    /// Cap list page sizes.
    #[must_use]
    pub fn with_page_limit(mut self, limit: u32) -> Self {
        self.list_params.limit = Some(limit);
        self
    }

    /// Change the periodic resync interval; zero disables the sweep.
    #[must_use]
    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    /// Subscribe a handler. All handlers see every emitted event.
    pub fn add_event_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Install the callback receiving [`Error`] reports.
    pub fn set_error_callback(&mut self, callback: ErrorCallback) {
        self.error_callback = Some(callback);
    }

    /// The informer's log label.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A copy of the cached object for `key`, if present.
    pub fn cached(&self, key: &ObjectRef) -> Option<Resource> {
        self.cache.read().get(key).cloned()
    }

    /// A snapshot of the full cache contents.
    pub fn cache_state(&self) -> Vec<Resource> {
        self.cache.read().values().cloned().collect()
    }

    /// Drive the informer until `cancel` fires.
    ///
    /// All failures are reported through the error callback and recovered
    /// with jittered exponential backoff; the only way out is cancellation.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), Error> {
        let mut backoff = DefaultBackoff::default();
        let mut resync = self.resync_ticker();
        let mut state = State::Empty;
        let mut has_listed = false;

        loop {
            state = match state {
                State::Empty => tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Ok(()),
                    res = self.list_all() => match res {
                        Ok((items, resource_version)) => {
                            trace!(informer = %self.name, objects = items.len(), "list complete");
                            self.apply_list(items).await;
                            // a re-list follows downtime, so re-deliver
                            // everything for downstream state checks
                            if has_listed {
                                self.resync_sweep().await;
                            }
                            has_listed = true;
                            backoff.reset();
                            State::InitListed { resource_version }
                        }
                        Err(err) => {
                            self.report(Error::ListFailed(err));
                            if !self.backoff_sleep(&mut backoff, &cancel).await {
                                return Ok(());
                            }
                            State::Empty
                        }
                    },
                },
                State::InitListed { resource_version } => tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Ok(()),
                    res = self.client.watch(
                        self.namespace.as_deref(),
                        &resource_version,
                        &self.watch_params,
                    ) => match res {
                        Ok(stream) => {
                            debug!(informer = %self.name, %resource_version, "watch established");
                            State::Watching { resource_version, stream }
                        }
                        Err(err) => {
                            let relist = matches!(err, ClientError::Gone);
                            self.report(Error::WatchStartFailed(err));
                            if !self.backoff_sleep(&mut backoff, &cancel).await {
                                return Ok(());
                            }
                            if relist {
                                State::Empty
                            } else {
                                State::InitListed { resource_version }
                            }
                        }
                    },
                },
                State::Watching {
                    mut resource_version,
                    mut stream,
                } => tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Ok(()),
                    () = Self::tick(&mut resync) => {
                        self.resync_sweep().await;
                        State::Watching { resource_version, stream }
                    }
                    frame = stream.next() => match frame {
                        Some(Ok(event)) => match self.apply_watch_event(event).await {
                            WatchOutcome::Continue(new_version) => {
                                if let Some(version) = new_version {
                                    resource_version = version;
                                }
                                State::Watching { resource_version, stream }
                            }
                            WatchOutcome::Relist => {
                                if !self.backoff_sleep(&mut backoff, &cancel).await {
                                    return Ok(());
                                }
                                State::Empty
                            }
                        },
                        Some(Err(err)) => {
                            let relist = matches!(err, ClientError::Gone);
                            self.report(Error::WatchFailed(err));
                            if !self.backoff_sleep(&mut backoff, &cancel).await {
                                return Ok(());
                            }
                            if relist {
                                State::Empty
                            } else {
                                State::InitListed { resource_version }
                            }
                        }
                        None => {
                            trace!(informer = %self.name, "watch stream ended, re-watching");
                            State::InitListed { resource_version }
                        }
                    },
                },
            };
        }
    }

    fn resync_ticker(&self) -> Option<Interval> {
        if self.resync_interval.is_zero() {
            return None;
        }
        let mut ticker = interval_at(Instant::now() + self.resync_interval, self.resync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(ticker)
    }

    async fn tick(resync: &mut Option<Interval>) {
        match resync {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => futures::future::pending().await,
        }
    }

    /// Paginate a full list; the final page's resource version is the watch
    /// start point.
    async fn list_all(&self) -> Result<(Vec<Resource>, String), ClientError> {
        let mut params = self.list_params.clone();
        params.continue_token = None;
        let mut items = Vec::new();
        loop {
            let page = self.client.list(self.namespace.as_deref(), &params).await?;
            items.extend(page.items);
            match page.continue_token {
                Some(token) if !token.is_empty() => params.continue_token = Some(token),
                _ => return Ok((items, page.resource_version)),
            }
        }
    }

    /// Replace the cache with the listed population, emitting the diff.
    async fn apply_list(&self, items: Vec<Resource>) {
        let mut events = Vec::new();
        {
            let mut cache = self.cache.write();
            let mut next = AHashMap::with_capacity(items.len());
            for obj in items {
                let key = obj.object_ref();
                match cache.remove(&key) {
                    None => events.push(ResourceEvent::Added(obj.clone())),
                    Some(old) if old.uid() != obj.uid() => {
                        // same coordinates, different object: the delete was missed
                        events.push(ResourceEvent::Deleted(old));
                        events.push(ResourceEvent::Added(obj.clone()));
                    }
                    Some(old) if old != obj => {
                        events.push(ResourceEvent::Updated {
                            old,
                            new: obj.clone(),
                        });
                    }
                    Some(_) => {}
                }
                next.insert(key, obj);
            }
            // cached objects missing from the list are gone
            for (_, leftover) in cache.drain() {
                events.push(ResourceEvent::Deleted(leftover));
            }
            *cache = next;
        }
        for event in events {
            self.dispatch(event).await;
        }
    }

    /// Apply one watch frame to the cache and emit the matching event.
    async fn apply_watch_event(&self, event: WatchEvent) -> WatchOutcome {
        match event {
            WatchEvent::Added(obj) => {
                let version = obj.resource_version().to_string();
                let emit = {
                    let mut cache = self.cache.write();
                    let key = obj.object_ref();
                    let already_seen = cache
                        .get(&key)
                        .is_some_and(|cached| cached.resource_version() == obj.resource_version());
                    if already_seen {
                        None
                    } else {
                        cache.insert(key, obj.clone());
                        Some(ResourceEvent::Added(obj))
                    }
                };
                if let Some(event) = emit {
                    self.dispatch(event).await;
                }
                WatchOutcome::Continue(Some(version))
            }
            WatchEvent::Modified(obj) => {
                let version = obj.resource_version().to_string();
                let emit = {
                    let mut cache = self.cache.write();
                    let key = obj.object_ref();
                    match cache.insert(key, obj.clone()) {
                        None => Some(ResourceEvent::Added(obj)),
                        Some(old) if content_equal(&old, &obj) => None,
                        Some(old) => Some(ResourceEvent::Updated { old, new: obj }),
                    }
                };
                if let Some(event) = emit {
                    self.dispatch(event).await;
                }
                WatchOutcome::Continue(Some(version))
            }
            WatchEvent::Deleted(obj) => {
                let version = obj.resource_version().to_string();
                let removed = self.cache.write().remove(&obj.object_ref());
                self.dispatch(ResourceEvent::Deleted(removed.unwrap_or(obj)))
                    .await;
                WatchOutcome::Continue(Some(version))
            }
            WatchEvent::Bookmark(bookmark) => {
                trace!(
                    informer = %self.name,
                    resource_version = %bookmark.resource_version,
                    "bookmark",
                );
                WatchOutcome::Continue(Some(bookmark.resource_version))
            }
            WatchEvent::Error(err) => {
                let desynced = err.code == 410;
                self.report(Error::WatchError(err));
                if desynced {
                    WatchOutcome::Relist
                } else {
                    WatchOutcome::Continue(None)
                }
            }
        }
    }

    /// Re-deliver every cached object as `Resynced`, without contacting the
    /// server.
    async fn resync_sweep(&self) {
        let snapshot = self.cache_state();
        debug!(informer = %self.name, objects = snapshot.len(), "resync sweep");
        for obj in snapshot {
            self.dispatch(ResourceEvent::Resynced(obj)).await;
        }
    }

    async fn dispatch(&self, event: ResourceEvent) {
        for handler in &self.handlers {
            if let Err(source) = handler.handle(event.clone()).await {
                self.report(Error::HandlerFailed {
                    obj_ref: event.object_ref(),
                    source,
                });
            }
        }
    }

    fn report(&self, err: Error) {
        match &self.error_callback {
            Some(callback) => callback(err),
            None => warn!(informer = %self.name, error = %err, "informer error"),
        }
    }

    /// Sleep the next backoff delay; false means cancellation fired first.
    async fn backoff_sleep(&self, backoff: &mut DefaultBackoff, cancel: &CancellationToken) -> bool {
        let delay = backoff.next().unwrap_or(Duration::from_secs(30));
        debug!(informer = %self.name, ?delay, "backing off");
        tokio::select! {
            () = cancel.cancelled() => false,
            () = sleep(delay) => true,
        }
    }
}

/// Objects are compared net of the version token, so that version-only
/// churn (managed fields, no-op writes) emits nothing.
fn content_equal(old: &Resource, new: &Resource) -> bool {
    let mut old = old.clone();
    old.metadata.resource_version = new.metadata.resource_version.clone();
    old == *new
}

/// The finite state machine driving [`Informer::run`].
enum State {
    /// The next step is a full paginated list.
    Empty,
    /// The list succeeded; the next step opens a watch from its version.
    InitListed { resource_version: String },
    /// Frames are flowing.
    Watching {
        resource_version: String,
        stream: WatchStream,
    },
}

enum WatchOutcome {
    /// Keep watching, optionally advancing the resumption point.
    Continue(Option<String>),
    /// The stream desynced beyond recovery; relist from scratch.
    Relist,
}
