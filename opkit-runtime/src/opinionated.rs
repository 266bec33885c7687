//! Finalizer-backed reconciler decoration.
//!
//! [`OpinionatedReconciler`] wraps any [`Reconciler`] and layers on three
//! guarantees, all recovered from the control plane on restart (the
//! decorator holds no durable state):
//!
//! 1. deletes are never missed: a finalizer blocks server-side deletion
//!    until the wrapped cleanup has succeeded,
//! 2. replays after a restart surface as `Resynced`, not `Created`,
//! 3. updates that change nothing significant (status churn, version-only
//!    writes) are suppressed.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use opkit_core::{Resource, ResourceClient, UpdateParams};
use thiserror::Error;
use tracing::debug;

use crate::reconcile::{
    ObjectState, ReconcileAction, ReconcileError, ReconcileRequest, ReconcileResult, Reconciler,
};

/// Errors from the decorator's own control-plane writes.
#[derive(Debug, Error)]
pub enum Error {
    /// Installing the finalizer failed
    #[error("failed to add finalizer: {0}")]
    AddFinalizer(#[source] opkit_core::Error),
    /// Clearing the finalizer after successful cleanup failed
    #[error("failed to remove finalizer: {0}")]
    RemoveFinalizer(#[source] opkit_core::Error),
}

impl From<Error> for ReconcileError {
    fn from(err: Error) -> Self {
        ReconcileError::new(err)
    }
}

struct FinalizerState {
    installed: bool,
    deleting: bool,
}

impl FinalizerState {
    fn for_object(obj: &Resource, finalizer: &str) -> Self {
        Self {
            installed: obj.has_finalizer(finalizer),
            deleting: obj.is_being_deleted(),
        }
    }
}

/// Decorates a reconciler with finalizer lifecycle management.
pub struct OpinionatedReconciler<R> {
    inner: R,
    client: Arc<dyn ResourceClient>,
    finalizer: String,
}

impl<R> OpinionatedReconciler<R> {
    /// Wrap `inner`, managing `finalizer` through `client`.
    ///
    /// `finalizer` must be unique among the controllers touching the kind.
    pub fn new(inner: R, client: Arc<dyn ResourceClient>, finalizer: &str) -> Self {
        Self {
            inner,
            client,
            finalizer: finalizer.to_string(),
        }
    }

    /// The managed finalizer marker.
    pub fn finalizer(&self) -> &str {
        &self.finalizer
    }
}

impl<R: Reconciler> OpinionatedReconciler<R> {
    /// Run the wrapped cleanup, then release the finalizer.
    ///
    /// Ordering is the guarantee: the finalizer is only removed after the
    /// inner delete succeeded, so a failure leaves the object blocked and
    /// the attempt is retried.
    async fn cleanup(&self, req: ReconcileRequest) -> Result<ReconcileResult, ReconcileError> {
        let obj = req.object.clone();
        let result = self
            .inner
            .reconcile(ReconcileRequest {
                action: ReconcileAction::Deleted,
                object_state: ObjectState::DeletedObject,
                ..req
            })
            .await?;

        let mut released = obj;
        released.remove_finalizer(&self.finalizer);
        self.client
            .update(&released, &UpdateParams::default())
            .await
            .map_err(Error::RemoveFinalizer)?;
        debug!(obj_ref = %released.object_ref(), "finalizer released after cleanup");
        Ok(result)
    }

    /// First observation of a live object: install the finalizer, then let
    /// the wrapped reconciler see the creation.
    async fn adopt(&self, req: ReconcileRequest) -> Result<ReconcileResult, ReconcileError> {
        let mut claimed = req.object.clone();
        claimed.add_finalizer(&self.finalizer);
        let stored = self
            .client
            .update(&claimed, &UpdateParams::default())
            .await
            .map_err(Error::AddFinalizer)?;
        debug!(obj_ref = %stored.object_ref(), "finalizer installed");
        self.inner
            .reconcile(ReconcileRequest {
                action: ReconcileAction::Created,
                object: stored,
                old_object: None,
                object_state: ObjectState::NewObject,
                ..req
            })
            .await
    }
}

#[async_trait]
impl<R: Reconciler> Reconciler for OpinionatedReconciler<R> {
    async fn reconcile(&self, req: ReconcileRequest) -> Result<ReconcileResult, ReconcileError> {
        let state = FinalizerState::for_object(&req.object, &self.finalizer);

        if req.action == ReconcileAction::Deleted {
            // the server already hard-deleted; with the finalizer gone this
            // is terminal housekeeping, with it still present the cleanup
            // never ran and must not be missed
            return if state.installed {
                self.inner.reconcile(req).await
            } else {
                Ok(ReconcileResult::done())
            };
        }

        match state {
            FinalizerState {
                deleting: true,
                installed: true,
            } => self.cleanup(req).await,
            FinalizerState {
                deleting: true,
                installed: false,
            } => {
                // someone else's finalizer is holding the object; our
                // cleanup already ran (or never applied)
                Ok(ReconcileResult::done())
            }
            FinalizerState {
                deleting: false,
                installed: false,
            } => self.adopt(req).await,
            FinalizerState {
                deleting: false,
                installed: true,
            } => match req.action {
                // the finalizer proves a previous run saw this object:
                // replayed adds surface as resyncs
                ReconcileAction::Created => {
                    self.inner
                        .reconcile(ReconcileRequest {
                            action: ReconcileAction::Resynced,
                            object_state: ObjectState::ExistingObject,
                            ..req
                        })
                        .await
                }
                ReconcileAction::Updated => {
                    let unchanged = req
                        .old_object
                        .as_ref()
                        .is_some_and(|old| significant_content(old) == significant_content(&req.object));
                    if unchanged {
                        Ok(ReconcileResult::done())
                    } else {
                        self.inner.reconcile(req).await
                    }
                }
                ReconcileAction::Resynced => self.inner.reconcile(req).await,
                ReconcileAction::Deleted => unreachable!("tombstones are handled above"),
            },
        }
    }
}

/// The normalized view whose changes count as "real" updates: spec plus the
/// metadata a reconciler can act on. Status, resource version and other
/// server bookkeeping are excluded.
fn significant_content(obj: &Resource) -> serde_json::Value {
    serde_json::json!({
        "spec": obj.spec,
        "labels": obj.metadata.labels,
        "annotations": obj.metadata.annotations,
        "finalizers": obj.metadata.finalizers,
        "deletionTimestamp": obj.metadata.deletion_timestamp,
    })
}

type CallbackFuture = BoxFuture<'static, Result<(), ReconcileError>>;
type ObjectCallback = Box<dyn Fn(Resource) -> CallbackFuture + Send + Sync>;
type UpdateCallback = Box<dyn Fn(Option<Resource>, Resource) -> CallbackFuture + Send + Sync>;

/// A closure-based [`Reconciler`] for callers that want watch-style
/// callbacks instead of implementing the trait.
///
/// Unset callbacks succeed silently. Usually wrapped in an
/// [`OpinionatedReconciler`] so the sync/add distinction is meaningful.
#[derive(Default)]
pub struct SimpleWatcher {
    add: Option<ObjectCallback>,
    update: Option<UpdateCallback>,
    delete: Option<ObjectCallback>,
    sync: Option<ObjectCallback>,
}

impl SimpleWatcher {
    /// A watcher with no callbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called for genuinely new objects.
    #[must_use]
    pub fn on_add<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(Resource) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), ReconcileError>> + Send + 'static,
    {
        self.add = Some(Box::new(move |obj| callback(obj).boxed()));
        self
    }

    /// Called when an object's content changes.
    #[must_use]
    pub fn on_update<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(Option<Resource>, Resource) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), ReconcileError>> + Send + 'static,
    {
        self.update = Some(Box::new(move |old, new| callback(old, new).boxed()));
        self
    }

    /// Called when an object needs cleanup or is gone.
    #[must_use]
    pub fn on_delete<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(Resource) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), ReconcileError>> + Send + 'static,
    {
        self.delete = Some(Box::new(move |obj| callback(obj).boxed()));
        self
    }

    /// Called for replays and resync sweeps.
    #[must_use]
    pub fn on_sync<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(Resource) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), ReconcileError>> + Send + 'static,
    {
        self.sync = Some(Box::new(move |obj| callback(obj).boxed()));
        self
    }
}

#[async_trait]
impl Reconciler for SimpleWatcher {
    async fn reconcile(&self, req: ReconcileRequest) -> Result<ReconcileResult, ReconcileError> {
        let pending = match req.action {
            ReconcileAction::Created => self.add.as_ref().map(|f| f(req.object)),
            ReconcileAction::Updated => self.update.as_ref().map(|f| f(req.old_object, req.object)),
            ReconcileAction::Deleted => self.delete.as_ref().map(|f| f(req.object)),
            ReconcileAction::Resynced => self.sync.as_ref().map(|f| f(req.object)),
        };
        match pending {
            Some(fut) => fut.await.map(|()| ReconcileResult::done()),
            None => Ok(ReconcileResult::done()),
        }
    }
}

#[cfg(test)]
mod tests {
    use opkit_test::{test_resource, MemoryApiServer};
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;

    const FINALIZER: &str = "testapp.example.com/widgets-finalizer";
    const API_VERSION: &str = "testapp.example.com/v1";

    struct RecordingInner {
        seen: Mutex<Vec<(ReconcileAction, bool)>>,
        fail_deletes: bool,
    }

    impl RecordingInner {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                fail_deletes: false,
            })
        }

        fn failing_deletes() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                fail_deletes: true,
            })
        }

        fn seen(&self) -> Vec<(ReconcileAction, bool)> {
            self.seen.lock().clone()
        }
    }

    #[async_trait]
    impl Reconciler for Arc<RecordingInner> {
        async fn reconcile(&self, req: ReconcileRequest) -> Result<ReconcileResult, ReconcileError> {
            self.seen
                .lock()
                .push((req.action, req.object.has_finalizer(FINALIZER)));
            if self.fail_deletes && req.action == ReconcileAction::Deleted {
                return Err(ReconcileError::message("cleanup refused"));
            }
            Ok(ReconcileResult::done())
        }
    }

    fn request(action: ReconcileAction, object: Resource) -> ReconcileRequest {
        ReconcileRequest {
            action,
            object,
            old_object: None,
            object_state: ObjectState::ExistingObject,
            state_hint: None,
            attempt: 0,
        }
    }

    async fn seeded(finalizers: Vec<String>) -> (MemoryApiServer, Resource) {
        let server = MemoryApiServer::new();
        let client = server.client_for(API_VERSION, "Widget");
        let mut obj = test_resource(API_VERSION, "Widget", Some("default"), "foo");
        obj.spec = json!({ "size": 1 });
        obj.metadata.finalizers = finalizers;
        let stored = client.create(&obj).await.unwrap();
        (server, stored)
    }

    #[tokio::test]
    async fn new_object_gets_finalizer_before_inner_add() {
        let (server, stored) = seeded(vec![]).await;
        let inner = RecordingInner::new();
        let reconciler = OpinionatedReconciler::new(
            inner.clone(),
            Arc::new(server.client_for(API_VERSION, "Widget")),
            FINALIZER,
        );

        reconciler
            .reconcile(request(ReconcileAction::Created, stored.clone()))
            .await
            .unwrap();

        // the inner add already saw the installed finalizer
        assert_eq!(inner.seen(), vec![(ReconcileAction::Created, true)]);
        let live = server.stored(&stored.object_ref()).unwrap();
        assert!(live.has_finalizer(FINALIZER));
    }

    #[tokio::test]
    async fn replayed_add_surfaces_as_resync() {
        let (server, stored) = seeded(vec![FINALIZER.to_string()]).await;
        let inner = RecordingInner::new();
        let reconciler = OpinionatedReconciler::new(
            inner.clone(),
            Arc::new(server.client_for(API_VERSION, "Widget")),
            FINALIZER,
        );

        reconciler
            .reconcile(request(ReconcileAction::Created, stored))
            .await
            .unwrap();
        assert_eq!(inner.seen(), vec![(ReconcileAction::Resynced, true)]);
    }

    #[tokio::test]
    async fn deleting_object_runs_cleanup_then_releases_finalizer() {
        let (server, stored) = seeded(vec![FINALIZER.to_string()]).await;
        let client = server.client_for(API_VERSION, "Widget");
        client.delete(Some("default"), "foo").await.unwrap();
        let doomed = server.stored(&stored.object_ref()).unwrap();
        assert!(doomed.is_being_deleted());

        let inner = RecordingInner::new();
        let reconciler =
            OpinionatedReconciler::new(inner.clone(), Arc::new(client), FINALIZER);
        reconciler
            .reconcile(request(ReconcileAction::Updated, doomed))
            .await
            .unwrap();

        assert_eq!(inner.seen(), vec![(ReconcileAction::Deleted, true)]);
        // releasing the last finalizer completed the server-side delete
        assert!(server.stored(&stored.object_ref()).is_none());
    }

    #[tokio::test]
    async fn failed_cleanup_keeps_the_finalizer() {
        let (server, stored) = seeded(vec![FINALIZER.to_string()]).await;
        let client = server.client_for(API_VERSION, "Widget");
        client.delete(Some("default"), "foo").await.unwrap();
        let doomed = server.stored(&stored.object_ref()).unwrap();

        let inner = RecordingInner::failing_deletes();
        let reconciler =
            OpinionatedReconciler::new(inner.clone(), Arc::new(client), FINALIZER);
        let err = reconciler
            .reconcile(request(ReconcileAction::Updated, doomed))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "cleanup refused");

        let blocked = server.stored(&stored.object_ref()).unwrap();
        assert!(blocked.has_finalizer(FINALIZER), "finalizer survives failed cleanup");
    }

    #[tokio::test]
    async fn insignificant_update_is_suppressed() {
        let (server, stored) = seeded(vec![FINALIZER.to_string()]).await;
        let inner = RecordingInner::new();
        let reconciler = OpinionatedReconciler::new(
            inner.clone(),
            Arc::new(server.client_for(API_VERSION, "Widget")),
            FINALIZER,
        );

        // status-only churn
        let mut touched = stored.clone();
        touched.metadata.resource_version = "99".into();
        touched.status = json!({ "ready": true });
        let mut req = request(ReconcileAction::Updated, touched);
        req.old_object = Some(stored.clone());
        reconciler.reconcile(req).await.unwrap();
        assert!(inner.seen().is_empty());

        // a real spec change goes through
        let mut changed = stored.clone();
        changed.spec = json!({ "size": 2 });
        let mut req = request(ReconcileAction::Updated, changed);
        req.old_object = Some(stored);
        reconciler.reconcile(req).await.unwrap();
        assert_eq!(inner.seen(), vec![(ReconcileAction::Updated, true)]);
    }

    #[tokio::test]
    async fn tombstone_without_finalizer_is_terminal_housekeeping() {
        let (server, stored) = seeded(vec![]).await;
        let inner = RecordingInner::new();
        let reconciler = OpinionatedReconciler::new(
            inner.clone(),
            Arc::new(server.client_for(API_VERSION, "Widget")),
            FINALIZER,
        );

        reconciler
            .reconcile(request(ReconcileAction::Deleted, stored))
            .await
            .unwrap();
        assert!(inner.seen().is_empty());
    }

    #[tokio::test]
    async fn tombstone_with_finalizer_still_runs_cleanup() {
        let (server, stored) = seeded(vec![FINALIZER.to_string()]).await;
        let inner = RecordingInner::new();
        let reconciler = OpinionatedReconciler::new(
            inner.clone(),
            Arc::new(server.client_for(API_VERSION, "Widget")),
            FINALIZER,
        );

        // a force-delete slipped past the live cleanup path
        reconciler
            .reconcile(request(ReconcileAction::Deleted, stored))
            .await
            .unwrap();
        assert_eq!(inner.seen(), vec![(ReconcileAction::Deleted, true)]);
    }

    #[tokio::test]
    async fn foreign_finalizer_holding_deletion_is_ignored() {
        let (server, stored) = seeded(vec!["other.example.com/lock".to_string()]).await;
        let client = server.client_for(API_VERSION, "Widget");
        client.delete(Some("default"), "foo").await.unwrap();
        let doomed = server.stored(&stored.object_ref()).unwrap();

        let inner = RecordingInner::new();
        let reconciler =
            OpinionatedReconciler::new(inner.clone(), Arc::new(client), FINALIZER);
        reconciler
            .reconcile(request(ReconcileAction::Updated, doomed))
            .await
            .unwrap();
        assert!(inner.seen().is_empty());
    }

    #[tokio::test]
    async fn simple_watcher_routes_actions_to_callbacks() {
        let calls: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let log = |tag: &'static str, calls: &Arc<Mutex<Vec<String>>>| {
            let calls = calls.clone();
            move |obj: Resource| {
                let calls = calls.clone();
                async move {
                    calls.lock().push(format!("{tag}:{}", obj.name()));
                    Ok(())
                }
            }
        };
        let watcher = SimpleWatcher::new()
            .on_add(log("add", &calls))
            .on_delete(log("delete", &calls))
            .on_sync(log("sync", &calls));

        let obj = test_resource(API_VERSION, "Widget", Some("default"), "foo");
        for action in [
            ReconcileAction::Created,
            ReconcileAction::Updated,
            ReconcileAction::Deleted,
            ReconcileAction::Resynced,
        ] {
            watcher.reconcile(request(action, obj.clone())).await.unwrap();
        }
        // no update callback registered: that action is silently fine
        assert_eq!(*calls.lock(), vec!["add:foo", "delete:foo", "sync:foo"]);
    }
}
