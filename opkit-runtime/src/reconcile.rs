//! The contract between the controller and user reconcilers.

use std::{any::Any, error::Error as StdError, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use opkit_core::Resource;

/// What happened to the object, from the reconciler's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReconcileAction {
    /// The object was created (or first observed as live).
    Created,
    /// The object's content changed.
    Updated,
    /// The object is gone (or cleanup is due, under the opinionated layer).
    Deleted,
    /// The object was re-delivered without any change.
    Resynced,
}

/// How the object relates to the reconciler's lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectState {
    /// Never reconciled before.
    NewObject,
    /// Reconciled previously.
    ExistingObject,
    /// Being (or already) removed.
    DeletedObject,
}

/// Opaque per-key baggage carried from one attempt to the next.
pub type StateHint = Arc<dyn Any + Send + Sync>;

/// One unit of work handed to a reconciler.
#[derive(Clone)]
pub struct ReconcileRequest {
    /// What happened.
    pub action: ReconcileAction,
    /// The current object snapshot. For deletes this is the last known state.
    pub object: Resource,
    /// The prior snapshot, present for updates.
    pub old_object: Option<Resource>,
    /// Lifecycle classification of the object.
    pub object_state: ObjectState,
    /// Baggage returned by the previous attempt on this key, if any.
    pub state_hint: Option<StateHint>,
    /// Zero-based count of prior failed attempts for this key.
    pub attempt: u32,
}

impl fmt::Debug for ReconcileRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconcileRequest")
            .field("action", &self.action)
            .field("object", &self.object.object_ref())
            .field("object_state", &self.object_state)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

/// The outcome of a successful reconcile attempt.
#[derive(Default)]
pub struct ReconcileResult {
    /// Ask to run again after this delay even without new events.
    pub requeue_after: Option<Duration>,
    /// Baggage for the next attempt on this key. Dropped once the key
    /// reconciles terminally.
    pub state_hint: Option<StateHint>,
}

impl ReconcileResult {
    /// Terminal success; queue state for the key is cleared.
    pub fn done() -> Self {
        Self::default()
    }

    /// Success, but run again after `delay`.
    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue_after: Some(delay),
            ..Self::default()
        }
    }

    /// Attach baggage for the next attempt.
    #[must_use]
    pub fn with_state_hint(mut self, hint: StateHint) -> Self {
        self.state_hint = Some(hint);
        self
    }
}

impl fmt::Debug for ReconcileResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconcileResult")
            .field("requeue_after", &self.requeue_after)
            .field("has_state_hint", &self.state_hint.is_some())
            .finish()
    }
}

/// A failed reconcile attempt.
///
/// May carry a floor on the retry delay; the controller takes the maximum
/// of that and its rate-limited backoff.
#[derive(Debug)]
pub struct ReconcileError {
    source: Box<dyn StdError + Send + Sync>,
    retry_after: Option<Duration>,
}

impl ReconcileError {
    /// Wrap an arbitrary error.
    pub fn new<E: Into<Box<dyn StdError + Send + Sync>>>(source: E) -> Self {
        Self {
            source: source.into(),
            retry_after: None,
        }
    }

    /// A message-only error.
    pub fn message(msg: impl Into<String>) -> Self {
        Self::new(msg.into())
    }

    /// Demand at least `delay` before the retry.
    #[must_use]
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    /// The demanded minimum retry delay, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.source.fmt(f)
    }
}

impl StdError for ReconcileError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

impl From<opkit_core::Error> for ReconcileError {
    fn from(err: opkit_core::Error) -> Self {
        Self::new(err)
    }
}

impl From<serde_json::Error> for ReconcileError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err)
    }
}

/// User code that drives observed state toward desired state.
///
/// Implementations must be idempotent: the same request may be delivered
/// again after process restarts, requeues or coalescing.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Handle one request. Errors are retried with rate-limited backoff.
    async fn reconcile(&self, req: ReconcileRequest) -> Result<ReconcileResult, ReconcileError>;
}

#[async_trait]
impl<T: Reconciler + ?Sized> Reconciler for Arc<T> {
    async fn reconcile(&self, req: ReconcileRequest) -> Result<ReconcileResult, ReconcileError> {
        self.as_ref().reconcile(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_carries_source_chain_and_retry_floor() {
        let err = ReconcileError::from(opkit_core::Error::Conflict)
            .with_retry_after(Duration::from_secs(2));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
        assert!(StdError::source(&err).is_some());
        assert_eq!(err.to_string(), "resource version conflict");
    }

    #[test]
    fn state_hint_round_trips_through_any() {
        let hint: StateHint = Arc::new(42_u64);
        let result = ReconcileResult::done().with_state_hint(hint);
        let restored = result.state_hint.unwrap().downcast::<u64>().unwrap();
        assert_eq!(*restored, 42);
    }
}
