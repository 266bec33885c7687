//! The client contract the runtime consumes.
use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::{
    error::Error,
    params::{ListParams, Patch, UpdateParams, WatchParams},
    resource::Resource,
    watch::WatchEvent,
};

/// One page of a list call.
#[derive(Clone, Debug, Default)]
pub struct ObjectList {
    /// The objects on this page
    pub items: Vec<Resource>,
    /// The collection's resource version at list time; a watch started here
    /// observes every change after the snapshot
    pub resource_version: String,
    /// Present when further pages remain
    pub continue_token: Option<String>,
}

/// A lazy, finite stream of watch frames.
///
/// The stream may end at any point (with or without a trailing
/// [`WatchEvent::Error`]); it is not restartable in place. Callers obtain a
/// fresh stream via [`ResourceClient::watch`] with the last known resumption
/// point.
pub type WatchStream = BoxStream<'static, Result<WatchEvent, Error>>;

/// CRUD plus a long-lived watch over one kind in one namespace scope.
///
/// Generated per-kind clients are monomorphizations of this contract; the
/// runtime depends only on the trait. Passing `None` as the namespace
/// addresses cluster scope.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Fetch a single object
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<Resource, Error>;

    /// Fetch one page of objects
    async fn list(&self, namespace: Option<&str>, params: &ListParams) -> Result<ObjectList, Error>;

    /// Open a watch stream from a resumption point
    async fn watch(
        &self,
        namespace: Option<&str>,
        from_resource_version: &str,
        params: &WatchParams,
    ) -> Result<WatchStream, Error>;

    /// Create a new object
    async fn create(&self, resource: &Resource) -> Result<Resource, Error>;

    /// Replace an existing object (optimistic-locked on its resource version)
    async fn update(&self, resource: &Resource, params: &UpdateParams) -> Result<Resource, Error>;

    /// Apply a partial modification
    async fn patch(&self, namespace: Option<&str>, name: &str, patch: &Patch) -> Result<Resource, Error>;

    /// Request deletion; completion may be deferred by finalizers
    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<(), Error>;
}
