//! Test helpers for opkit operators.
//!
//! [`MemoryApiServer`] is a single-process control plane holding every kind
//! in one store: writes bump an integer resource version, watch streams
//! replay from any past version and then follow live changes, and deletion
//! honors finalizers the way a real server does (a delete with finalizers
//! present only marks the object; removing the last finalizer of a marked
//! object hard-deletes it).

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use opkit_core::{
    Error, GroupVersion, ListParams, Metadata, ObjectList, ObjectRef, Patch, Resource,
    ResourceClient, UpdateParams, WatchEvent, WatchParams, WatchStream,
};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::trace;

/// Placeholder deletion timestamp; only its presence carries meaning.
const DELETION_TIMESTAMP: &str = "1970-01-01T00:00:00Z";

struct ServerState {
    objects: BTreeMap<ObjectRef, Resource>,
    /// Every committed event, for watch replay from a past version.
    log: Vec<(u64, WatchEvent)>,
    next_version: u64,
    next_uid: u64,
}

/// An in-memory control plane.
///
/// Cheap to clone; all clones share one store.
#[derive(Clone)]
pub struct MemoryApiServer {
    state: Arc<Mutex<ServerState>>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for MemoryApiServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryApiServer {
    /// An empty server.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            state: Arc::new(Mutex::new(ServerState {
                objects: BTreeMap::new(),
                log: Vec::new(),
                next_version: 0,
                next_uid: 0,
            })),
            events,
        }
    }

    /// A client scoped to one kind, e.g. `testapp.example.com/v1` / `Widget`.
    pub fn client_for(&self, api_version: &str, kind: &str) -> MemoryClient {
        let group = GroupVersion::from_str(api_version)
            .map(|gv| gv.group)
            .unwrap_or_default();
        MemoryClient {
            server: self.clone(),
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            group,
        }
    }

    /// The store's current resource version.
    pub fn current_resource_version(&self) -> String {
        self.state.lock().next_version.to_string()
    }

    /// Direct store lookup, bypassing any client.
    pub fn stored(&self, key: &ObjectRef) -> Option<Resource> {
        self.state.lock().objects.get(key).cloned()
    }

    /// All stored objects.
    pub fn objects(&self) -> Vec<Resource> {
        self.state.lock().objects.values().cloned().collect()
    }

    fn commit(state: &mut ServerState, events: &broadcast::Sender<WatchEvent>, event: WatchEvent) {
        let version = state.next_version;
        state.log.push((version, event.clone()));
        trace!(?event, version, "commit");
        // no receivers is fine
        let _ = events.send(event);
    }
}

/// A [`ResourceClient`] over one kind of a [`MemoryApiServer`].
pub struct MemoryClient {
    server: MemoryApiServer,
    api_version: String,
    kind: String,
    group: String,
}

impl MemoryClient {
    fn key(&self, namespace: Option<&str>, name: &str) -> ObjectRef {
        ObjectRef {
            group: self.group.clone(),
            kind: self.kind.clone(),
            namespace: namespace.map(String::from),
            name: name.to_string(),
        }
    }

    fn covers(&self, obj: &Resource) -> bool {
        obj.types.kind == self.kind && obj.types.api_version == self.api_version
    }

    fn event_matches(
        &self,
        event: &WatchEvent,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> bool {
        let obj = match event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => obj,
            WatchEvent::Bookmark(_) | WatchEvent::Error(_) => return true,
        };
        self.covers(obj)
            && namespace.is_none_or(|ns| obj.namespace() == Some(ns))
            && matches_labels(obj, label_selector)
    }
}

#[async_trait]
impl ResourceClient for MemoryClient {
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<Resource, Error> {
        self.server
            .state
            .lock()
            .objects
            .get(&self.key(namespace, name))
            .cloned()
            .ok_or(Error::NotFound)
    }

    async fn list(&self, namespace: Option<&str>, params: &ListParams) -> Result<ObjectList, Error> {
        let state = self.server.state.lock();
        let matching: Vec<Resource> = state
            .objects
            .values()
            .filter(|obj| {
                self.covers(obj)
                    && namespace.is_none_or(|ns| obj.namespace() == Some(ns))
                    && matches_labels(obj, params.label_selector.as_deref())
            })
            .cloned()
            .collect();

        let offset: usize = params
            .continue_token
            .as_deref()
            .map(|t| t.parse().map_err(|_| Error::Gone))
            .transpose()?
            .unwrap_or(0);
        let limit = params.limit.map_or(matching.len(), |l| l as usize);
        let page: Vec<Resource> = matching.iter().skip(offset).take(limit).cloned().collect();
        let consumed = offset + page.len();
        Ok(ObjectList {
            items: page,
            resource_version: state.next_version.to_string(),
            continue_token: (consumed < matching.len()).then(|| consumed.to_string()),
        })
    }

    async fn watch(
        &self,
        namespace: Option<&str>,
        from_resource_version: &str,
        params: &WatchParams,
    ) -> Result<WatchStream, Error> {
        let from: u64 = from_resource_version.parse().unwrap_or(0);
        let namespace = namespace.map(String::from);
        let label_selector = params.label_selector.clone();

        // replay and subscription happen under one lock so no event can
        // fall between them
        let (replay, mut live) = {
            let state = self.server.state.lock();
            let replay: Vec<WatchEvent> = state
                .log
                .iter()
                .filter(|(version, _)| *version > from)
                .map(|(_, event)| event.clone())
                .collect();
            (replay, self.server.events.subscribe())
        };

        let client = MemoryClient {
            server: self.server.clone(),
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            group: self.group.clone(),
        };
        let stream = stream! {
            for event in replay {
                if client.event_matches(&event, namespace.as_deref(), label_selector.as_deref()) {
                    yield Ok(event);
                }
            }
            loop {
                match live.recv().await {
                    Ok(event) => {
                        if client.event_matches(&event, namespace.as_deref(), label_selector.as_deref()) {
                            yield Ok(event);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        yield Err(Error::Gone);
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        Ok(stream.boxed())
    }

    async fn create(&self, resource: &Resource) -> Result<Resource, Error> {
        let mut state = self.server.state.lock();
        let key = resource.object_ref();
        if state.objects.contains_key(&key) {
            return Err(Error::AlreadyExists);
        }
        state.next_version += 1;
        state.next_uid += 1;
        let mut stored = resource.clone();
        stored.metadata.uid = format!("uid-{}", state.next_uid);
        stored.metadata.resource_version = state.next_version.to_string();
        stored.metadata.generation = 1;
        stored.metadata.deletion_timestamp = None;
        state.objects.insert(key, stored.clone());
        MemoryApiServer::commit(&mut state, &self.server.events, WatchEvent::Added(stored.clone()));
        Ok(stored)
    }

    async fn update(&self, resource: &Resource, params: &UpdateParams) -> Result<Resource, Error> {
        let mut state = self.server.state.lock();
        let key = resource.object_ref();
        let Some(current) = state.objects.get(&key).cloned() else {
            return Err(Error::NotFound);
        };
        if resource.metadata.resource_version != current.metadata.resource_version {
            return Err(Error::Conflict);
        }

        state.next_version += 1;
        let mut stored = current.clone();
        match params.subresource.as_deref() {
            Some("status") => {
                stored.status = resource.status.clone();
            }
            Some(_) | None => {
                if stored.spec != resource.spec {
                    stored.metadata.generation += 1;
                }
                stored.spec = resource.spec.clone();
                stored.metadata.labels = resource.metadata.labels.clone();
                stored.metadata.annotations = resource.metadata.annotations.clone();
                stored.metadata.finalizers = resource.metadata.finalizers.clone();
            }
        }
        stored.metadata.resource_version = state.next_version.to_string();

        // removing the last finalizer of a doomed object completes the delete
        if stored.metadata.deletion_timestamp.is_some() && stored.metadata.finalizers.is_empty() {
            state.objects.remove(&key);
            MemoryApiServer::commit(
                &mut state,
                &self.server.events,
                WatchEvent::Deleted(stored.clone()),
            );
        } else {
            state.objects.insert(key, stored.clone());
            MemoryApiServer::commit(
                &mut state,
                &self.server.events,
                WatchEvent::Modified(stored.clone()),
            );
        }
        Ok(stored)
    }

    async fn patch(&self, namespace: Option<&str>, name: &str, patch: &Patch) -> Result<Resource, Error> {
        let merge = match patch {
            Patch::Merge(value) => value.clone(),
            Patch::Json(_) => {
                return Err(Error::Api(opkit_core::ErrorResponse {
                    status: "Failure".into(),
                    message: "json patch is not supported by the memory server".into(),
                    reason: "NotImplemented".into(),
                    code: 501,
                }))
            }
        };
        let current = self.get(namespace, name).await?;
        let mut doc = serde_json::to_value(&current)?;
        merge_patch(&mut doc, &merge);
        let mut patched: Resource = serde_json::from_value(doc)?;
        patched.metadata.resource_version = current.metadata.resource_version.clone();
        self.update(&patched, &UpdateParams::default()).await
    }

    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<(), Error> {
        let mut state = self.server.state.lock();
        let key = self.key(namespace, name);
        let Some(current) = state.objects.get(&key).cloned() else {
            return Err(Error::NotFound);
        };

        state.next_version += 1;
        if current.metadata.finalizers.is_empty() {
            let mut gone = current;
            gone.metadata.resource_version = state.next_version.to_string();
            state.objects.remove(&key);
            MemoryApiServer::commit(&mut state, &self.server.events, WatchEvent::Deleted(gone));
        } else {
            // finalizers block the delete: only mark the object
            let mut doomed = current;
            if doomed.metadata.deletion_timestamp.is_none() {
                doomed.metadata.deletion_timestamp = Some(DELETION_TIMESTAMP.to_string());
            }
            doomed.metadata.resource_version = state.next_version.to_string();
            state.objects.insert(key, doomed.clone());
            MemoryApiServer::commit(&mut state, &self.server.events, WatchEvent::Modified(doomed));
        }
        Ok(())
    }
}

/// Equality-based label selector: `k=v[,k2=v2...]`, empty selects all.
fn matches_labels(obj: &Resource, selector: Option<&str>) -> bool {
    let Some(selector) = selector else { return true };
    selector.split(',').filter(|s| !s.is_empty()).all(|pair| {
        match pair.split_once('=') {
            Some((k, v)) => obj.metadata.labels.get(k.trim()).map(String::as_str) == Some(v.trim()),
            None => false,
        }
    })
}

/// RFC 7386 merge patch.
fn merge_patch(doc: &mut serde_json::Value, patch: &serde_json::Value) {
    match patch {
        serde_json::Value::Object(entries) => {
            if !doc.is_object() {
                *doc = serde_json::Value::Object(serde_json::Map::new());
            }
            let target = doc.as_object_mut().expect("coerced to object above");
            for (key, value) in entries {
                if value.is_null() {
                    target.remove(key);
                } else {
                    merge_patch(target.entry(key.clone()).or_insert(serde_json::Value::Null), value);
                }
            }
        }
        other => *doc = other.clone(),
    }
}

/// A convenience builder for test objects.
pub fn test_resource(api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> Resource {
    Resource {
        types: opkit_core::TypeMeta::new(api_version, kind),
        metadata: Metadata {
            name: name.to_string(),
            namespace: namespace.map(String::from),
            ..Metadata::default()
        },
        spec: serde_json::Value::Null,
        status: serde_json::Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn widget(name: &str) -> Resource {
        let mut obj = test_resource("testapp.example.com/v1", "Widget", Some("default"), name);
        obj.spec = serde_json::json!({ "size": 1 });
        obj
    }

    #[tokio::test]
    async fn create_assigns_identity_and_version() {
        let server = MemoryApiServer::new();
        let client = server.client_for("testapp.example.com/v1", "Widget");
        let stored = client.create(&widget("foo")).await.unwrap();
        assert_eq!(stored.uid(), "uid-1");
        assert_eq!(stored.resource_version(), "1");
        assert_eq!(stored.metadata.generation, 1);
        assert!(matches!(client.create(&widget("foo")).await, Err(Error::AlreadyExists)));
    }

    #[tokio::test]
    async fn update_requires_fresh_resource_version() {
        let server = MemoryApiServer::new();
        let client = server.client_for("testapp.example.com/v1", "Widget");
        let stored = client.create(&widget("foo")).await.unwrap();

        let mut stale = stored.clone();
        stale.metadata.resource_version = "0".into();
        assert!(matches!(
            client.update(&stale, &UpdateParams::default()).await,
            Err(Error::Conflict)
        ));

        let mut fresh = stored;
        fresh.spec = serde_json::json!({ "size": 2 });
        let updated = client.update(&fresh, &UpdateParams::default()).await.unwrap();
        assert_eq!(updated.metadata.generation, 2);
    }

    #[tokio::test]
    async fn status_update_does_not_bump_generation() {
        let server = MemoryApiServer::new();
        let client = server.client_for("testapp.example.com/v1", "Widget");
        let mut stored = client.create(&widget("foo")).await.unwrap();
        stored.status = serde_json::json!({ "ready": true });
        let updated = client
            .update(&stored, &UpdateParams::subresource("status"))
            .await
            .unwrap();
        assert_eq!(updated.metadata.generation, 1);
        assert_eq!(updated.status["ready"], true);
    }

    #[tokio::test]
    async fn delete_defers_to_finalizers() {
        let server = MemoryApiServer::new();
        let client = server.client_for("testapp.example.com/v1", "Widget");
        let mut obj = widget("foo");
        obj.metadata.finalizers = vec!["testapp.example.com/cleanup".into()];
        let stored = client.create(&obj).await.unwrap();

        client.delete(Some("default"), "foo").await.unwrap();
        let marked = server.stored(&stored.object_ref()).unwrap();
        assert!(marked.is_being_deleted());

        // removing the finalizer completes the delete
        let mut unblocked = marked;
        unblocked.metadata.finalizers.clear();
        client.update(&unblocked, &UpdateParams::default()).await.unwrap();
        assert!(server.stored(&stored.object_ref()).is_none());
    }

    #[tokio::test]
    async fn watch_replays_then_follows() {
        let server = MemoryApiServer::new();
        let client = server.client_for("testapp.example.com/v1", "Widget");
        client.create(&widget("early")).await.unwrap();

        let mut stream = client
            .watch(Some("default"), "0", &WatchParams::default())
            .await
            .unwrap();
        let replayed = stream.next().await.unwrap().unwrap();
        assert!(matches!(replayed, WatchEvent::Added(obj) if obj.name() == "early"));

        client.create(&widget("late")).await.unwrap();
        let live = stream.next().await.unwrap().unwrap();
        assert!(matches!(live, WatchEvent::Added(obj) if obj.name() == "late"));
    }

    #[tokio::test]
    async fn watch_from_later_version_skips_history() {
        let server = MemoryApiServer::new();
        let client = server.client_for("testapp.example.com/v1", "Widget");
        client.create(&widget("old")).await.unwrap();
        let from = server.current_resource_version();

        let mut stream = client
            .watch(Some("default"), &from, &WatchParams::default())
            .await
            .unwrap();
        client.create(&widget("new")).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert!(matches!(first, WatchEvent::Added(obj) if obj.name() == "new"));
    }

    #[tokio::test]
    async fn list_paginates_with_continue_tokens() {
        let server = MemoryApiServer::new();
        let client = server.client_for("testapp.example.com/v1", "Widget");
        for name in ["a", "b", "c"] {
            client.create(&widget(name)).await.unwrap();
        }
        let params = ListParams::default().limit(2);
        let first = client.list(Some("default"), &params).await.unwrap();
        assert_eq!(first.items.len(), 2);
        let token = first.continue_token.unwrap();

        let rest = client
            .list(Some("default"), &params.continue_token(&token))
            .await
            .unwrap();
        assert_eq!(rest.items.len(), 1);
        assert!(rest.continue_token.is_none());
    }

    #[tokio::test]
    async fn label_selector_filters_list_and_watch() {
        let server = MemoryApiServer::new();
        let client = server.client_for("testapp.example.com/v1", "Widget");
        let mut labelled = widget("labelled");
        labelled.metadata.labels.insert("tier".into(), "prod".into());
        client.create(&labelled).await.unwrap();
        client.create(&widget("plain")).await.unwrap();

        let listed = client
            .list(Some("default"), &ListParams::default().labels("tier=prod"))
            .await
            .unwrap();
        assert_eq!(listed.items.len(), 1);
        assert_eq!(listed.items[0].name(), "labelled");

        let mut stream = client
            .watch(Some("default"), "0", &WatchParams::default().labels("tier=prod"))
            .await
            .unwrap();
        let only = stream.next().await.unwrap().unwrap();
        assert!(matches!(only, WatchEvent::Added(obj) if obj.name() == "labelled"));
    }
}
