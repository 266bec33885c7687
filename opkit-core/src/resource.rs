//! The dynamic resource payload handled by the runtime.
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    gvk::{GroupVersionKind, ParseGroupVersionError},
    metadata::{Metadata, TypeMeta},
};

/// An addressable object of some kind, with opaque spec and status payloads.
///
/// The runtime never interprets `spec` or `status` beyond equality; typed
/// access is layered on by user code (or generated kinds) that deserialize
/// the payloads.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    /// apiVersion and kind
    #[serde(flatten)]
    pub types: TypeMeta,
    /// Standard object metadata
    #[serde(default)]
    pub metadata: Metadata,
    /// Desired-state payload
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub spec: Value,
    /// Observed-state payload
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub status: Value,
}

impl Resource {
    /// Object name
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Object namespace, if namespaced
    pub fn namespace(&self) -> Option<&str> {
        self.metadata.namespace.as_deref()
    }

    /// Server-assigned unique id
    pub fn uid(&self) -> &str {
        &self.metadata.uid
    }

    /// Opaque version token
    pub fn resource_version(&self) -> &str {
        &self.metadata.resource_version
    }

    /// Full kind identity, parsed from the type meta
    pub fn gvk(&self) -> Result<GroupVersionKind, ParseGroupVersionError> {
        GroupVersionKind::try_from(&self.types)
    }

    /// Whether the server has marked this object for deletion
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether `finalizer` is installed on this object
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata.finalizers.iter().any(|f| f == finalizer)
    }

    /// Append `finalizer` unless already present. Returns whether it was added.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.metadata.finalizers.push(finalizer.to_string());
        true
    }

    /// Remove `finalizer` if present. Returns whether it was removed.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.metadata.finalizers.len();
        self.metadata.finalizers.retain(|f| f != finalizer);
        self.metadata.finalizers.len() != before
    }

    /// The cache/queue identity of this object
    pub fn object_ref(&self) -> ObjectRef {
        let (group, kind) = match self.gvk() {
            Ok(gvk) => (gvk.group, gvk.kind),
            // unparseable api versions still need a stable slot
            Err(_) => (self.types.api_version.clone(), self.types.kind.clone()),
        };
        ObjectRef {
            group,
            kind,
            namespace: self.metadata.namespace.clone(),
            name: self.metadata.name.clone(),
        }
    }
}

/// A stable reference to an object, used as the key for caches and queues.
///
/// Versions and uids are excluded: a replacement object with the same
/// coordinates maps onto the same worker slot.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    /// API group of the object's kind
    pub group: String,
    /// Kind name
    pub kind: String,
    /// Namespace, absent for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}/", self.kind, self.group)?;
        if let Some(ns) = &self.namespace {
            write!(f, "{ns}/")?;
        }
        write!(f, "{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn widget(name: &str) -> Resource {
        Resource {
            types: TypeMeta::new("testapp.example.com/v1", "Widget"),
            metadata: Metadata {
                name: name.into(),
                namespace: Some("default".into()),
                uid: "u-1".into(),
                resource_version: "7".into(),
                ..Metadata::default()
            },
            spec: json!({ "size": 3 }),
            status: Value::Null,
        }
    }

    #[test]
    fn object_ref_ignores_version_and_uid() {
        let a = widget("foo");
        let mut b = widget("foo");
        b.metadata.uid = "u-2".into();
        b.metadata.resource_version = "8".into();
        assert_eq!(a.object_ref(), b.object_ref());
        assert_eq!(a.object_ref().to_string(), "Widget.testapp.example.com/default/foo");
    }

    #[test]
    fn finalizer_helpers_are_idempotent() {
        let mut obj = widget("foo");
        assert!(obj.add_finalizer("example.com/cleanup"));
        assert!(!obj.add_finalizer("example.com/cleanup"));
        assert_eq!(obj.metadata.finalizers, vec!["example.com/cleanup"]);
        assert!(obj.remove_finalizer("example.com/cleanup"));
        assert!(!obj.remove_finalizer("example.com/cleanup"));
        assert!(obj.metadata.finalizers.is_empty());
    }

    #[test]
    fn wire_form_flattens_type_meta() {
        let obj = widget("foo");
        let json = serde_json::to_value(&obj).unwrap();
        assert_eq!(json["apiVersion"], "testapp.example.com/v1");
        assert_eq!(json["kind"], "Widget");
        assert_eq!(json["metadata"]["resourceVersion"], "7");
        assert_eq!(json["spec"]["size"], 3);
        let back: Resource = serde_json::from_value(json).unwrap();
        assert_eq!(back, obj);
    }
}
