//! Metadata structs shared by every resource kind.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The version and kind discriminator carried by every serialized object.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypeMeta {
    /// The combined `group/version` (or bare `version` for group-less kinds)
    pub api_version: String,
    /// The kind name
    pub kind: String,
}

impl TypeMeta {
    /// Construct for a given api version and kind
    pub fn new(api_version: &str, kind: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
        }
    }
}

/// Standard object metadata.
///
/// `resource_version` is an opaque token: it changes on every write and must
/// only ever be compared for equality. `generation` increments only when the
/// spec changes.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// Object name, unique within a namespace (or the cluster for cluster-scoped kinds)
    pub name: String,
    /// Namespace, absent for cluster-scoped objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Server-assigned unique id, stable for the object's lifetime
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    /// Opaque version token, replaced on every write
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,
    /// Spec revision counter
    #[serde(default, skip_serializing_if = "is_zero")]
    pub generation: i64,
    /// User labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// User annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Markers that block hard deletion until removed, in installation order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    /// Set by the server when deletion has been requested; the object
    /// lingers until the finalizer list drains
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<String>,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(v: &i64) -> bool {
    *v == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_fields_are_omitted_on_the_wire() {
        let meta = Metadata {
            name: "foo".into(),
            ..Metadata::default()
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json, serde_json::json!({ "name": "foo" }));
    }

    #[test]
    fn round_trips_camel_case_fields() {
        let json = serde_json::json!({
            "name": "foo",
            "namespace": "default",
            "uid": "u-1",
            "resourceVersion": "41",
            "generation": 3,
            "finalizers": ["example.com/cleanup"],
            "deletionTimestamp": "2024-02-01T10:00:00Z",
        });
        let meta: Metadata = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(meta.resource_version, "41");
        assert_eq!(meta.deletion_timestamp.as_deref(), Some("2024-02-01T10:00:00Z"));
        assert_eq!(serde_json::to_value(&meta).unwrap(), json);
    }
}
