//! The declarative app manifest consumed by the app runtime.
//!
//! A manifest describes the kinds an app serves, per version, together with
//! the admission capabilities each kind declares. The runtime only reads
//! manifests; producing them is the job of external tooling.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::admission::Operation;

/// The full descriptor for one app.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppManifest {
    /// App name, also used as the manifest's identity
    pub app_name: String,
    /// API group all of the app's kinds live in
    pub group: String,
    /// All served versions, in declaration order
    pub versions: Vec<ManifestVersion>,
    /// The storage/serving version of choice
    pub preferred_version: String,
}

impl AppManifest {
    /// The declared kinds of every version, flattened
    pub fn kinds(&self) -> impl Iterator<Item = (&ManifestVersion, &ManifestKind)> {
        self.versions
            .iter()
            .flat_map(|v| v.kinds.iter().map(move |k| (v, k)))
    }

    /// Look up a kind within a version
    pub fn kind(&self, version: &str, kind: &str) -> Option<&ManifestKind> {
        self.versions
            .iter()
            .find(|v| v.name == version)
            .and_then(|v| v.kinds.iter().find(|k| k.kind == kind))
    }

    /// The version selected by `preferred_version`
    pub fn preferred(&self) -> Option<&ManifestVersion> {
        self.versions.iter().find(|v| v.name == self.preferred_version)
    }
}

/// One served version of the app's API.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestVersion {
    /// Version name, e.g. `v1alpha1`
    pub name: String,
    /// Kinds declared at this version
    pub kinds: Vec<ManifestKind>,
}

/// One kind declaration within a manifest version.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestKind {
    /// Kind name
    pub kind: String,
    /// Lowercase plural resource name
    pub plural: String,
    /// Whether objects live in namespaces or at cluster scope
    #[serde(default)]
    pub scope: ResourceScope,
    /// Admission hooks this kind supports
    #[serde(default)]
    pub admission: AdmissionCapabilities,
    /// Whether the kind supports version conversion
    #[serde(default)]
    pub conversion: bool,
    /// Custom subresource routes, uninterpreted by the runtime
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub routes: BTreeMap<String, Value>,
    /// Field paths selectable in field selectors
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selectable_fields: Vec<String>,
    /// Extra columns for tabular display
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_printer_columns: Vec<PrinterColumn>,
    /// Structural schema blob, uninterpreted by the runtime
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub schema: Value,
}

/// Namespace placement of a kind's objects.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResourceScope {
    /// Objects live inside namespaces
    #[default]
    Namespaced,
    /// Objects live at cluster scope
    Cluster,
}

/// The admission operations a kind has opted into.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionCapabilities {
    /// Operations routed to the validating hook
    #[serde(default)]
    pub validation: Vec<Operation>,
    /// Operations routed to the mutating hook
    #[serde(default)]
    pub mutation: Vec<Operation>,
}

impl AdmissionCapabilities {
    /// Whether any hook is declared at all
    pub fn any(&self) -> bool {
        !self.validation.is_empty() || !self.mutation.is_empty()
    }
}

/// One extra display column.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PrinterColumn {
    /// Column header
    pub name: String,
    /// Value type, e.g. `string` or `integer`
    #[serde(rename = "type")]
    pub column_type: String,
    /// JSONPath into the object producing the value
    pub json_path: String,
    /// Optional help text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}
