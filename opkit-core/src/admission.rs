//! Types and callback contracts for admission control.
//!
//! The transport (HTTP framing, review envelopes) is out of scope; these are
//! the in-process shapes, bit-exact with their serialized form.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    gvk::{GroupVersionKind, GroupVersionResource},
    resource::Resource,
};

/// The operation that triggered an admission request.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    /// A resource is being created
    Create,
    /// A resource is being updated
    Update,
    /// A resource is being deleted
    Delete,
    /// A connect subresource call
    Connect,
}

/// Identity of the requesting user.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    /// Username as authenticated
    #[serde(default)]
    pub username: String,
    /// Group memberships
    #[serde(default)]
    pub groups: Vec<String>,
}

/// An admission request as delivered by the control plane.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    /// Correlates request and response
    pub uid: String,
    /// The kind of the object under admission
    pub kind: GroupVersionKind,
    /// The plural resource under admission
    pub resource: GroupVersionResource,
    /// Namespace of the object, if namespaced
    #[serde(default)]
    pub namespace: Option<String>,
    /// Name of the object; empty on generate-name creates
    #[serde(default)]
    pub name: String,
    /// The triggering operation
    pub operation: Operation,
    /// Who asked
    pub user_info: UserInfo,
    /// The incoming object; absent for deletes
    pub object: Option<Resource>,
    /// The existing object; present for updates and deletes
    #[serde(default)]
    pub old_object: Option<Resource>,
    /// Operation options payload, uninterpreted
    #[serde(default)]
    pub options: Option<serde_json::Value>,
    /// True when the result will not be persisted
    #[serde(default)]
    pub dry_run: bool,
}

/// The verdict returned for an admission request.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    /// Copied from the request
    pub uid: String,
    /// Whether the operation may proceed
    pub allowed: bool,
    /// Rejection detail, absent when allowed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AdmissionStatus>,
    /// Mutated object produced by a mutating hook
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patched_object: Option<Resource>,
}

/// Rejection detail carried on a denied [`AdmissionResponse`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionStatus {
    /// Human-readable description
    pub message: String,
    /// HTTP status code
    pub code: u16,
}

impl AdmissionResponse {
    /// An allowing response for `req`
    pub fn allow(req: &AdmissionRequest) -> Self {
        Self {
            uid: req.uid.clone(),
            allowed: true,
            status: None,
            patched_object: None,
        }
    }

    /// A denying response for `req`
    pub fn deny(req: &AdmissionRequest, message: &str, code: u16) -> Self {
        Self {
            uid: req.uid.clone(),
            allowed: false,
            status: Some(AdmissionStatus {
                message: message.to_string(),
                code,
            }),
            patched_object: None,
        }
    }

    /// Attach a mutated object
    #[must_use]
    pub fn with_patched_object(mut self, obj: Resource) -> Self {
        self.patched_object = Some(obj);
        self
    }
}

/// A conversion request between two versions of one kind.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ConversionRequest {
    /// The kind identity the bytes currently carry
    pub source: GroupVersionKind,
    /// The kind identity to convert to
    pub target: GroupVersionKind,
    /// The serialized object
    pub raw: Vec<u8>,
}

/// Errors surfaced by admission callbacks.
#[derive(Error, Debug)]
pub enum AdmissionError {
    /// The request is semantically invalid and must not proceed
    #[error("{message}")]
    Rejected {
        /// Human-readable rejection cause
        message: String,
        /// HTTP status code to surface
        code: u16,
    },

    /// A payload could not be serialized or deserialized
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The callback itself failed
    #[error("admission callback failed: {0}")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl AdmissionError {
    /// A plain 400 rejection
    pub fn rejected(message: impl Into<String>) -> Self {
        AdmissionError::Rejected {
            message: message.into(),
            code: 400,
        }
    }
}

/// Validates requests without modifying them.
#[async_trait]
pub trait Validator: Send + Sync {
    /// Return `Ok(())` to admit, or an error to reject
    async fn validate(&self, req: &AdmissionRequest) -> Result<(), AdmissionError>;
}

/// Rewrites incoming objects before persistence.
#[async_trait]
pub trait Mutator: Send + Sync {
    /// Return the (possibly modified) object to persist
    async fn mutate(&self, req: &AdmissionRequest) -> Result<Resource, AdmissionError>;
}

/// Converts serialized objects between versions of one kind.
#[async_trait]
pub trait Converter: Send + Sync {
    /// Return the serialized object re-expressed at the target version
    async fn convert(&self, req: ConversionRequest) -> Result<Vec<u8>, AdmissionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req() -> AdmissionRequest {
        AdmissionRequest {
            uid: "r-1".into(),
            kind: GroupVersionKind::gvk("testapp.example.com", "v1", "Widget"),
            resource: GroupVersionResource::gvr("testapp.example.com", "v1", "widgets"),
            namespace: Some("default".into()),
            name: "foo".into(),
            operation: Operation::Create,
            user_info: UserInfo::default(),
            object: None,
            old_object: None,
            options: None,
            dry_run: false,
        }
    }

    #[test]
    fn deny_carries_status_and_uid() {
        let resp = AdmissionResponse::deny(&req(), "size out of range", 422);
        assert_eq!(resp.uid, "r-1");
        assert!(!resp.allowed);
        let status = resp.status.unwrap();
        assert_eq!(status.code, 422);
        assert_eq!(status.message, "size out of range");
    }

    #[test]
    fn operation_wire_form_is_screaming_case() {
        assert_eq!(serde_json::to_value(Operation::Create).unwrap(), "CREATE");
        assert_eq!(serde_json::to_value(Operation::Connect).unwrap(), "CONNECT");
    }
}
