//! Routes admission and conversion requests to per-kind callbacks.
//!
//! The transport (HTTP framing) is external; embeddings call
//! [`AdmissionChain::validate`], [`AdmissionChain::mutate`] and
//! [`AdmissionChain::convert`] directly and serialize whatever envelope
//! their server speaks.

use std::sync::Arc;

use ahash::AHashMap;
use opkit_core::admission::{
    AdmissionError, AdmissionRequest, AdmissionResponse, ConversionRequest, Converter, Mutator,
    Validator,
};
use opkit_core::{GroupVersionKind, Resource};
use tracing::debug;

/// Per-kind admission callback registry.
///
/// Unknown kinds are rejected with a well-formed 404 response rather than
/// an error; a chain with no registrations is a valid chain that admits
/// nothing.
#[derive(Default)]
pub struct AdmissionChain {
    validators: AHashMap<GroupVersionKind, Arc<dyn Validator>>,
    mutators: AHashMap<GroupVersionKind, Arc<dyn Mutator>>,
    /// Converters are version-agnostic: keyed by (group, kind).
    converters: AHashMap<(String, String), Arc<dyn Converter>>,
}

impl AdmissionChain {
    /// An empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the validating hook for a kind.
    pub fn add_validator(&mut self, gvk: GroupVersionKind, validator: Arc<dyn Validator>) {
        self.validators.insert(gvk, validator);
    }

    /// Register the mutating hook for a kind.
    pub fn add_mutator(&mut self, gvk: GroupVersionKind, mutator: Arc<dyn Mutator>) {
        self.mutators.insert(gvk, mutator);
    }

    /// Register the version converter for a kind.
    pub fn add_converter(&mut self, group: &str, kind: &str, converter: Arc<dyn Converter>) {
        self.converters
            .insert((group.to_string(), kind.to_string()), converter);
    }

    /// Whether any hook is registered for `gvk`.
    pub fn handles(&self, gvk: &GroupVersionKind) -> bool {
        self.validators.contains_key(gvk)
            || self.mutators.contains_key(gvk)
            || self
                .converters
                .contains_key(&(gvk.group.clone(), gvk.kind.clone()))
    }

    /// Run the validating hook for the request's kind.
    pub async fn validate(&self, req: &AdmissionRequest) -> AdmissionResponse {
        let Some(validator) = self.validators.get(&req.kind) else {
            return unknown_kind(req);
        };
        match validator.validate(req).await {
            Ok(()) => AdmissionResponse::allow(req),
            Err(err) => rejection(req, &err),
        }
    }

    /// Run the mutating hook for the request's kind.
    pub async fn mutate(&self, req: &AdmissionRequest) -> AdmissionResponse {
        let Some(mutator) = self.mutators.get(&req.kind) else {
            return unknown_kind(req);
        };
        match mutator.mutate(req).await {
            Ok(patched) => AdmissionResponse::allow(req).with_patched_object(patched),
            Err(err) => rejection(req, &err),
        }
    }

    /// Convert serialized bytes between two versions of one kind.
    ///
    /// Falls back to a structural copy (re-tagging the version) when the
    /// kind has no registered converter.
    pub async fn convert(&self, req: ConversionRequest) -> Result<Vec<u8>, AdmissionError> {
        if req.source.group != req.target.group || req.source.kind != req.target.kind {
            return Err(AdmissionError::Rejected {
                message: format!(
                    "cannot convert {} to {}: only versions of one kind convert",
                    req.source, req.target
                ),
                code: 400,
            });
        }
        if req.source.version == req.target.version {
            return Ok(req.raw);
        }
        let key = (req.source.group.clone(), req.source.kind.clone());
        match self.converters.get(&key) {
            Some(converter) => converter.convert(req).await,
            None => {
                debug!(source = %req.source, target = %req.target, "structural conversion");
                let mut obj: Resource = serde_json::from_slice(&req.raw)?;
                obj.types.api_version = req.target.api_version();
                Ok(serde_json::to_vec(&obj)?)
            }
        }
    }
}

fn unknown_kind(req: &AdmissionRequest) -> AdmissionResponse {
    AdmissionResponse::deny(req, &format!("no admission handler for kind {}", req.kind), 404)
}

fn rejection(req: &AdmissionRequest, err: &AdmissionError) -> AdmissionResponse {
    match err {
        AdmissionError::Rejected { message, code } => AdmissionResponse::deny(req, message, *code),
        other => AdmissionResponse::deny(req, &other.to_string(), 500),
    }
}
