//! Parameter types for client calls.
use serde_json::Value;

/// Parameters for list calls.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ListParams {
    /// Comma-separated label selector
    pub label_selector: Option<String>,
    /// Comma-separated field selector
    pub field_selector: Option<String>,
    /// Page size cap; the server may return fewer
    pub limit: Option<u32>,
    /// Continuation token from the previous page
    pub continue_token: Option<String>,
}

impl ListParams {
    /// Select objects by label
    #[must_use]
    pub fn labels(mut self, selector: &str) -> Self {
        self.label_selector = Some(selector.to_string());
        self
    }

    /// Select objects by field
    #[must_use]
    pub fn fields(mut self, selector: &str) -> Self {
        self.field_selector = Some(selector.to_string());
        self
    }

    /// Cap the page size
    #[must_use]
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Resume from a continuation token
    #[must_use]
    pub fn continue_token(mut self, token: &str) -> Self {
        self.continue_token = Some(token.to_string());
        self
    }
}

/// Parameters for watch calls.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WatchParams {
    /// Comma-separated label selector
    pub label_selector: Option<String>,
}

impl WatchParams {
    /// Select objects by label
    #[must_use]
    pub fn labels(mut self, selector: &str) -> Self {
        self.label_selector = Some(selector.to_string());
        self
    }
}

/// Parameters for update calls.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpdateParams {
    /// Target a subresource (e.g. `status`) instead of the main document
    pub subresource: Option<String>,
}

impl UpdateParams {
    /// Update the named subresource
    #[must_use]
    pub fn subresource(sub: &str) -> Self {
        Self {
            subresource: Some(sub.to_string()),
        }
    }
}

/// A patch payload.
///
/// The concrete wire encoding is the transport's concern; the core only
/// distinguishes the merge strategy.
#[derive(Clone, Debug, PartialEq)]
pub enum Patch {
    /// RFC 7386 merge patch
    Merge(Value),
    /// RFC 6902 operation list
    Json(Value),
}
