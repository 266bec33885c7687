//! Shared types, traits and client-less behavior for opkit operators.
//!
//! This crate carries everything the runtime and user code agree on without
//! pulling in any transport: the dynamic [`Resource`] model, the
//! [`ResourceClient`] contract, watch frame types, the admission model and
//! the app manifest descriptor.

pub mod admission;
pub mod client;
pub mod error;
pub mod gvk;
pub mod manifest;
pub mod metadata;
pub mod params;
pub mod resource;
pub mod watch;

pub use client::{ObjectList, ResourceClient, WatchStream};
pub use error::{Error, ErrorResponse};
pub use gvk::{GroupVersion, GroupVersionKind, GroupVersionResource};
pub use metadata::{Metadata, TypeMeta};
pub use params::{ListParams, Patch, UpdateParams, WatchParams};
pub use resource::{ObjectRef, Resource};
pub use watch::{Bookmark, WatchEvent};

/// Convenient alias for `Result` with the crate's [`Error`] as the default error type.
pub type Result<T, E = Error> = std::result::Result<T, E>;
