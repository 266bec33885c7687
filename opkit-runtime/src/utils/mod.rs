//! Helpers for retry timing.

mod backoff;

pub use backoff::{Backoff, DefaultBackoff};
