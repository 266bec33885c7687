//! Frame types for the watch api.
use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::{error::ErrorResponse, resource::Resource};

/// A raw frame returned from a watch stream.
///
/// A stream yields many of these; [`WatchEvent::Error`] terminates it.
#[derive(Deserialize, Serialize, Clone)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
pub enum WatchEvent {
    /// An object appeared
    Added(Resource),
    /// An object changed
    Modified(Resource),
    /// An object went away
    Deleted(Resource),
    /// A resumption point with no data attached
    Bookmark(Bookmark),
    /// The server ended the stream with an error
    Error(ErrorResponse),
}

impl Debug for WatchEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            WatchEvent::Added(r) => write!(f, "Added({})", r.object_ref()),
            WatchEvent::Modified(r) => write!(f, "Modified({})", r.object_ref()),
            WatchEvent::Deleted(r) => write!(f, "Deleted({})", r.object_ref()),
            WatchEvent::Bookmark(b) => write!(f, "Bookmark({})", b.resource_version),
            WatchEvent::Error(e) => write!(f, "Error({e:?})"),
        }
    }
}

/// The payload of a [`WatchEvent::Bookmark`] frame.
///
/// Advances the caller's resumption point without delivering an object.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Bookmark {
    /// Where to resume from if the stream drops
    pub resource_version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_wire_form() {
        let ev: WatchEvent = serde_json::from_value(serde_json::json!({
            "type": "BOOKMARK",
            "object": { "resourceVersion": "42" },
        }))
        .unwrap();
        match ev {
            WatchEvent::Bookmark(bm) => assert_eq!(bm.resource_version, "42"),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
