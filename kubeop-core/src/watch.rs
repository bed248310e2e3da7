//! Types for the watch api
//!
//! See <https://kubernetes.io/docs/reference/using-api/api-concepts/#efficient-detection-of-changes>

use crate::{error::ErrorResponse, metadata::TypeMeta};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// A raw event returned from a watch query
///
/// Note that a watch query returns many of these as newline separated JSON.
#[derive(Deserialize, Serialize, Clone)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
pub enum WatchEvent<K> {
    /// Resource was added
    Added(K),
    /// Resource was modified
    Modified(K),
    /// Resource was deleted
    Deleted(K),
    /// Progress marker carrying only a resource version
    Bookmark(Bookmark),
    /// There was some kind of error
    Error(ErrorResponse),
}

impl<K> WatchEvent<K> {
    /// The object carried by this event, if any
    pub fn object(&self) -> Option<&K> {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => Some(obj),
            WatchEvent::Bookmark(_) | WatchEvent::Error(_) => None,
        }
    }
}

impl<K> Debug for WatchEvent<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self {
            WatchEvent::Added(_) => write!(f, "Added event"),
            WatchEvent::Modified(_) => write!(f, "Modified event"),
            WatchEvent::Deleted(_) => write!(f, "Deleted event"),
            WatchEvent::Bookmark(b) => write!(f, "Bookmark event at {}", b.metadata.resource_version),
            WatchEvent::Error(e) => write!(f, "Error event: {:?}", e),
        }
    }
}

/// Slimmed down object for [`WatchEvent::Bookmark`]
///
/// Can only be relied upon to have metadata with resource version.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Bookmark {
    /// apiVersion + kind
    #[serde(flatten)]
    pub types: TypeMeta,

    /// Basically empty metadata
    pub metadata: BookmarkMeta,
}

/// Slimmed down metadata for [`WatchEvent::Bookmark`]
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BookmarkMeta {
    /// The only field we need from a Bookmark event.
    pub resource_version: String,
}

#[cfg(test)]
mod tests {
    use super::WatchEvent;
    use serde_json::json;

    #[test]
    fn decodes_tagged_events() {
        let added: WatchEvent<serde_json::Value> = serde_json::from_value(json!({
            "type": "ADDED",
            "object": { "metadata": { "name": "a" } }
        }))
        .unwrap();
        assert!(matches!(added, WatchEvent::Added(_)));
        assert_eq!(added.object().unwrap()["metadata"]["name"], "a");

        let bookmark: WatchEvent<serde_json::Value> = serde_json::from_value(json!({
            "type": "BOOKMARK",
            "object": { "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "resourceVersion": "42" } }
        }))
        .unwrap();
        match bookmark {
            WatchEvent::Bookmark(b) => assert_eq!(b.metadata.resource_version, "42"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decodes_expired_error() {
        let err: WatchEvent<serde_json::Value> = serde_json::from_value(json!({
            "type": "ERROR",
            "object": { "status": "Failure", "reason": "Expired", "message": "too old", "code": 410 }
        }))
        .unwrap();
        match err {
            WatchEvent::Error(e) => assert!(e.is_gone()),
            other => panic!("unexpected {other:?}"),
        }
    }
}
