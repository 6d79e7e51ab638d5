//! Represents an object (file) held by the local object store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata for a single stored object.
///
/// Kept in a JSON sidecar next to the payload; the struct never carries the
/// content bytes.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct StoredObject {
    /// Object key (path-like, e.g. `videos/{owner}/{tree}/{node}/clip.mp4`).
    pub key: String,

    /// Content type (MIME type).
    pub content_type: Option<String>,

    /// Size in bytes.
    pub size_bytes: i64,

    /// Hex MD5 of a single-shot upload, or `{md5-of-part-md5s}-{parts}` for
    /// objects assembled from a multipart upload.
    pub etag: String,

    /// Timestamp when object was last written.
    pub last_modified: DateTime<Utc>,

    /// User metadata attached at upload initiation (e.g. `root`).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Manifest of an open multipart upload.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct MultipartManifest {
    pub upload_id: String,
    pub key: String,
    pub content_type: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub initiated_at: DateTime<Utc>,
}
