//! Object Storage Gateway: the contract the upload services depend on.
//!
//! Mirrors the native multipart protocol of S3-like stores. Providers issue
//! upload ids and time-limited URLs; the bytes go from the client straight to
//! the store and never pass through the coordinator.

use async_trait::async_trait;
use std::{collections::BTreeMap, io};
use thiserror::Error;

use crate::models::upload::CompletedPart;

/// Longest object key accepted by any provider.
pub const MAX_OBJECT_KEY_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("multipart upload `{0}` not found")]
    UploadNotFound(String),
    #[error("object `{0}` not found")]
    ObjectNotFound(String),
    #[error("part {part_number} rejected: {reason}")]
    InvalidPart { part_number: u32, reason: String },
    #[error("invalid object key")]
    InvalidKey,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[async_trait]
pub trait ObjectGateway: Send + Sync {
    /// Start a multipart upload for `key` and return the store-issued id.
    async fn create_multipart_upload(
        &self,
        key: &str,
        content_type: &str,
        metadata: BTreeMap<String, String>,
    ) -> GatewayResult<String>;

    /// URL authorizing a single part upload. Issuing again does not revoke
    /// earlier URLs.
    async fn presign_part_upload(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
    ) -> GatewayResult<String>;

    /// Assemble the uploaded parts into the final object and return its key.
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> GatewayResult<String>;

    /// Release every uploaded-but-unfinalized part of an upload.
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> GatewayResult<()>;

    /// URL authorizing a single-shot upload of the whole object.
    async fn presign_put_object(&self, key: &str, content_type: &str) -> GatewayResult<String>;

    async fn delete_object(&self, key: &str) -> GatewayResult<()>;
}

/// Basic key validation to avoid trivial path traversal vectors.
///
/// Rejects empty or overlong keys, keys that begin with `/`, contain `..`,
/// backslashes or control characters.
pub fn ensure_key_safe(key: &str) -> GatewayResult<()> {
    if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
        return Err(GatewayError::InvalidKey);
    }
    if key.starts_with('/') || key.contains("..") {
        return Err(GatewayError::InvalidKey);
    }
    if key
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
    {
        return Err(GatewayError::InvalidKey);
    }
    Ok(())
}
