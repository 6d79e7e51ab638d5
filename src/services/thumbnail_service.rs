//! Single-shot image uploads (thumbnails and cover art).
//!
//! Images are small enough to go up in one request, so there is no session:
//! the caller gets a presigned URL plus the key the image will live at.

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    models::media_type::MediaFamily,
    services::gateway::{GatewayError, ObjectGateway, ensure_key_safe},
};

#[derive(Debug, Error)]
pub enum ThumbnailError {
    #[error("invalid media type `{0}`: expected an image type")]
    InvalidMediaType(String),
    #[error("key `{0}` is outside the caller's image namespace")]
    KeyOutsideNamespace(String),
    #[error(transparent)]
    Storage(#[from] GatewayError),
}

#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ImageUpload {
    pub presigned_url: String,
    pub key: String,
}

#[derive(Clone)]
pub struct ThumbnailService {
    gateway: Arc<dyn ObjectGateway>,
}

impl ThumbnailService {
    pub fn new(gateway: Arc<dyn ObjectGateway>) -> Self {
        Self { gateway }
    }

    /// Authorize a direct image upload.
    ///
    /// With `existing_key` the image replaces the object at that key;
    /// otherwise a fresh key is derived from the media subtype. An empty
    /// `existing_key` counts as absent.
    pub async fn authorize_image_upload(
        &self,
        owner_id: Uuid,
        media_type: &str,
        existing_key: Option<&str>,
    ) -> Result<ImageUpload, ThumbnailError> {
        let subtype = MediaFamily::Image
            .subtype_of(media_type)
            .ok_or_else(|| ThumbnailError::InvalidMediaType(media_type.to_string()))?;

        let key = match existing_key.filter(|key| !key.is_empty()) {
            Some(key) => {
                ensure_owned(owner_id, key)?;
                key.to_string()
            }
            None => format!("images/{owner_id}/{}.{}", Uuid::new_v4(), subtype.to_ascii_lowercase()),
        };

        let presigned_url = self.gateway.presign_put_object(&key, media_type).await?;
        debug!(%owner_id, key, "authorized image upload");
        Ok(ImageUpload { presigned_url, key })
    }

    /// Remove an image. Deleting an image that is already gone succeeds.
    pub async fn delete_image(&self, owner_id: Uuid, key: &str) -> Result<(), ThumbnailError> {
        ensure_owned(owner_id, key)?;
        match self.gateway.delete_object(key).await {
            Ok(()) => {
                info!(%owner_id, key, "deleted image");
                Ok(())
            }
            Err(GatewayError::ObjectNotFound(_)) => {
                debug!(%owner_id, key, "image already absent");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn ensure_owned(owner_id: Uuid, key: &str) -> Result<(), ThumbnailError> {
    let prefix = format!("images/{owner_id}/");
    let owned = key
        .strip_prefix(&prefix)
        .is_some_and(|rest| !rest.is_empty() && ensure_key_safe(key).is_ok());
    if owned {
        Ok(())
    } else {
        Err(ThumbnailError::KeyOutsideNamespace(key.to_string()))
    }
}
