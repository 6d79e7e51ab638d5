//! HTTP handlers for single-shot image (thumbnail) uploads.

use axum::{
    Json,
    extract::{Query, State},
};
use serde::{Deserialize, Serialize};

use crate::{
    errors::AppError, middleware::owner::Owner, services::thumbnail_service::ImageUpload,
    state::AppState,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeImageReq {
    #[serde(alias = "fileType")]
    pub media_type: String,
    /// Key of an image being replaced.
    #[serde(default)]
    pub existing_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteImageQuery {
    pub key: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

/// `POST /uploads/images`
pub async fn authorize_image_upload(
    State(state): State<AppState>,
    Owner(owner_id): Owner,
    Json(req): Json<AuthorizeImageReq>,
) -> Result<Json<ImageUpload>, AppError> {
    let upload = state
        .thumbnails
        .authorize_image_upload(owner_id, &req.media_type, req.existing_key.as_deref())
        .await?;
    Ok(Json(upload))
}

/// `DELETE /uploads/images?key=...`
pub async fn delete_image(
    State(state): State<AppState>,
    Owner(owner_id): Owner,
    Query(q): Query<DeleteImageQuery>,
) -> Result<Json<MessageResponse>, AppError> {
    state.thumbnails.delete_image(owner_id, &q.key).await?;
    Ok(Json(MessageResponse {
        message: "Image deleted".into(),
    }))
}
