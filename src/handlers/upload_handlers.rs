//! HTTP handlers for multipart video uploads and stale-session listing.
//!
//! Every call after initiation names its session by upload id plus the tree
//! and node it was started for; a mismatch reads as not found.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};

use crate::{
    errors::AppError,
    middleware::owner::Owner,
    models::{
        tree::{NodeId, TreeId},
        upload::{CompletedPart, PartAuthorization, SessionRef, UploadSession},
    },
    state::AppState,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateReq {
    pub tree_id: TreeId,
    pub node_id: NodeId,
    pub file_name: String,
    /// Declared media type; `fileType` is accepted for older clients.
    #[serde(alias = "fileType")]
    pub media_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionQuery {
    pub tree_id: TreeId,
    pub node_id: NodeId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartsQuery {
    pub tree_id: TreeId,
    pub node_id: NodeId,
    pub part_count: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcknowledgeReq {
    pub tree_id: TreeId,
    pub node_id: NodeId,
    #[serde(alias = "ETag")]
    pub etag: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteReq {
    pub tree_id: TreeId,
    pub node_id: NodeId,
    pub parts: Vec<CompletedPart>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateResponse {
    pub upload_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedPartResponse {
    pub part_number: u32,
    pub presigned_url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedPartsResponse {
    pub parts: Vec<PartAuthorization>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteResponse {
    /// Key of the assembled object, now attached to the node.
    pub url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StaleResponse {
    pub older_than_secs: u64,
    pub sessions: Vec<UploadSession>,
}

fn session_ref(owner_id: uuid::Uuid, upload_id: String, tree_id: TreeId, node_id: NodeId) -> SessionRef {
    SessionRef {
        owner_id,
        tree_id,
        node_id,
        upload_id,
    }
}

/// `POST /uploads/multipart`
pub async fn initiate_multipart(
    State(state): State<AppState>,
    Owner(owner_id): Owner,
    Json(req): Json<InitiateReq>,
) -> Result<impl IntoResponse, AppError> {
    state
        .trees
        .ensure_node(owner_id, req.tree_id, req.node_id)
        .await?;

    let upload_id = state
        .uploads
        .initiate(
            owner_id,
            req.tree_id,
            req.node_id,
            &req.file_name,
            &req.media_type,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(InitiateResponse { upload_id })))
}

/// `GET /uploads/multipart/{upload_id}`
pub async fn get_session(
    State(state): State<AppState>,
    Owner(owner_id): Owner,
    Path(upload_id): Path<String>,
    Query(q): Query<SessionQuery>,
) -> Result<Json<UploadSession>, AppError> {
    let session = session_ref(owner_id, upload_id, q.tree_id, q.node_id);
    Ok(Json(state.uploads.session(&session).await?))
}

/// `GET /uploads/multipart/{upload_id}/parts/{part_number}`
pub async fn authorize_part(
    State(state): State<AppState>,
    Owner(owner_id): Owner,
    Path((upload_id, part_number)): Path<(String, u32)>,
    Query(q): Query<SessionQuery>,
) -> Result<Json<PresignedPartResponse>, AppError> {
    let session = session_ref(owner_id, upload_id, q.tree_id, q.node_id);
    let presigned_url = state.uploads.authorize_part(&session, part_number).await?;
    Ok(Json(PresignedPartResponse {
        part_number,
        presigned_url,
    }))
}

/// `GET /uploads/multipart/{upload_id}/parts?partCount=N`
pub async fn authorize_parts(
    State(state): State<AppState>,
    Owner(owner_id): Owner,
    Path(upload_id): Path<String>,
    Query(q): Query<PartsQuery>,
) -> Result<Json<PresignedPartsResponse>, AppError> {
    let session = session_ref(owner_id, upload_id, q.tree_id, q.node_id);
    let parts = state.uploads.authorize_parts(&session, q.part_count).await?;
    Ok(Json(PresignedPartsResponse { parts }))
}

/// `PUT /uploads/multipart/{upload_id}/parts/{part_number}`
pub async fn acknowledge_part(
    State(state): State<AppState>,
    Owner(owner_id): Owner,
    Path((upload_id, part_number)): Path<(String, u32)>,
    Json(req): Json<AcknowledgeReq>,
) -> Result<StatusCode, AppError> {
    let session = session_ref(owner_id, upload_id, req.tree_id, req.node_id);
    state
        .uploads
        .acknowledge_part(&session, part_number, &req.etag)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /uploads/multipart/{upload_id}/complete`
///
/// Finalizes the object, then records its key on the node. Repeating the
/// request after the node update failed finalizes nothing new and retries
/// the update.
pub async fn complete_multipart(
    State(state): State<AppState>,
    Owner(owner_id): Owner,
    Path(upload_id): Path<String>,
    Json(req): Json<CompleteReq>,
) -> Result<Json<CompleteResponse>, AppError> {
    let session = session_ref(owner_id, upload_id, req.tree_id, req.node_id);
    let key = state.uploads.complete(&session, &req.parts).await?;

    state
        .trees
        .attach_storage_key(owner_id, req.tree_id, req.node_id, &key)
        .await?;

    Ok(Json(CompleteResponse { url: key }))
}

/// `DELETE /uploads/multipart/{upload_id}`
pub async fn cancel_multipart(
    State(state): State<AppState>,
    Owner(owner_id): Owner,
    Path(upload_id): Path<String>,
    Query(q): Query<SessionQuery>,
) -> Result<StatusCode, AppError> {
    let session = session_ref(owner_id, upload_id, q.tree_id, q.node_id);
    state.uploads.cancel(&session).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /uploads/stale`: the caller's open sessions older than the
/// configured threshold.
pub async fn list_stale(
    State(state): State<AppState>,
    Owner(owner_id): Owner,
) -> Result<Json<StaleResponse>, AppError> {
    let sessions = state
        .uploads
        .list_stale(state.stale_after)
        .await?
        .into_iter()
        .filter(|session| session.owner_id == owner_id)
        .collect();

    Ok(Json(StaleResponse {
        older_than_secs: state.stale_after.as_secs(),
        sessions,
    }))
}
