//! HTTP handlers for video trees and their nodes.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    errors::AppError,
    middleware::owner::Owner,
    models::tree::{Node, NodeId, NodeInfo, NodeStatus, TreeId, VideoTree},
    state::AppState,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTreeReq {
    pub title: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddNodeReq {
    pub parent_id: NodeId,
    pub title: String,
    #[serde(default)]
    pub duration_secs: f64,
    #[serde(default)]
    pub status: NodeStatus,
}

/// Tree as returned to clients: nodes flattened in breadth-first order.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeResponse {
    pub id: TreeId,
    pub owner_id: Uuid,
    pub root_id: NodeId,
    pub created_at: DateTime<Utc>,
    pub nodes: Vec<Node>,
}

impl From<&VideoTree> for TreeResponse {
    fn from(tree: &VideoTree) -> Self {
        Self {
            id: tree.id,
            owner_id: tree.owner_id,
            root_id: tree.root().id,
            created_at: tree.created_at,
            nodes: tree.traverse().cloned().collect(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteTreeResponse {
    pub tree_id: TreeId,
    pub deleted_objects: usize,
    pub aborted_uploads: usize,
}

/// `POST /trees`
pub async fn create_tree(
    State(state): State<AppState>,
    Owner(owner_id): Owner,
    Json(req): Json<CreateTreeReq>,
) -> Result<impl IntoResponse, AppError> {
    let tree = state.trees.create_tree(owner_id, req.title.trim()).await?;
    Ok((StatusCode::CREATED, Json(TreeResponse::from(&tree))))
}

/// `GET /trees/{tree_id}`
pub async fn get_tree(
    State(state): State<AppState>,
    Owner(owner_id): Owner,
    Path(tree_id): Path<TreeId>,
) -> Result<Json<TreeResponse>, AppError> {
    let tree = state.trees.get_tree(owner_id, tree_id).await?;
    Ok(Json(TreeResponse::from(&tree)))
}

/// `DELETE /trees/{tree_id}`: aborts open uploads, deletes stored objects
/// (including ones from completed uploads a node no longer points at), then
/// the tree itself.
pub async fn delete_tree(
    State(state): State<AppState>,
    Owner(owner_id): Owner,
    Path(tree_id): Path<TreeId>,
) -> Result<Json<DeleteTreeResponse>, AppError> {
    // ownership first, the session sweep below is not owner-scoped
    state.trees.get_tree(owner_id, tree_id).await?;

    let aborted_uploads = state.uploads.abort_tree_sessions(tree_id).await?;
    let uploaded_keys = state.uploads.completed_keys(tree_id).await?;
    let deleted_objects = state
        .trees
        .delete_tree(owner_id, tree_id, uploaded_keys)
        .await?;

    Ok(Json(DeleteTreeResponse {
        tree_id,
        deleted_objects,
        aborted_uploads,
    }))
}

/// `POST /trees/{tree_id}/nodes`
pub async fn add_node(
    State(state): State<AppState>,
    Owner(owner_id): Owner,
    Path(tree_id): Path<TreeId>,
    Json(req): Json<AddNodeReq>,
) -> Result<impl IntoResponse, AppError> {
    if !req.duration_secs.is_finite() || req.duration_secs < 0.0 {
        return Err(AppError::unprocessable(
            "durationSecs must be a non-negative number",
        ));
    }

    let info = NodeInfo {
        title: req.title.trim().to_string(),
        duration_secs: req.duration_secs,
        storage_key: None,
        status: req.status,
    };
    let node = state
        .trees
        .add_child(owner_id, tree_id, req.parent_id, info)
        .await?;
    Ok((StatusCode::CREATED, Json(node)))
}

/// `GET /trees/{tree_id}/nodes`: breadth-first export.
pub async fn list_nodes(
    State(state): State<AppState>,
    Owner(owner_id): Owner,
    Path(tree_id): Path<TreeId>,
) -> Result<Json<Vec<Node>>, AppError> {
    Ok(Json(state.trees.traverse(owner_id, tree_id).await?))
}
