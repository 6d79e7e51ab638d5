//! Represents multipart upload sessions for tree nodes and their parts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};
use uuid::Uuid;

use crate::models::tree::{NodeId, TreeId};

/// Lifecycle of an upload session.
///
/// `Initiated -> PartsInFlight -> Completed`, or either open state to
/// `Aborted`. `Completed` and `Aborted` are terminal.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initiated,
    PartsInFlight,
    Completed,
    Aborted,
}

impl SessionState {
    pub const OPEN: [SessionState; 2] = [SessionState::Initiated, SessionState::PartsInFlight];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Initiated => "initiated",
            SessionState::PartsInFlight => "parts_in_flight",
            SessionState::Completed => "completed",
            SessionState::Aborted => "aborted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "initiated" => Some(SessionState::Initiated),
            "parts_in_flight" => Some(SessionState::PartsInFlight),
            "completed" => Some(SessionState::Completed),
            "aborted" => Some(SessionState::Aborted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Aborted)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one upload session on behalf of its owner.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionRef {
    pub owner_id: Uuid,
    pub tree_id: TreeId,
    pub node_id: NodeId,
    pub upload_id: String,
}

/// A multipart upload of one node's video segment.
///
/// The service never sees the bytes; it only tracks state and the integrity
/// tag the client reports for each part.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    /// Upload id issued by the object store.
    pub upload_id: String,

    pub owner_id: Uuid,
    pub tree_id: TreeId,
    pub node_id: NodeId,

    /// Original file name as supplied by the client.
    pub file_name: String,

    /// Deterministic object key: `videos/{owner}/{tree}/{node}/{file}`.
    pub storage_key: String,

    pub content_type: String,

    /// Advisory marker for the tree's entry node (`tree_id == node_id`).
    pub is_root: bool,

    pub state: SessionState,

    /// Part number (1-based) to integrity tag.
    pub parts: BTreeMap<u32, String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn matches(&self, session: &SessionRef) -> bool {
        self.upload_id == session.upload_id
            && self.owner_id == session.owner_id
            && self.tree_id == session.tree_id
            && self.node_id == session.node_id
    }
}

/// One entry of the part list submitted at completion.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPart {
    #[serde(alias = "PartNumber")]
    pub part_number: u32,

    #[serde(alias = "ETag")]
    pub etag: String,
}

impl CompletedPart {
    pub fn new(part_number: u32, etag: impl Into<String>) -> Self {
        Self {
            part_number,
            etag: etag.into(),
        }
    }
}

/// A time-limited URL for uploading one part.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PartAuthorization {
    pub part_number: u32,
    pub presigned_url: String,
}
