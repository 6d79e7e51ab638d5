//! src/services/upload_service.rs
//!
//! UploadCoordinator: multipart upload lifecycle for tree nodes.
//!
//! The coordinator never handles video bytes. It asks the object store for an
//! upload id, hands out time-limited part URLs, records the integrity tag the
//! client reports for each part, and finally asks the store to assemble (or
//! abort) the object. Session state lives in [`SessionStore`], so any
//! instance can serve any request.
//!
//! Part ordering is checked only at completion: parts may be uploaded and
//! acknowledged in any order.

use chrono::{TimeDelta, Utc};
use futures::future::try_join_all;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    models::{
        media_type::MediaFamily,
        tree::{NodeId, TreeId},
        upload::{CompletedPart, PartAuthorization, SessionRef, SessionState, UploadSession},
    },
    services::{
        gateway::{GatewayError, ObjectGateway},
        session_store::SessionStore,
    },
};

/// Highest part number accepted by S3-compatible stores.
pub const MAX_PART_NUMBER: u32 = 10_000;

const MAX_FILE_NAME_LEN: usize = 255;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid media type `{0}`: expected a video type")]
    InvalidMediaType(String),
    #[error("invalid file name `{0}`")]
    InvalidFileName(String),
    #[error("part number {0} is outside 1..=10000")]
    InvalidPartNumber(u32),
    #[error("part {0} was acknowledged without an integrity tag")]
    MissingIntegrityTag(u32),
    #[error("upload session `{0}` not found")]
    NotFound(String),
    #[error("upload session `{upload_id}` is already {state}")]
    SessionTerminated {
        upload_id: String,
        state: SessionState,
    },
    #[error("incomplete upload: {0}")]
    IncompleteUpload(String),
    #[error("object store failed to finalize upload `{upload_id}`: {source}")]
    StorageFinalizeFailed {
        upload_id: String,
        source: GatewayError,
    },
    #[error(transparent)]
    Storage(#[from] GatewayError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type UploadResult<T> = Result<T, UploadError>;

#[derive(Clone)]
pub struct UploadCoordinator {
    sessions: SessionStore,
    gateway: Arc<dyn ObjectGateway>,
}

impl UploadCoordinator {
    pub fn new(sessions: SessionStore, gateway: Arc<dyn ObjectGateway>) -> Self {
        Self { sessions, gateway }
    }

    /// Deterministic object key for a node's video segment.
    pub fn storage_key(owner_id: Uuid, tree_id: TreeId, node_id: NodeId, file_name: &str) -> String {
        format!("videos/{owner_id}/{tree_id}/{node_id}/{file_name}")
    }

    /// Start a multipart upload for one node and return the store-issued id.
    pub async fn initiate(
        &self,
        owner_id: Uuid,
        tree_id: TreeId,
        node_id: NodeId,
        file_name: &str,
        media_type: &str,
    ) -> UploadResult<String> {
        if MediaFamily::Video.subtype_of(media_type).is_none() {
            return Err(UploadError::InvalidMediaType(media_type.to_string()));
        }
        ensure_file_name_safe(file_name)?;

        let storage_key = Self::storage_key(owner_id, tree_id, node_id, file_name);
        let is_root = tree_id == node_id;
        let mut metadata = BTreeMap::new();
        metadata.insert("root".to_string(), is_root.to_string());

        let upload_id = self
            .gateway
            .create_multipart_upload(&storage_key, media_type, metadata)
            .await?;

        let now = Utc::now();
        let session = UploadSession {
            upload_id: upload_id.clone(),
            owner_id,
            tree_id,
            node_id,
            file_name: file_name.to_string(),
            storage_key,
            content_type: media_type.to_string(),
            is_root,
            state: SessionState::Initiated,
            parts: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        };

        if let Err(err) = self.sessions.insert(&session).await {
            // Without a session record nobody could ever abort this upload.
            if let Err(abort_err) = self
                .gateway
                .abort_multipart_upload(&session.storage_key, &upload_id)
                .await
            {
                warn!(upload_id, "failed to abort unrecorded upload: {}", abort_err);
            }
            return Err(err.into());
        }

        info!(
            upload_id,
            %tree_id,
            %node_id,
            key = %session.storage_key,
            "initiated multipart upload"
        );
        Ok(upload_id)
    }

    /// Read a session on behalf of its owner.
    pub async fn session(&self, session: &SessionRef) -> UploadResult<UploadSession> {
        match self.sessions.get(&session.upload_id).await? {
            Some(current) if current.matches(session) => Ok(current),
            _ => Err(UploadError::NotFound(session.upload_id.clone())),
        }
    }

    /// Issue a time-limited URL for uploading one part.
    ///
    /// Safe to call again for the same part (client retry); earlier URLs stay
    /// valid until they expire.
    pub async fn authorize_part(
        &self,
        session: &SessionRef,
        part_number: u32,
    ) -> UploadResult<String> {
        ensure_part_number(part_number)?;
        let current = self.open_session(session).await?;

        let url = self
            .gateway
            .presign_part_upload(&current.storage_key, &current.upload_id, part_number)
            .await?;

        self.mark_in_flight(session).await?;
        debug!(upload_id = %session.upload_id, part_number, "authorized part upload");
        Ok(url)
    }

    /// Issue URLs for parts `1..=part_count` in one round-trip.
    pub async fn authorize_parts(
        &self,
        session: &SessionRef,
        part_count: u32,
    ) -> UploadResult<Vec<PartAuthorization>> {
        if part_count == 0 || part_count > MAX_PART_NUMBER {
            return Err(UploadError::InvalidPartNumber(part_count));
        }
        let current = self.open_session(session).await?;

        let urls = try_join_all((1..=part_count).map(|part_number| {
            self.gateway
                .presign_part_upload(&current.storage_key, &current.upload_id, part_number)
        }))
        .await?;

        self.mark_in_flight(session).await?;
        debug!(upload_id = %session.upload_id, part_count, "authorized part uploads");
        Ok(urls
            .into_iter()
            .zip(1..)
            .map(|(presigned_url, part_number)| PartAuthorization {
                part_number,
                presigned_url,
            })
            .collect())
    }

    /// Record the integrity tag the client received for an uploaded part.
    ///
    /// Order independent; acknowledging the same part again overwrites the
    /// earlier tag.
    pub async fn acknowledge_part(
        &self,
        session: &SessionRef,
        part_number: u32,
        integrity_tag: &str,
    ) -> UploadResult<()> {
        ensure_part_number(part_number)?;
        if integrity_tag.trim().is_empty() {
            return Err(UploadError::MissingIntegrityTag(part_number));
        }
        self.open_session(session).await?;
        self.mark_in_flight(session).await?;

        if !self
            .sessions
            .record_part(&session.upload_id, part_number, integrity_tag)
            .await?
        {
            return Err(self.state_conflict(session).await);
        }
        debug!(upload_id = %session.upload_id, part_number, "acknowledged part");
        Ok(())
    }

    /// Assemble the uploaded parts into the final object.
    ///
    /// `parts` must be sorted and contiguous from 1. A malformed list, or one
    /// whose tags the store rejects, fails with `IncompleteUpload` before
    /// anything changes so the client can fix it and retry; an object-store
    /// failure is reported as retryable and also leaves the session
    /// untouched. Repeating the call for a session already completed with the
    /// same parts returns the same key, so a caller whose follow-up work
    /// failed can retry, unless a later upload to the node has replaced it.
    /// Attaching the returned key to the tree node is the caller's job.
    pub async fn complete(
        &self,
        session: &SessionRef,
        parts: &[CompletedPart],
    ) -> UploadResult<String> {
        validate_part_list(parts)?;
        let current = self.session(session).await?;
        let replay = current.state == SessionState::Completed
            && same_parts(&current, parts)
            && !self.sessions.superseded(&current.upload_id).await?;
        match current.state {
            SessionState::Completed if replay => {
                debug!(upload_id = %current.upload_id, "session already completed");
                return Ok(current.storage_key);
            }
            SessionState::Completed | SessionState::Aborted => {
                return Err(UploadError::SessionTerminated {
                    upload_id: current.upload_id,
                    state: current.state,
                });
            }
            SessionState::Initiated | SessionState::PartsInFlight => {}
        }

        let storage_key = self
            .gateway
            .complete_multipart_upload(&current.storage_key, &current.upload_id, parts)
            .await
            .map_err(|source| match source {
                GatewayError::InvalidPart {
                    part_number,
                    reason,
                } => UploadError::IncompleteUpload(format!("part {part_number}: {reason}")),
                source => {
                    warn!(upload_id = %current.upload_id, "finalize failed: {}", source);
                    UploadError::StorageFinalizeFailed {
                        upload_id: current.upload_id.clone(),
                        source,
                    }
                }
            })?;

        if !self
            .sessions
            .mark_completed(&session.upload_id, parts)
            .await?
        {
            warn!(
                upload_id = %session.upload_id,
                "session closed while its object was being finalized"
            );
            return Err(self.state_conflict(session).await);
        }

        info!(
            upload_id = %session.upload_id,
            key = %storage_key,
            parts = parts.len(),
            "completed multipart upload"
        );
        Ok(storage_key)
    }

    /// Abort an open upload and release its parts.
    ///
    /// Idempotent: cancelling an aborted session succeeds. A completed
    /// session cannot be cancelled.
    pub async fn cancel(&self, session: &SessionRef) -> UploadResult<()> {
        let current = self.session(session).await?;
        match current.state {
            SessionState::Aborted => {
                debug!(upload_id = %current.upload_id, "session already aborted");
                return Ok(());
            }
            SessionState::Completed => {
                return Err(UploadError::SessionTerminated {
                    upload_id: current.upload_id,
                    state: current.state,
                });
            }
            SessionState::Initiated | SessionState::PartsInFlight => {}
        }

        self.abort_at_store(&current).await?;

        if !self
            .sessions
            .transition(&current.upload_id, &SessionState::OPEN, SessionState::Aborted)
            .await?
        {
            // Lost a race: fine if someone else aborted it too.
            let now = self.session(session).await?;
            if now.state != SessionState::Aborted {
                return Err(UploadError::SessionTerminated {
                    upload_id: now.upload_id,
                    state: now.state,
                });
            }
        }

        info!(upload_id = %current.upload_id, key = %current.storage_key, "cancelled multipart upload");
        Ok(())
    }

    /// Open sessions created more than `older_than` ago.
    ///
    /// Listing primitive for an external sweeper, which cancels what it finds.
    pub async fn list_stale(&self, older_than: Duration) -> UploadResult<Vec<UploadSession>> {
        let Some(cutoff) = TimeDelta::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Ok(Vec::new());
        };

        Ok(self.sessions.list_open_created_before(cutoff).await?)
    }

    /// Keys of every object a completed session of this tree produced,
    /// including ones a later upload superseded on its node.
    pub async fn completed_keys(&self, tree_id: TreeId) -> UploadResult<Vec<String>> {
        Ok(self.sessions.list_completed_keys_for_tree(tree_id).await?)
    }

    /// Abort every open session of a tree; returns how many were aborted.
    ///
    /// Store failures are logged and skipped so one stuck upload does not
    /// block deleting the tree.
    pub async fn abort_tree_sessions(&self, tree_id: TreeId) -> UploadResult<usize> {
        let mut aborted = 0;
        for session in self.sessions.list_open_for_tree(tree_id).await? {
            if let Err(err) = self.abort_at_store(&session).await {
                warn!(upload_id = %session.upload_id, "failed to abort upload: {}", err);
                continue;
            }
            if self
                .sessions
                .transition(&session.upload_id, &SessionState::OPEN, SessionState::Aborted)
                .await?
            {
                aborted += 1;
            }
        }
        if aborted > 0 {
            info!(%tree_id, aborted, "aborted open uploads of tree");
        }
        Ok(aborted)
    }

    async fn abort_at_store(&self, session: &UploadSession) -> UploadResult<()> {
        match self
            .gateway
            .abort_multipart_upload(&session.storage_key, &session.upload_id)
            .await
        {
            Ok(()) => Ok(()),
            Err(GatewayError::UploadNotFound(_)) => {
                debug!(upload_id = %session.upload_id, "upload already gone from store");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn open_session(&self, session: &SessionRef) -> UploadResult<UploadSession> {
        let current = self.session(session).await?;
        if current.state.is_terminal() {
            return Err(UploadError::SessionTerminated {
                upload_id: current.upload_id,
                state: current.state,
            });
        }
        Ok(current)
    }

    async fn mark_in_flight(&self, session: &SessionRef) -> UploadResult<()> {
        if self
            .sessions
            .transition(
                &session.upload_id,
                &SessionState::OPEN,
                SessionState::PartsInFlight,
            )
            .await?
        {
            Ok(())
        } else {
            Err(self.state_conflict(session).await)
        }
    }

    /// Explain why a conditional write matched nothing.
    async fn state_conflict(&self, session: &SessionRef) -> UploadError {
        match self.session(session).await {
            Ok(current) => UploadError::SessionTerminated {
                upload_id: current.upload_id,
                state: current.state,
            },
            Err(err) => err,
        }
    }
}

fn ensure_part_number(part_number: u32) -> UploadResult<()> {
    if (1..=MAX_PART_NUMBER).contains(&part_number) {
        Ok(())
    } else {
        Err(UploadError::InvalidPartNumber(part_number))
    }
}

/// File names become the last key segment, so they must be a single safe
/// path component.
fn ensure_file_name_safe(file_name: &str) -> UploadResult<()> {
    let invalid = file_name.trim().is_empty()
        || file_name.len() > MAX_FILE_NAME_LEN
        || file_name == "."
        || file_name.contains("..")
        || file_name
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_control());
    if invalid {
        return Err(UploadError::InvalidFileName(file_name.to_string()));
    }
    Ok(())
}

fn same_parts(session: &UploadSession, parts: &[CompletedPart]) -> bool {
    session.parts.len() == parts.len()
        && parts
            .iter()
            .all(|part| session.parts.get(&part.part_number) == Some(&part.etag))
}

/// Parts must be numbered 1, 2, 3, … in order, each with a tag.
fn validate_part_list(parts: &[CompletedPart]) -> UploadResult<()> {
    if parts.is_empty() {
        return Err(UploadError::IncompleteUpload("no parts supplied".into()));
    }
    if parts.len() > MAX_PART_NUMBER as usize {
        return Err(UploadError::InvalidPartNumber(parts.len() as u32));
    }
    for (expected, part) in (1u32..).zip(parts) {
        if part.part_number != expected {
            return Err(UploadError::IncompleteUpload(format!(
                "expected part {expected}, found part {}",
                part.part_number
            )));
        }
        if part.etag.trim().is_empty() {
            return Err(UploadError::IncompleteUpload(format!(
                "part {expected} has no integrity tag"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use async_trait::async_trait;
    use std::{
        collections::HashMap,
        io,
        sync::{
            Mutex,
            atomic::{AtomicBool, Ordering},
        },
    };

    use crate::services::gateway::GatewayResult;

    /// In-memory object store that can be told to fail.
    #[derive(Default)]
    struct FakeGateway {
        uploads: Mutex<HashMap<String, String>>,
        completed: Mutex<Vec<(String, Vec<CompletedPart>)>>,
        fail_complete: AtomicBool,
        fail_abort: AtomicBool,
        reject_tags: AtomicBool,
    }

    #[async_trait]
    impl ObjectGateway for FakeGateway {
        async fn create_multipart_upload(
            &self,
            key: &str,
            _content_type: &str,
            _metadata: BTreeMap<String, String>,
        ) -> GatewayResult<String> {
            let upload_id = Uuid::new_v4().simple().to_string();
            self.uploads
                .lock()
                .unwrap()
                .insert(upload_id.clone(), key.to_string());
            Ok(upload_id)
        }

        async fn presign_part_upload(
            &self,
            _key: &str,
            upload_id: &str,
            part_number: u32,
        ) -> GatewayResult<String> {
            Ok(format!("mem://{upload_id}/{part_number}"))
        }

        async fn complete_multipart_upload(
            &self,
            key: &str,
            upload_id: &str,
            parts: &[CompletedPart],
        ) -> GatewayResult<String> {
            if self.fail_complete.load(Ordering::SeqCst) {
                return Err(GatewayError::Io(io::Error::other("store unavailable")));
            }
            if self.reject_tags.load(Ordering::SeqCst) {
                return Err(GatewayError::InvalidPart {
                    part_number: 1,
                    reason: "integrity tag does not match".into(),
                });
            }
            self.uploads
                .lock()
                .unwrap()
                .remove(upload_id)
                .ok_or_else(|| GatewayError::UploadNotFound(upload_id.to_string()))?;
            self.completed
                .lock()
                .unwrap()
                .push((key.to_string(), parts.to_vec()));
            Ok(key.to_string())
        }

        async fn abort_multipart_upload(&self, _key: &str, upload_id: &str) -> GatewayResult<()> {
            if self.fail_abort.load(Ordering::SeqCst) {
                return Err(GatewayError::Io(io::Error::other("store unavailable")));
            }
            self.uploads
                .lock()
                .unwrap()
                .remove(upload_id)
                .map(|_| ())
                .ok_or_else(|| GatewayError::UploadNotFound(upload_id.to_string()))
        }

        async fn presign_put_object(&self, key: &str, _content_type: &str) -> GatewayResult<String> {
            Ok(format!("mem://{key}"))
        }

        async fn delete_object(&self, _key: &str) -> GatewayResult<()> {
            Ok(())
        }
    }

    async fn coordinator() -> (UploadCoordinator, Arc<FakeGateway>) {
        let pool = Arc::new(memory_pool().await.unwrap());
        let gateway = Arc::new(FakeGateway::default());
        let coordinator = UploadCoordinator::new(SessionStore::new(pool), gateway.clone());
        (coordinator, gateway)
    }

    async fn start(coordinator: &UploadCoordinator) -> SessionRef {
        let owner_id = Uuid::new_v4();
        let tree_id = Uuid::new_v4();
        let node_id = Uuid::new_v4();
        let upload_id = coordinator
            .initiate(owner_id, tree_id, node_id, "clip.mp4", "video/mp4")
            .await
            .unwrap();
        SessionRef {
            owner_id,
            tree_id,
            node_id,
            upload_id,
        }
    }

    async fn state_of(coordinator: &UploadCoordinator, session: &SessionRef) -> SessionState {
        coordinator.session(session).await.unwrap().state
    }

    #[tokio::test]
    async fn happy_path_completes_session() {
        let (coordinator, gateway) = coordinator().await;
        let session = start(&coordinator).await;
        assert_eq!(state_of(&coordinator, &session).await, SessionState::Initiated);

        let url = coordinator.authorize_part(&session, 1).await.unwrap();
        assert!(!url.is_empty());
        assert_eq!(
            state_of(&coordinator, &session).await,
            SessionState::PartsInFlight
        );

        coordinator
            .acknowledge_part(&session, 1, "abc")
            .await
            .unwrap();
        let key = coordinator
            .complete(&session, &[CompletedPart::new(1, "abc")])
            .await
            .unwrap();

        assert_eq!(
            key,
            format!(
                "videos/{}/{}/{}/clip.mp4",
                session.owner_id, session.tree_id, session.node_id
            )
        );
        let finished = coordinator.session(&session).await.unwrap();
        assert_eq!(finished.state, SessionState::Completed);
        assert_eq!(finished.parts.get(&1).map(String::as_str), Some("abc"));
        assert_eq!(gateway.completed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn root_flag_follows_tree_and_node_ids() {
        let (coordinator, _) = coordinator().await;
        let owner_id = Uuid::new_v4();
        let tree_id = Uuid::new_v4();
        let upload_id = coordinator
            .initiate(owner_id, tree_id, tree_id, "root.mp4", "video/webm")
            .await
            .unwrap();
        let session = coordinator
            .session(&SessionRef {
                owner_id,
                tree_id,
                node_id: tree_id,
                upload_id,
            })
            .await
            .unwrap();
        assert!(session.is_root);
    }

    #[tokio::test]
    async fn non_video_media_type_creates_nothing() {
        let (coordinator, gateway) = coordinator().await;
        let err = coordinator
            .initiate(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), "notes.txt", "text/plain")
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::InvalidMediaType(_)));
        assert!(gateway.uploads.lock().unwrap().is_empty());

        let fabricated = SessionRef {
            owner_id: Uuid::new_v4(),
            tree_id: Uuid::new_v4(),
            node_id: Uuid::new_v4(),
            upload_id: "fabricated".into(),
        };
        assert!(matches!(
            coordinator.authorize_part(&fabricated, 1).await,
            Err(UploadError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn unsafe_file_names_are_rejected() {
        let (coordinator, gateway) = coordinator().await;
        for name in ["", "../x.mp4", "a/b.mp4", "a\\b.mp4", "bad\n.mp4"] {
            let err = coordinator
                .initiate(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), name, "video/mp4")
                .await
                .unwrap_err();
            assert!(matches!(err, UploadError::InvalidFileName(_)), "{name:?}");
        }
        assert!(gateway.uploads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn session_is_scoped_to_owner_tree_and_node() {
        let (coordinator, _) = coordinator().await;
        let session = start(&coordinator).await;

        let other_owner = SessionRef {
            owner_id: Uuid::new_v4(),
            ..session.clone()
        };
        let other_node = SessionRef {
            node_id: Uuid::new_v4(),
            ..session.clone()
        };
        for wrong in [other_owner, other_node] {
            assert!(matches!(
                coordinator.authorize_part(&wrong, 1).await,
                Err(UploadError::NotFound(_))
            ));
            assert!(matches!(
                coordinator.cancel(&wrong).await,
                Err(UploadError::NotFound(_))
            ));
        }
    }

    #[tokio::test]
    async fn part_numbers_are_range_checked() {
        let (coordinator, _) = coordinator().await;
        let session = start(&coordinator).await;
        assert!(matches!(
            coordinator.authorize_part(&session, 0).await,
            Err(UploadError::InvalidPartNumber(0))
        ));
        assert!(matches!(
            coordinator
                .authorize_part(&session, MAX_PART_NUMBER + 1)
                .await,
            Err(UploadError::InvalidPartNumber(_))
        ));
        assert!(matches!(
            coordinator.acknowledge_part(&session, 0, "x").await,
            Err(UploadError::InvalidPartNumber(0))
        ));
        assert!(matches!(
            coordinator.acknowledge_part(&session, 1, "  ").await,
            Err(UploadError::MissingIntegrityTag(1))
        ));
        // rejected input never moves the session
        assert_eq!(state_of(&coordinator, &session).await, SessionState::Initiated);
    }

    #[tokio::test]
    async fn reissued_part_urls_are_independent() {
        let (coordinator, _) = coordinator().await;
        let session = start(&coordinator).await;
        let first = coordinator.authorize_part(&session, 2).await.unwrap();
        let again = coordinator.authorize_part(&session, 2).await.unwrap();
        let other = coordinator.authorize_part(&session, 1).await.unwrap();
        assert_eq!(first, again);
        assert_ne!(first, other);
    }

    #[tokio::test]
    async fn batch_authorization_numbers_parts_from_one() {
        let (coordinator, _) = coordinator().await;
        let session = start(&coordinator).await;
        let parts = coordinator.authorize_parts(&session, 3).await.unwrap();
        assert_eq!(
            parts.iter().map(|p| p.part_number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(parts[2].presigned_url.ends_with("/3"));
        assert!(matches!(
            coordinator.authorize_parts(&session, 0).await,
            Err(UploadError::InvalidPartNumber(0))
        ));
    }

    #[tokio::test]
    async fn acknowledgment_order_does_not_matter() {
        let (coordinator, _) = coordinator().await;
        let orders: [[u32; 3]; 3] = [[1, 2, 3], [3, 1, 2], [2, 3, 1]];

        let mut results = Vec::new();
        for order in orders {
            let session = start(&coordinator).await;
            for part_number in order {
                coordinator
                    .acknowledge_part(&session, part_number, &format!("tag-{part_number}"))
                    .await
                    .unwrap();
            }
            results.push(coordinator.session(&session).await.unwrap().parts);
        }

        assert_eq!(results[0].len(), 3);
        assert!(results.iter().all(|parts| *parts == results[0]));
    }

    #[tokio::test]
    async fn duplicate_acknowledgment_keeps_latest_tag() {
        let (coordinator, _) = coordinator().await;
        let session = start(&coordinator).await;
        coordinator.acknowledge_part(&session, 1, "old").await.unwrap();
        coordinator.acknowledge_part(&session, 1, "new").await.unwrap();
        let parts = coordinator.session(&session).await.unwrap().parts;
        assert_eq!(parts.get(&1).map(String::as_str), Some("new"));
    }

    #[tokio::test]
    async fn concurrent_acknowledgments_all_land() {
        let (coordinator, _) = coordinator().await;
        let session = start(&coordinator).await;

        let mut handles = Vec::new();
        for part_number in 1..=20u32 {
            let coordinator = coordinator.clone();
            let session = session.clone();
            handles.push(tokio::spawn(async move {
                coordinator
                    .acknowledge_part(&session, part_number, &format!("tag-{part_number}"))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let parts = coordinator.session(&session).await.unwrap().parts;
        assert_eq!(parts.len(), 20);
        assert_eq!(parts.get(&17).map(String::as_str), Some("tag-17"));
    }

    #[tokio::test]
    async fn gap_in_parts_is_rejected_and_retryable() {
        let (coordinator, gateway) = coordinator().await;
        let session = start(&coordinator).await;
        for part_number in 1..=3 {
            coordinator
                .acknowledge_part(&session, part_number, &format!("tag{part_number}"))
                .await
                .unwrap();
        }

        let err = coordinator
            .complete(
                &session,
                &[CompletedPart::new(1, "tag1"), CompletedPart::new(3, "tag3")],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::IncompleteUpload(_)));
        assert_eq!(
            state_of(&coordinator, &session).await,
            SessionState::PartsInFlight
        );
        assert!(gateway.completed.lock().unwrap().is_empty());

        coordinator
            .complete(
                &session,
                &[
                    CompletedPart::new(1, "tag1"),
                    CompletedPart::new(2, "tag2"),
                    CompletedPart::new(3, "tag3"),
                ],
            )
            .await
            .unwrap();
        assert_eq!(state_of(&coordinator, &session).await, SessionState::Completed);
    }

    #[tokio::test]
    async fn unsorted_or_empty_part_lists_are_incomplete() {
        let (coordinator, _) = coordinator().await;
        let session = start(&coordinator).await;
        assert!(matches!(
            coordinator
                .complete(&session, &[CompletedPart::new(2, "b"), CompletedPart::new(1, "a")])
                .await,
            Err(UploadError::IncompleteUpload(_))
        ));
        assert!(matches!(
            coordinator.complete(&session, &[]).await,
            Err(UploadError::IncompleteUpload(_))
        ));
    }

    #[tokio::test]
    async fn finalize_failure_is_retryable() {
        let (coordinator, gateway) = coordinator().await;
        let session = start(&coordinator).await;
        coordinator.acknowledge_part(&session, 1, "abc").await.unwrap();

        gateway.fail_complete.store(true, Ordering::SeqCst);
        let err = coordinator
            .complete(&session, &[CompletedPart::new(1, "abc")])
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::StorageFinalizeFailed { .. }));
        assert_eq!(
            state_of(&coordinator, &session).await,
            SessionState::PartsInFlight
        );

        gateway.fail_complete.store(false, Ordering::SeqCst);
        coordinator
            .complete(&session, &[CompletedPart::new(1, "abc")])
            .await
            .unwrap();
        assert_eq!(state_of(&coordinator, &session).await, SessionState::Completed);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_terminal() {
        let (coordinator, gateway) = coordinator().await;
        let session = start(&coordinator).await;
        coordinator.authorize_part(&session, 1).await.unwrap();

        coordinator.cancel(&session).await.unwrap();
        coordinator.cancel(&session).await.unwrap();
        assert_eq!(state_of(&coordinator, &session).await, SessionState::Aborted);
        assert!(gateway.uploads.lock().unwrap().is_empty());

        assert!(matches!(
            coordinator.authorize_part(&session, 2).await,
            Err(UploadError::SessionTerminated {
                state: SessionState::Aborted,
                ..
            })
        ));
        assert!(matches!(
            coordinator.acknowledge_part(&session, 1, "abc").await,
            Err(UploadError::SessionTerminated { .. })
        ));
        assert!(matches!(
            coordinator
                .complete(&session, &[CompletedPart::new(1, "abc")])
                .await,
            Err(UploadError::SessionTerminated { .. })
        ));
    }

    #[tokio::test]
    async fn cancel_after_completion_is_rejected() {
        let (coordinator, _) = coordinator().await;
        let session = start(&coordinator).await;
        coordinator
            .complete(&session, &[CompletedPart::new(1, "abc")])
            .await
            .unwrap();
        assert!(matches!(
            coordinator.cancel(&session).await,
            Err(UploadError::SessionTerminated {
                state: SessionState::Completed,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn cancel_treats_missing_store_upload_as_success() {
        let (coordinator, gateway) = coordinator().await;
        let session = start(&coordinator).await;
        gateway.uploads.lock().unwrap().clear();

        coordinator.cancel(&session).await.unwrap();
        assert_eq!(state_of(&coordinator, &session).await, SessionState::Aborted);
    }

    #[tokio::test]
    async fn cancel_surfaces_store_failure_and_keeps_state() {
        let (coordinator, gateway) = coordinator().await;
        let session = start(&coordinator).await;
        gateway.fail_abort.store(true, Ordering::SeqCst);

        assert!(matches!(
            coordinator.cancel(&session).await,
            Err(UploadError::Storage(GatewayError::Io(_)))
        ));
        assert_eq!(state_of(&coordinator, &session).await, SessionState::Initiated);
    }

    #[tokio::test]
    async fn stale_listing_and_tree_abort() {
        let (coordinator, _) = coordinator().await;
        let open = start(&coordinator).await;
        let done = start(&coordinator).await;
        coordinator
            .complete(&done, &[CompletedPart::new(1, "abc")])
            .await
            .unwrap();

        let stale = coordinator.list_stale(Duration::ZERO).await.unwrap();
        assert_eq!(
            stale.iter().map(|s| s.upload_id.as_str()).collect::<Vec<_>>(),
            vec![open.upload_id.as_str()]
        );
        assert!(
            coordinator
                .list_stale(Duration::from_secs(3600))
                .await
                .unwrap()
                .is_empty()
        );

        assert_eq!(coordinator.abort_tree_sessions(open.tree_id).await.unwrap(), 1);
        assert_eq!(state_of(&coordinator, &open).await, SessionState::Aborted);
        assert_eq!(coordinator.abort_tree_sessions(done.tree_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rejected_integrity_tag_is_a_client_error() {
        let (coordinator, gateway) = coordinator().await;
        let session = start(&coordinator).await;
        coordinator.acknowledge_part(&session, 1, "abc").await.unwrap();

        gateway.reject_tags.store(true, Ordering::SeqCst);
        let err = coordinator
            .complete(&session, &[CompletedPart::new(1, "wrong")])
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::IncompleteUpload(_)), "{err:?}");
        assert_eq!(
            state_of(&coordinator, &session).await,
            SessionState::PartsInFlight
        );

        gateway.reject_tags.store(false, Ordering::SeqCst);
        coordinator
            .complete(&session, &[CompletedPart::new(1, "abc")])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn repeated_completion_returns_the_same_key() {
        let (coordinator, gateway) = coordinator().await;
        let session = start(&coordinator).await;
        let parts = [CompletedPart::new(1, "a"), CompletedPart::new(2, "b")];

        let key = coordinator.complete(&session, &parts).await.unwrap();
        let again = coordinator.complete(&session, &parts).await.unwrap();
        assert_eq!(key, again);
        assert_eq!(gateway.completed.lock().unwrap().len(), 1);

        assert!(matches!(
            coordinator
                .complete(&session, &[CompletedPart::new(1, "a")])
                .await,
            Err(UploadError::SessionTerminated {
                state: SessionState::Completed,
                ..
            })
        ));
        assert!(matches!(
            coordinator
                .complete(&session, &[CompletedPart::new(1, "a"), CompletedPart::new(2, "x")])
                .await,
            Err(UploadError::SessionTerminated { .. })
        ));
    }

    #[tokio::test]
    async fn completion_replay_refused_after_node_got_newer_video() {
        let (coordinator, _) = coordinator().await;
        let first = start(&coordinator).await;
        let parts = [CompletedPart::new(1, "a")];
        coordinator.complete(&first, &parts).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let upload_id = coordinator
            .initiate(first.owner_id, first.tree_id, first.node_id, "take2.mp4", "video/mp4")
            .await
            .unwrap();
        let second = SessionRef {
            upload_id,
            ..first.clone()
        };
        coordinator.complete(&second, &parts).await.unwrap();

        assert!(matches!(
            coordinator.complete(&first, &parts).await,
            Err(UploadError::SessionTerminated { .. })
        ));
        assert_eq!(
            coordinator.completed_keys(first.tree_id).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn cancel_racing_part_traffic_ends_aborted() {
        let (coordinator, _) = coordinator().await;
        let session = start(&coordinator).await;

        let mut handles = Vec::new();
        for part_number in 1..=16u32 {
            let coordinator = coordinator.clone();
            let session = session.clone();
            handles.push(tokio::spawn(async move {
                if part_number % 2 == 0 {
                    coordinator
                        .authorize_part(&session, part_number)
                        .await
                        .map(|_| ())
                } else {
                    coordinator
                        .acknowledge_part(&session, part_number, &format!("tag-{part_number}"))
                        .await
                }
            }));
        }
        let cancel = {
            let coordinator = coordinator.clone();
            let session = session.clone();
            tokio::spawn(async move { coordinator.cancel(&session).await })
        };

        cancel.await.unwrap().unwrap();
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => {}
                Err(UploadError::SessionTerminated {
                    state: SessionState::Aborted,
                    ..
                }) => {}
                Err(other) => panic!("unexpected outcome racing cancel: {other:?}"),
            }
        }

        assert_eq!(state_of(&coordinator, &session).await, SessionState::Aborted);
        assert!(matches!(
            coordinator.acknowledge_part(&session, 1, "late").await,
            Err(UploadError::SessionTerminated { .. })
        ));
    }
}
