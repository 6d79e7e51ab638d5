use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};

use crate::services::{
    gateway::ObjectGateway, local_gateway::LocalObjectGateway, session_store::SessionStore,
    thumbnail_service::ThumbnailService, tree_repository::TreeRepository,
    tree_service::TreeService, upload_service::UploadCoordinator,
};

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheap to clone: every member is an `Arc` or wraps one.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SqlitePool>,
    pub trees: TreeService,
    pub uploads: UploadCoordinator,
    pub thumbnails: ThumbnailService,
    /// Concrete local store, for the data-plane routes presigned URLs point at.
    pub storage: Arc<LocalObjectGateway>,
    /// Age after which `GET /uploads/stale` reports an open session.
    pub stale_after: Duration,
}

impl AppState {
    /// Wire every service to one database pool and one object store.
    pub fn new(db: Arc<SqlitePool>, storage: LocalObjectGateway, stale_after: Duration) -> Self {
        let storage = Arc::new(storage);
        let gateway: Arc<dyn ObjectGateway> = storage.clone();

        Self {
            trees: TreeService::new(TreeRepository::new(db.clone()), gateway.clone()),
            uploads: UploadCoordinator::new(SessionStore::new(db.clone()), gateway.clone()),
            thumbnails: ThumbnailService::new(gateway),
            storage,
            stale_after,
            db,
        }
    }
}
