//! Defines routes for the control plane (trees, uploads, images) and the
//! data plane that presigned URLs point at.
//!
//! ## Structure
//! - **Health**
//!   - `GET    /healthz`, `GET /readyz`
//!
//! - **Trees** (require `x-owner-id`)
//!   - `POST   /trees` : create tree with its root
//!   - `GET    /trees/{tree_id}` : tree with nodes in breadth-first order
//!   - `DELETE /trees/{tree_id}` : delete tree, its objects and open uploads
//!   - `POST   /trees/{tree_id}/nodes` : add a branch
//!   - `GET    /trees/{tree_id}/nodes` : breadth-first export
//!
//! - **Uploads** (require `x-owner-id`)
//!   - `POST   /uploads/multipart` : initiate
//!   - `GET    /uploads/multipart/{upload_id}` : session state
//!   - `DELETE /uploads/multipart/{upload_id}` : cancel
//!   - `GET    /uploads/multipart/{upload_id}/parts?partCount=N` : batch presign
//!   - `GET    /uploads/multipart/{upload_id}/parts/{n}` : presign one part
//!   - `PUT    /uploads/multipart/{upload_id}/parts/{n}` : acknowledge part
//!   - `POST   /uploads/multipart/{upload_id}/complete` : finalize
//!   - `GET    /uploads/stale` : open sessions past the stale threshold
//!   - `POST   /uploads/images`, `DELETE /uploads/images?key=` : thumbnails
//!
//! - **Storage** (presigned, no owner header)
//!   - `PUT    /storage/uploads/{upload_id}/parts/{n}`
//!   - `PUT    /storage/objects/{*key}`, `GET /storage/objects/{*key}`

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        storage_handlers, thumbnail_handlers, tree_handlers, upload_handlers,
    },
    state::AppState,
};
use axum::{
    Router,
    routing::{get, post, put},
};
use tower_http::trace::TraceLayer;

/// Build and return the router for every route.
///
/// The router carries shared state (`AppState`) to all handlers.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Trees
        .route("/trees", post(tree_handlers::create_tree))
        .route(
            "/trees/{tree_id}",
            get(tree_handlers::get_tree).delete(tree_handlers::delete_tree),
        )
        .route(
            "/trees/{tree_id}/nodes",
            post(tree_handlers::add_node).get(tree_handlers::list_nodes),
        )
        // Multipart uploads
        .route("/uploads/multipart", post(upload_handlers::initiate_multipart))
        .route(
            "/uploads/multipart/{upload_id}",
            get(upload_handlers::get_session).delete(upload_handlers::cancel_multipart),
        )
        .route(
            "/uploads/multipart/{upload_id}/parts",
            get(upload_handlers::authorize_parts),
        )
        .route(
            "/uploads/multipart/{upload_id}/parts/{part_number}",
            get(upload_handlers::authorize_part).put(upload_handlers::acknowledge_part),
        )
        .route(
            "/uploads/multipart/{upload_id}/complete",
            post(upload_handlers::complete_multipart),
        )
        .route("/uploads/stale", get(upload_handlers::list_stale))
        // Thumbnails
        .route(
            "/uploads/images",
            post(thumbnail_handlers::authorize_image_upload).delete(thumbnail_handlers::delete_image),
        )
        // Data plane
        .route(
            "/storage/uploads/{upload_id}/parts/{part_number}",
            put(storage_handlers::upload_part),
        )
        .route(
            "/storage/objects/{*key}",
            put(storage_handlers::put_object).get(storage_handlers::get_object),
        )
}

/// Full application: all routes, request tracing and shared state.
pub fn app(state: AppState) -> Router {
    routes().layer(TraceLayer::new_for_http()).with_state(state)
}
