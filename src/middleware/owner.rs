//! Caller identity extractor.
//!
//! Authentication happens upstream; the authenticating proxy forwards the
//! verified owner id in the `x-owner-id` header.

use axum::{extract::FromRequestParts, http::request::Parts};
use uuid::Uuid;

use crate::errors::AppError;

pub const OWNER_HEADER: &str = "x-owner-id";

/// Authenticated owner of the trees, uploads and images a request touches.
///
/// ```ignore
/// async fn my_handler(Owner(owner_id): Owner) -> Result<Json<()>, AppError> {
///     tracing::info!(%owner_id, "handling request");
///     Ok(Json(()))
/// }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner(pub Uuid);

impl<S> FromRequestParts<S> for Owner
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(OWNER_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::unauthorized("Missing x-owner-id header"))?;

        let owner_id = Uuid::parse_str(value.trim())
            .map_err(|_| AppError::unauthorized("x-owner-id must be a UUID"))?;

        Ok(Owner(owner_id))
    }
}
