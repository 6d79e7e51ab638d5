//! Data-plane handlers: the targets of presigned URLs.
//!
//! Uploads are authorized by the URL signature alone (no owner header), the
//! same way a client talks to an S3 bucket with a presigned link. Bodies are
//! streamed to disk without buffering in memory.

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use futures::StreamExt;
use serde::Deserialize;
use std::io;
use tokio_util::io::ReaderStream;

use crate::{
    errors::AppError,
    models::object::StoredObject,
    services::signing::{object_resource, part_resource},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct SignedPartQuery {
    pub expires: i64,
    pub signature: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedObjectQuery {
    pub content_type: String,
    pub expires: i64,
    pub signature: String,
}

fn body_stream(body: Body) -> impl futures::Stream<Item = io::Result<bytes::Bytes>> + Send {
    body.into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other))
}

fn etag_response(etag: &str) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
        response.headers_mut().insert(header::ETAG, value);
    }
    response
}

/// `PUT /storage/uploads/{upload_id}/parts/{part_number}`
///
/// Stores one part and returns its integrity tag in the `ETag` header.
pub async fn upload_part(
    State(state): State<AppState>,
    Path((upload_id, part_number)): Path<(String, u32)>,
    Query(q): Query<SignedPartQuery>,
    body: Body,
) -> Result<Response, AppError> {
    state.storage.signer().verify(
        &part_resource(&upload_id, part_number),
        q.expires,
        &q.signature,
    )?;

    let etag = state
        .storage
        .put_part_stream(&upload_id, part_number, body_stream(body))
        .await?;
    Ok(etag_response(&etag))
}

/// `PUT /storage/objects/{*key}`
///
/// Single-shot upload. The content type is part of the signature; a request
/// that sends a different `Content-Type` header is refused.
pub async fn put_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(q): Query<SignedObjectQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    state.storage.signer().verify(
        &object_resource(&key, &q.content_type),
        q.expires,
        &q.signature,
    )?;

    if let Some(sent) = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    {
        if !sent.eq_ignore_ascii_case(&q.content_type) {
            return Err(AppError::new(
                StatusCode::FORBIDDEN,
                "Content-Type does not match the presigned URL",
            ));
        }
    }

    let object = state
        .storage
        .put_object_stream(&key, Some(q.content_type), body_stream(body))
        .await?;
    Ok(etag_response(&object.etag))
}

/// `GET /storage/objects/{*key}`: stream an object back out.
pub async fn get_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, AppError> {
    let (meta, file) = state.storage.open_object(&key).await?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &meta);
    Ok(response)
}

fn set_object_headers(headers: &mut HeaderMap, meta: &StoredObject) {
    let content_type = meta
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".into());
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&meta.size_bytes.max(0).to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0")),
    );

    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", meta.etag)) {
        headers.insert(header::ETAG, value);
    }

    let last_modified = meta
        .last_modified
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string();
    if let Ok(value) = HeaderValue::from_str(&last_modified) {
        headers.insert(header::LAST_MODIFIED, value);
    }

    for (name, value) in &meta.metadata {
        let header_name = format!("x-amz-meta-{}", name.to_ascii_lowercase());
        if let (Ok(name), Ok(value)) = (
            header::HeaderName::from_bytes(header_name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
}
