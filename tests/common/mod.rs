#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, Response, header::CONTENT_TYPE},
};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

use video_tree::{
    db::memory_pool,
    routes::routes::app,
    services::{local_gateway::LocalObjectGateway, signing::UrlSigner},
    state::AppState,
};

pub const PUBLIC_URL: &str = "http://media.test";

/// Application under test plus the directory backing its object store.
pub struct TestApp {
    pub router: Router,
    /// Same services the router uses, for driving them directly.
    pub state: AppState,
    pub owner: Uuid,
    _dir: TempDir,
}

/// Build the full application router over an in-memory database and a
/// temporary object store, mirroring the construction in `main.rs`.
pub async fn build_test_app() -> TestApp {
    let dir = TempDir::new().expect("temp dir");
    let pool = memory_pool().await.expect("in-memory database");
    let signer = UrlSigner::new("integration-secret", Duration::from_secs(300));
    let storage = LocalObjectGateway::new(dir.path(), PUBLIC_URL, signer);
    let state = AppState::new(Arc::new(pool), storage, Duration::from_secs(3600));

    TestApp {
        router: app(state.clone()),
        state,
        owner: Uuid::new_v4(),
        _dir: dir,
    }
}

impl TestApp {
    /// Send a request as this app's owner.
    pub async fn send(&self, method: Method, uri: &str, body: Option<Value>) -> Response<Body> {
        self.send_as(Some(self.owner), method, uri, body).await
    }

    pub async fn send_as(
        &self,
        owner: Option<Uuid>,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> Response<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(owner) = owner {
            builder = builder.header("x-owner-id", owner.to_string());
        }
        let request = match body {
            Some(json) => builder
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        self.router.clone().oneshot(request).await.unwrap()
    }

    /// PUT raw bytes to a presigned URL returned by the API.
    pub async fn put_presigned(
        &self,
        url: &str,
        content_type: Option<&str>,
        bytes: &'static [u8],
    ) -> Response<Body> {
        let path = url
            .strip_prefix(PUBLIC_URL)
            .expect("presigned URL points at this service");
        let mut builder = Request::builder().method(Method::PUT).uri(path);
        if let Some(content_type) = content_type {
            builder = builder.header(CONTENT_TYPE, content_type);
        }
        let request = builder.body(Body::from(bytes)).unwrap();
        self.router.clone().oneshot(request).await.unwrap()
    }

    /// Create a tree and return `(tree_id, root_id)`.
    pub async fn create_tree(&self, title: &str) -> (String, String) {
        let response = self
            .send(Method::POST, "/trees", Some(serde_json::json!({ "title": title })))
            .await;
        let json = body_json(response).await;
        (
            json["id"].as_str().unwrap().to_string(),
            json["rootId"].as_str().unwrap().to_string(),
        )
    }
}

/// Read the full response body as JSON.
pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

/// The `ETag` header without its quotes.
pub fn etag(response: &Response<Body>) -> String {
    response
        .headers()
        .get("etag")
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .trim_matches('"')
        .to_string()
}
