//! Chunked upload orchestration for tree-structured video content.
//!
//! Clients build a tree of video segments, then upload each segment straight
//! to object storage in parts through presigned URLs while this service
//! tracks the upload session and attaches the finished object to its node.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
