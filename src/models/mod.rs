//! Core data models for the video tree service.
//!
//! Trees and upload sessions serialize as camelCase JSON via `serde`; the
//! SQLite row shapes live next to the repositories that read them.

pub mod media_type;
pub mod object;
pub mod tree;
pub mod upload;
