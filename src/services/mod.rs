pub mod gateway;
pub mod local_gateway;
pub mod session_store;
pub mod signing;
pub mod thumbnail_service;
pub mod tree_repository;
pub mod tree_service;
pub mod upload_service;
