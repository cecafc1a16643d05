//! SQLite-backed cache storage for the offline worker.
//!
//! This module provides the persistent equivalent of the browser's
//! `CacheStorage`: any number of named stores holding request/response pairs,
//! with async access via tokio-rusqlite. It supports:
//!
//! - Request keys hashed from method and canonical URL
//! - Automatic schema migrations
//! - WAL mode for concurrent access
//! - Store deletion with cascading entry removal
//! - Per-bucket eviction by age and entry count

pub mod connection;
pub mod hash;
pub mod migrations;
pub mod stores;

pub use crate::Error;

pub use connection::CacheDb;
pub use stores::{CacheEntry, now_ms};
