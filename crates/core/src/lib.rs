//! Core of the taxi calculator's offline worker.
//!
//! This crate provides:
//! - Named cache stores with a SQLite backend
//! - The route table and caching strategies (cache-first,
//!   stale-while-revalidate, cache-first with expiration)
//! - The worker lifecycle (install, activate, fetch, message)
//! - Unified error types
//! - Configuration structures

pub mod cache;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod network;
pub mod request;
pub mod routing;
pub mod strategy;
pub mod url;
pub mod worker;

pub use cache::{CacheDb, CacheEntry};
pub use config::{ConfigError, OfflineConfig};
pub use error::Error;
pub use lifecycle::{Phase, WorkerState};
pub use network::Network;
pub use request::{Destination, Request, Response};
pub use routing::{Decision, PassReason, RouteTable, Strategy};
pub use strategy::{Served, Source};
pub use worker::{ActivateReport, ControlMessage, FetchOutcome, InstallReport, MessageOutcome, OfflineWorker};
