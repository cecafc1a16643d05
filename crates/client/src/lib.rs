//! Network client for the offline worker.
//!
//! This crate provides the reqwest-backed implementation of the worker's
//! `Network` seam, used for precaching, cache misses and revalidation.

pub mod fetch;

pub use fetch::{FetchClient, FetchConfig};
