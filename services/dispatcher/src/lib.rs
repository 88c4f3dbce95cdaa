//! Dispatcher service library crate.
//!
//! # Purpose
//! Exposes the service configuration and the local workload that drives a
//! subscription dispatcher over an in-memory log, for the binary and its tests.
pub mod config;
pub mod workload;
