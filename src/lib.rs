//! Coordinator: trading-cycle coordination service.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod storage;
pub mod registry;
pub mod workflow;
pub mod orchestrator;
pub mod scheduler;
pub mod api;
