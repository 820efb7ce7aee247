//! Data Transfer Objects for the orchestrator API
//!
//! Request and response payloads exchanged between the orchestrator and
//! its callers (presentation layer, CLI).

pub mod job;
