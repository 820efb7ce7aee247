//! Anvil Orchestrator
//!
//! Accepts training job requests, routes them to a compute profile, generates
//! the worker's training and bootstrap programs, provisions an ephemeral
//! cloud instance, and reconciles the worker's status document back into the
//! canonical job record.

pub mod api;
pub mod config;
pub mod credentials;
pub mod db;
pub mod events;
pub mod provider;
pub mod repository;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod worker;
