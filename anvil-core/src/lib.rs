//! Anvil Core
//!
//! Core types and abstractions for the Anvil training job orchestrator.
//!
//! This crate contains:
//! - Domain types: job records, the canonical status machine, tier policies,
//!   routing decisions and the worker status document
//! - Pure decision logic shared by server and clients: routing and estimation
//! - DTOs: request/response shapes for the orchestrator API

pub mod domain;
pub mod dto;
