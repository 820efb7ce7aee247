//! Core domain types
//!
//! This module contains the domain structures used across Anvil crates.
//! The orchestrator persists and mutates them; the client and CLI only read
//! them off the wire.

pub mod estimate;
pub mod job;
pub mod routing;
pub mod script;
pub mod status;
pub mod tier;
