//! Scheduler layer for the orchestrator
//!
//! Drives the reconciler for every active job: one lightweight task per job
//! polls its status document on a fixed cadence, with a global cap on the
//! number of reads in flight. Tasks are resumed from the job store after a
//! restart, so nothing depends on the process that submitted the job.

pub mod poller;

pub use poller::{PollScheduler, PollSettings};
