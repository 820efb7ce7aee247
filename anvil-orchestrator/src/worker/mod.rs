//! Worker program generation
//!
//! Everything that ends up running on the ephemeral instance: the training
//! program itself and the bootstrap that wraps it.

pub mod bootstrap;
pub mod synthesizer;

pub use bootstrap::{BootstrapContext, BootstrapProgram};
pub use synthesizer::SynthesisError;
