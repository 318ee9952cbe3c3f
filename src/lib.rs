//! A multi-process, coverage-guided fuzzing loop engine.

pub mod config;
pub mod corpus;
pub mod crash;
pub mod engine;
pub mod error;
pub mod feedback;
pub mod mutator;
pub mod report;
pub mod rng;
pub mod state;
pub mod subprocess;

pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};
