pub mod config;
pub mod error;
pub mod event_log;
pub mod log;

// Orchestration and consensus
pub mod consensus;
pub mod core;
pub mod engine;
pub mod orchestration;

pub use config::EngineConfig;
pub use engine::{Engine, RunReport};
pub use error::{Error, Result};
