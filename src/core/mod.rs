// Public modules
pub mod config;
pub mod error;
pub mod git;
pub mod logsink;
pub mod pipeline;
pub mod runner;
pub mod service;
pub mod ssh;

// Re-export common types for convenience
pub use error::{Error, ErrorCode, Result};
pub use pipeline::{Capability, Orchestrator, PipelineAction, PipelineState, RunReport};
