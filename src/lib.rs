//! Agent Gate: concurrency and resilience core for agent and LLM workloads.

pub mod concurrency;
pub mod config;
pub mod error;
pub mod resilience;

pub use concurrency::ConcurrentProcessor;
pub use error::{Error, Result};
