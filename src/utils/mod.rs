/// Configuration model with validation
pub mod config;
/// Structured error types for all components
pub mod error;
/// Serde helper for durations
pub mod serde_duration;

pub use config::*;
pub use error::*;
