// Public modules
pub mod backup;
pub mod config;
pub mod deploy;
pub mod environment;
pub mod error;
pub mod git;
pub mod interrupt;
pub mod paths;
pub mod testing;

// Re-export common types for convenience
pub use error::{Error, ErrorCode, Result};
