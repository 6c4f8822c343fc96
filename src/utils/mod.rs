//! Generic utility primitives with zero domain knowledge.
//!
//! - `command` - Subprocess execution with timeouts and interrupt polling
//! - `http` - Blocking HTTP client construction and probes
//! - `io` - File I/O with consistent error handling
//! - `shell` - Quoting for human-readable command lines

pub mod command;
pub mod http;
pub mod io;
pub mod shell;
