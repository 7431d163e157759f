//! # weft-core
//!
//! Platform-agnostic types for the weft fiber runtime:
//!
//! - Fiber lifecycle state machine ([`FiberState`])
//! - Fiber identifiers and process-wide counters ([`id`])
//! - Error types ([`SchedError`], [`SchedResult`])
//! - Kernel-style logging macros ([`kprint`])
//! - Environment variable helpers ([`env`])
//!
//! No syscalls, no context switching - those live in `weft-runtime`.

pub mod env;
pub mod error;
pub mod id;
pub mod kprint;
pub mod state;

// Re-exports for ergonomic use
pub use env::{env_get, env_get_bool, env_get_opt};
pub use error::{MemoryError, SchedError, SchedResult};
pub use id::FiberId;
pub use state::FiberState;
