//! Architecture-specific context switching.
//!
//! Each submodule exposes the same surface: a `SavedRegs` block holding
//! the callee-saved state of a parked fiber, `init_context` to prime a
//! fresh stack, and `switch_context` to swap execution between two
//! register blocks. `lib.rs` selects the active module as `current_arch`.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
