//! weft-runtime: stackful fibers, an M:N scheduler, and an epoll
//! reactor with timers.
//!
//! The layers, bottom up:
//!
//! - [`arch`] / [`memory`]: raw context switching and guarded stacks
//! - [`fiber`]: the [`Fiber`] type and its resume/yield protocol
//! - [`scheduler`]: worker threads dispatching fibers and callbacks
//! - [`timer`]: an ordered deadline set the reactor waits against
//! - [`reactor`]: [`IoManager`], a scheduler that idles in epoll_wait
//!
//! Most users want the `weft` facade crate instead of this one.

pub mod arch;
pub mod config;
pub mod fiber;
pub mod memory;
pub mod parking;
pub mod reactor;
pub mod scheduler;
pub mod timer;
pub mod tls;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub use arch::x86_64 as current_arch;
    } else if #[cfg(target_arch = "aarch64")] {
        pub use arch::aarch64 as current_arch;
    } else {
        compile_error!("weft-runtime supports x86_64 and aarch64 only");
    }
}

pub use fiber::Fiber;
pub use reactor::{IoManager, IoEvent};
pub use scheduler::{Idler, Scheduler};
pub use timer::{Timer, TimerManager};

pub use weft_core::error::{SchedError, SchedResult};
pub use weft_core::id::FiberId;
pub use weft_core::state::FiberState;
