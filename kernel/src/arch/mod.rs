//! Architecture support.
//!
//! On the bare-metal i686 target this is the real hardware layer: flat
//! segmentation, interrupt plumbing, CPU context switching. When the crate
//! is compiled for the host (unit and integration tests), `host` provides
//! the same surface with interrupt state and context switching stubbed out.

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod x86;

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub mod host;

pub mod backtrace;
pub mod stack;

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use x86::{context, halt, idle_wait, irq};

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub use host::{context, halt, idle_wait, irq};
