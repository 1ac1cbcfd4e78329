//! A pure-Rust liburing alternative: direct access to the Linux `io_uring`
//! submission/completion rings, with no C dependency.
//!
//! The kernel and the process share two ring buffers mapped from the ring descriptor: the
//! process claims submission slots, fills them, and commits them; a single control call
//! ([`Ring::enter`]) hands the committed entries to the kernel and optionally waits for
//! completions, which are then drained from the completion ring. Thousands of operations can
//! be in flight with one system call per batch rather than one per operation.
//!
//! Slot claiming is lock-free and multi-producer: any number of threads can prepare
//! operations on one [`Ring`] concurrently. Descriptors and buffers used on every operation
//! can be pre-registered ([`Ring::register_file`], [`Ring::register_buffers`]) so the kernel
//! skips per-call lookups and pinning.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use linux_iou::{EnterFlags, Ring};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let ring = Ring::new(8)?;
//!
//! for tag in 0..8 {
//!     let mut slot = ring.claim_slot()?;
//!     slot.prep_nop(tag);
//!     slot.commit();
//! }
//!
//! ring.enter(8, 8, EnterFlags::GETEVENTS)?;
//! for completion in ring.drain()? {
//!     assert!(completion.result >= 0);
//! }
//!
//! ring.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Platform
//!
//! Linux 5.1+ only. Kernels since 5.4 report [`FeatureFlags::SINGLE_MMAP`] and get both ring
//! headers through one mapping; older kernels are handled with two.
//!
//! [`FeatureFlags::SINGLE_MMAP`]: sys/struct.FeatureFlags.html#associatedconstant.SINGLE_MMAP

#[cfg(target_os = "linux")]
pub mod error;
#[cfg(target_os = "linux")]
mod file;
#[cfg(target_os = "linux")]
mod queue;
#[cfg(target_os = "linux")]
mod registry;
#[cfg(target_os = "linux")]
mod ring;
#[cfg(target_os = "linux")]
mod setup;
#[cfg(target_os = "linux")]
pub mod sys;

#[cfg(target_os = "linux")]
pub use crate::error::{
    ClaimError, DrainError, EnterError, RegisterError, SetupError, TeardownError,
};
#[cfg(target_os = "linux")]
pub use crate::file::RingFile;
#[cfg(target_os = "linux")]
pub use crate::registry::PinnedBuffer;
#[cfg(target_os = "linux")]
pub use crate::ring::{Completion, Drain, Ring, SqeSlot};
#[cfg(target_os = "linux")]
pub use crate::setup::RingBuilder;
#[cfg(target_os = "linux")]
pub use crate::sys::{EnterFlags, FeatureFlags, Opcode, SetupFlags, SqeFlags};
