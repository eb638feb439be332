//! Synchronization Primitives
//!
//! The drivers depend on a small concurrency substrate instead of a specific
//! kernel:
//!
//! - [`EventFlags`]: a lock-free OR-accumulated event bitmask, posted from
//!   interrupt context and drained by a worker thread.
//! - [`WorkScheduler`]: submission of immediate and delayed work items. The
//!   embedding kernel runs the submitted work by calling back into the
//!   driver.

pub mod event;
pub mod work;

pub use event::EventFlags;
pub use work::WorkScheduler;
