//! Thread coordination: the big lock, thread-state archiving and cooperative preemption.
//!
//! # Key Components
//!
//! - [`ThreadManager`] - owns the big lock, the thread-state lists, id assignment and the
//!   archive/restore lifecycle
//! - [`ThreadState`] / [`ThreadStateSet`] - reusable snapshot buffers and the free/in-use
//!   lists that recycle them
//! - [`ContextSwitcher`](switcher::ContextSwitcher) - the background preemption worker,
//!   driven through [`ExecutionContext::start_preemption`](crate::ExecutionContext::start_preemption)

pub mod manager;
pub mod state;
pub(crate) mod switcher;

pub use manager::ThreadManager;
pub use state::{ThreadHandle, ThreadState, ThreadStateSet, INVALID_THREAD_ID};
