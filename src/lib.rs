// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(dead_code)]

//! # lockstep
//!
//! Thread coordination for embeddable, single-threaded-at-a-time interpreter
//! runtimes. `lockstep` lets many OS threads share one logical interpreter
//! instance safely: execution is serialized behind one coarse "big lock", and
//! a thread can step out of the runtime and back in without losing its
//! in-flight interpreter state.
//!
//! ## Features
//!
//! - **RAII guard API** - [`Locker`] and [`Unlocker`] encode top-level and
//!   nested entry into the runtime; release behavior is decided at
//!   acquisition time and runs on every exit path
//! - **Thread state archiving** - per-subsystem state is serialized into
//!   reusable fixed-size buffers through the [`Archivable`] contract, with a
//!   lazy-archive optimization that elides serialization entirely when the
//!   same thread immediately resumes
//! - **Cooperative preemption** - an optional background worker periodically
//!   requests that the running thread yield, without ever touching the lock
//! - **GC root scanning** - archived (parked) threads remain visible to a
//!   collector through [`ThreadManager::iterate`](threads::ThreadManager::iterate)
//!
//! ## Quick Start
//!
//! ```rust
//! use lockstep::{ExecutionContext, Locker};
//!
//! let ctx = ExecutionContext::new();
//!
//! // Enter the runtime. While `locker` is alive this thread is the only
//! // one executing interpreter code for `ctx`.
//! let locker = Locker::new(&ctx);
//! assert!(Locker::is_locked(&ctx));
//! drop(locker);
//! ```
//!
//! Stepping out so other threads can run:
//!
//! ```rust
//! use lockstep::{ExecutionContext, Locker, Unlocker};
//!
//! let ctx = ExecutionContext::new();
//! let _locker = Locker::new(&ctx);
//! {
//!     // Archives this thread's state and releases the lock; other
//!     // threads may enter the runtime until `unlocker` is dropped.
//!     let _unlocker = Unlocker::new(&ctx);
//! }
//! // Lock re-acquired, state restored.
//! assert!(Locker::is_locked(&ctx));
//! ```
//!
//! ## Architecture
//!
//! `lockstep` is organized into several key modules:
//!
//! - [`archive`] - the [`Archivable`] subsystem contract, the ordered
//!   subsystem registry, and the bounds-checked buffer cursors
//! - [`subsystems`] - the built-in archivable participants (stack guard,
//!   handle scopes, regexp backtracking stack)
//! - [`threads`] - the thread manager, reusable thread-state buffers and
//!   the preemption worker
//! - [`context`] - the [`ExecutionContext`] container and its process-wide
//!   or per-thread binding
//! - [`guard`] - the public [`Locker`] / [`Unlocker`] API
//!
//! ## Failure Model
//!
//! Operations called out of order - archiving twice, restoring without the
//! lock, lazily archiving a second thread while one is pending - are embedder
//! bugs, surfaced as panics with a diagnostic naming the violated invariant.
//! Recoverable [`Error`] values exist only at the serialization layer, where
//! a subsystem that disagrees with its own declared byte footprint is
//! reported instead of silently overrunning the buffer.

#[macro_use]
mod macros;

mod error;

pub mod archive;
pub mod context;
pub mod guard;
pub mod subsystems;
pub mod threads;

pub use error::Error;

/// Convenience alias for operations that can fail with a [`crate::Error`].
pub type Result<T> = std::result::Result<T, Error>;

pub use archive::{
    Archivable, ArchiveReader, ArchiveWriter, RootRef, RootVisitor, SubsystemRegistry,
};
pub use context::{ContextBuilder, ContextMode, ContextScope, ExecutionContext};
pub use guard::{Locker, Unlocker};
pub use subsystems::{Interrupts, StackGuard};
pub use threads::{ThreadManager, ThreadState};
