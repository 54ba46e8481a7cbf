//! Event-driven I/O readiness.
//!
//! This module wraps the OS multiplexer behind a small registry:
//! - [`core`]: per-descriptor read/write handles mirrored into the poller
//! - [`event`]: interest sets and decoded readiness events
//! - [`poller`]: epoll (Linux) and kqueue (macOS) backends
//! - [`notify`]: the self-pipe that wakes a blocked poll
//! - [`future`]: one-shot readiness futures built on the registry

pub(crate) mod core;
pub mod event;
pub(crate) mod future;
pub(crate) mod notify;
pub(crate) mod poller;

use std::io;

/// Errors worth retrying after a short delay instead of failing: the process
/// or the kernel ran out of descriptors or memory for the poller.
pub(crate) fn is_resource_exhausted(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOMEM | libc::ENOSPC | libc::ENOBUFS)
    )
}
