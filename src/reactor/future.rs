//! One-shot readiness futures for non-blocking file descriptors.
//!
//! [`EventThread::readable`] and [`EventThread::writable`] register a
//! readiness callback that finishes a [`Future`] and removes itself. The
//! caller then performs the actual `read`/`write` and re-arms on
//! `EAGAIN`:
//!
//! ```ignore
//! lp.spawn(async move {
//!     loop {
//!         match nix_read(fd, &mut buf) {
//!             Err(err) if err.kind() == io::ErrorKind::WouldBlock => lp.readable(fd).await?,
//!             other => return other.map_err(Error::from),
//!         }
//!     }
//! });
//! ```

use crate::error::Error;
use crate::future::Future;
use crate::reactor::event::Direction;
use crate::runtime::core::EventThread;
use crate::runtime::handle::Handle;

use log::debug;
use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::Rc;

fn readiness(lp: &EventThread, fd: RawFd, direction: Direction) -> Future<()> {
    let future = lp.create_future();
    let registered: Rc<RefCell<Option<Handle>>> = Rc::new(RefCell::new(None));

    let target = future.downgrade();
    let own = registered.clone();
    let weak_loop = lp.downgrade();
    let callback = move || {
        let handle = own.borrow_mut().take();
        if let (Some(lp), Some(handle)) = (weak_loop.upgrade(), handle) {
            lp.deregister_handle(fd, direction, &handle);
        }
        if let Some(future) = target.upgrade() {
            future.set_result_if_pending(());
        }
    };

    match lp.register_interest(fd, direction, callback) {
        Ok(handle) => {
            *registered.borrow_mut() = Some(handle);

            let weak_loop = lp.downgrade();
            future.add_done_callback(move |done| {
                if !done.cancelled() {
                    return;
                }
                let handle = registered.borrow_mut().take();
                if let (Some(lp), Some(handle)) = (weak_loop.upgrade(), handle) {
                    lp.deregister_handle(fd, direction, &handle);
                }
            });
        }
        Err(err) => {
            debug!("fd {} {:?} registration failed: {}", fd, direction, err);
            future.set_error_if_pending(Error::from(err));
        }
    }

    future
}

impl EventThread {
    /// Returns a future that finishes the next time `fd` is readable.
    ///
    /// Replaces any read callback registered for `fd`. Cancelling the future
    /// removes its registration. A registration failure (a closed or
    /// unsupported descriptor) fails the future with `Error::Io`.
    pub fn readable(&self, fd: RawFd) -> Future<()> {
        readiness(self, fd, Direction::Read)
    }

    /// Returns a future that finishes the next time `fd` is writable.
    pub fn writable(&self, fd: RawFd) -> Future<()> {
        readiness(self, fd, Direction::Write)
    }
}
