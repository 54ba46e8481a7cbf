//! Self-pipe used to wake the loop out of a blocking poll.
//!
//! The read end is registered in the poller like any other descriptor. Any
//! thread may call [`Notifier::notify`]; repeated notifications before the
//! loop drains the pipe collapse into one byte.

use libc::{F_GETFD, F_GETFL, F_SETFD, F_SETFL, FD_CLOEXEC, O_NONBLOCK, fcntl};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

pub(crate) struct Notifier {
    read: RawFd,
    write: RawFd,
    pending: AtomicBool,
}

impl Notifier {
    pub(crate) fn new() -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }

        let notifier = Self {
            read: fds[0],
            write: fds[1],
            pending: AtomicBool::new(false),
        };

        set_nonblocking_cloexec(notifier.read)?;
        set_nonblocking_cloexec(notifier.write)?;

        Ok(notifier)
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.read
    }

    /// Makes the next (or current) poll return. Safe from any thread.
    pub(crate) fn notify(&self) {
        if self.pending.swap(true, Ordering::AcqRel) {
            return;
        }

        let byte = 1u8;
        // EAGAIN means the pipe is full, which wakes the loop just as well.
        let _ = unsafe { libc::write(self.write, &byte as *const u8 as *const _, 1) };
    }

    /// Empties the pipe. Called by the loop when the read end is ready,
    /// before it drains the remote inbox.
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(self.read, buf.as_mut_ptr() as *mut _, buf.len()) };
            if n <= 0 {
                break;
            }
        }

        // Cleared only once the pipe is empty. A notify landing between the
        // read and this store is covered by the inbox drain that follows.
        self.pending.store(false, Ordering::Release);
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read);
            libc::close(self.write);
        }
    }
}

pub(crate) fn set_nonblocking_cloexec(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = fcntl(fd, F_GETFL);
        if flags < 0 || fcntl(fd, F_SETFL, flags | O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }

        let flags = fcntl(fd, F_GETFD);
        if flags < 0 || fcntl(fd, F_SETFD, flags | FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_notify_collapses_and_drains() {
        let notifier = Notifier::new().unwrap();

        notifier.notify();
        notifier.notify();
        notifier.drain();

        let mut byte = 0u8;
        let n = unsafe { libc::read(notifier.read_fd(), &mut byte as *mut u8 as *mut _, 1) };
        assert!(n < 0, "pipe should be empty after drain");

        notifier.notify();
        let n = unsafe { libc::read(notifier.read_fd(), &mut byte as *mut u8 as *mut _, 1) };
        assert_eq!(n, 1, "notify after drain writes again");
    }

    #[test]
    fn test_concurrent_notify_never_sticks_pending() {
        let notifier = Arc::new(Notifier::new().unwrap());
        let finished = Arc::new(AtomicBool::new(false));

        let producer = {
            let notifier = notifier.clone();
            let finished = finished.clone();
            thread::spawn(move || {
                for _ in 0..100_000 {
                    notifier.notify();
                }
                finished.store(true, Ordering::Release);
            })
        };

        while !finished.load(Ordering::Acquire) {
            notifier.drain();
        }
        producer.join().unwrap();
        notifier.drain();

        notifier.notify();
        let mut byte = 0u8;
        let n = unsafe { libc::read(notifier.read_fd(), &mut byte as *mut u8 as *mut _, 1) };
        assert_eq!(n, 1, "a notify after the last drain must reach the pipe");
    }
}
