//! Per-descriptor readiness registry on top of the OS poller.
//!
//! Each descriptor has at most one read handle and one write handle. The
//! poller's interest set always mirrors which of the two are present.

use crate::reactor::event::{Direction, Event, Interest};
use crate::reactor::notify::Notifier;
use crate::reactor::poller::{Poller, timeout_millis};
use crate::runtime::handle::Handle;
use crate::runtime::queue::ReadyQueue;

use log::{trace, warn};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Registration {
    read: Option<Handle>,
    write: Option<Handle>,
}

impl Registration {
    fn interest(&self) -> Interest {
        Interest {
            read: self.read.is_some(),
            write: self.write.is_some(),
        }
    }

    fn slot(&mut self, direction: Direction) -> &mut Option<Handle> {
        match direction {
            Direction::Read => &mut self.read,
            Direction::Write => &mut self.write,
        }
    }
}

pub(crate) struct Reactor {
    poller: Poller,
    registry: HashMap<RawFd, Registration>,
    events: Vec<Event>,
    notifier: Arc<Notifier>,
}

impl Reactor {
    pub(crate) fn new(max_events: usize, notifier: Arc<Notifier>) -> io::Result<Self> {
        let poller = Poller::new(max_events)?;
        poller.update(notifier.read_fd(), Interest::NONE, Interest::READ)?;

        Ok(Self {
            poller,
            registry: HashMap::new(),
            events: Vec::with_capacity(max_events),
            notifier,
        })
    }

    /// Installs `handle` for one direction of `fd`.
    ///
    /// The other direction is left untouched. A previous handle for the same
    /// direction is returned once the poller accepted the change, and the
    /// caller is expected to cancel it. On error the registry is unchanged.
    pub(crate) fn register(
        &mut self,
        fd: RawFd,
        direction: Direction,
        handle: Handle,
    ) -> io::Result<Option<Handle>> {
        if fd == self.notifier.read_fd() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "descriptor is reserved by the event loop",
            ));
        }

        let registration = self.registry.entry(fd).or_default();
        let old = registration.interest();
        let previous = registration.slot(direction).replace(handle);
        let new = registration.interest();

        if let Err(err) = self.poller.update(fd, old, new) {
            if let Some(registration) = self.registry.get_mut(&fd) {
                *registration.slot(direction) = previous;
                if registration.interest().is_empty() {
                    self.registry.remove(&fd);
                }
            }
            return Err(err);
        }

        trace!("fd {} registered for {:?}", fd, direction);
        Ok(previous)
    }

    /// Removes one direction of `fd` and returns its handle, which the
    /// caller should cancel. The descriptor leaves the poller entirely once
    /// neither direction is registered.
    pub(crate) fn deregister(&mut self, fd: RawFd, direction: Direction) -> Option<Handle> {
        self.deregister_matching(fd, direction, |_| true)
    }

    /// Like [`Reactor::deregister`], but only removes `handle` itself, not a
    /// handle registered after it.
    pub(crate) fn deregister_handle(&mut self, fd: RawFd, direction: Direction, handle: &Handle) -> Option<Handle> {
        self.deregister_matching(fd, direction, |registered| registered.ptr_eq(handle))
    }

    fn deregister_matching(
        &mut self,
        fd: RawFd,
        direction: Direction,
        matches: impl FnOnce(&Handle) -> bool,
    ) -> Option<Handle> {
        let registration = self.registry.get_mut(&fd)?;

        let old = registration.interest();
        let slot = registration.slot(direction);
        if !slot.as_ref().is_some_and(matches) {
            return None;
        }
        let removed = slot.take();
        let new = registration.interest();

        if new.is_empty() {
            self.registry.remove(&fd);
        }

        if let Err(err) = self.poller.update(fd, old, new) {
            warn!("failed to update poller for fd {}: {}", fd, err);
        }

        trace!("fd {} deregistered for {:?}", fd, direction);
        removed
    }

    pub(crate) fn is_registered(&self, fd: RawFd, direction: Direction) -> bool {
        self.registry.get(&fd).is_some_and(|registration| match direction {
            Direction::Read => registration.read.is_some(),
            Direction::Write => registration.write.is_some(),
        })
    }

    pub(crate) fn registered_count(&self) -> usize {
        self.registry.len()
    }

    /// Waits for readiness and queues the handles of every ready descriptor.
    ///
    /// Cancelled handles found along the way are deregistered instead of
    /// queued. Returns the number of handles queued.
    pub(crate) fn poll(&mut self, timeout: Option<Duration>, ready: &mut ReadyQueue) -> io::Result<usize> {
        self.events.clear();
        self.poller.wait(&mut self.events, timeout)?;

        let mut queued = 0;
        let mut stale = Vec::new();

        for event in &self.events {
            if event.fd == self.notifier.read_fd() {
                self.notifier.drain();
                continue;
            }

            let registration = match self.registry.get(&event.fd) {
                Some(registration) => registration,
                None => continue,
            };

            if event.error {
                trace!("fd {} reported an error condition", event.fd);
            }

            for (direction, fired, slot) in [
                (Direction::Read, event.readable, &registration.read),
                (Direction::Write, event.writable, &registration.write),
            ] {
                if !fired {
                    continue;
                }

                match slot {
                    Some(handle) if handle.cancelled() => stale.push((event.fd, direction)),
                    Some(handle) => {
                        ready.push(handle.clone());
                        queued += 1;
                    }
                    None => {}
                }
            }
        }

        for (fd, direction) in stale {
            warn!("dropping stale {:?} registration for fd {}", direction, fd);
            self.deregister(fd, direction);
        }

        Ok(queued)
    }

    /// Blocks until the wake pipe is notified or `timeout` elapses, without
    /// touching the poller. Used while polling is backing off.
    pub(crate) fn wait_notified(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        let mut pollfd = libc::pollfd {
            fd: self.notifier.read_fd(),
            events: libc::POLLIN,
            revents: 0,
        };

        let n = unsafe { libc::poll(&mut pollfd, 1, timeout_millis(timeout)) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        if pollfd.revents & libc::POLLIN != 0 {
            self.notifier.drain();
        }
        Ok(())
    }

    /// Removes every registration and returns the handles to cancel.
    pub(crate) fn clear(&mut self) -> Vec<Handle> {
        let fds: Vec<RawFd> = self.registry.keys().copied().collect();
        let mut removed = Vec::new();
        for fd in fds {
            removed.extend(self.deregister(fd, Direction::Read));
            removed.extend(self.deregister(fd, Direction::Write));
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::notify::set_nonblocking_cloexec;
    use std::cell::Cell;
    use std::rc::Rc;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        set_nonblocking_cloexec(fds[0]).unwrap();
        set_nonblocking_cloexec(fds[1]).unwrap();
        (fds[0], fds[1])
    }

    fn close(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    fn reactor() -> Reactor {
        Reactor::new(16, Arc::new(Notifier::new().unwrap())).unwrap()
    }

    fn counting(counter: &Rc<Cell<u32>>) -> Handle {
        let counter = counter.clone();
        Handle::once(move || counter.set(counter.get() + 1))
    }

    #[test]
    fn test_registering_same_direction_returns_previous() {
        let mut reactor = reactor();
        let (read, write) = pipe();
        let count = Rc::new(Cell::new(0));

        let first = counting(&count);
        assert!(reactor.register(read, Direction::Read, first.clone()).unwrap().is_none());
        let replaced = reactor.register(read, Direction::Read, counting(&count)).unwrap();

        assert!(replaced.is_some_and(|h| h.ptr_eq(&first)));
        assert_eq!(reactor.registered_count(), 1);
        assert!(reactor.deregister_handle(read, Direction::Read, &first).is_none());

        close(read);
        close(write);
    }

    #[test]
    fn test_other_direction_survives_deregistration() {
        let mut reactor = reactor();
        let (read, write) = pipe();
        let count = Rc::new(Cell::new(0));

        reactor.register(write, Direction::Write, counting(&count)).unwrap();
        reactor.register(write, Direction::Read, counting(&count)).unwrap();

        assert!(reactor.deregister(write, Direction::Read).is_some());
        assert!(reactor.deregister(write, Direction::Read).is_none());
        assert!(reactor.is_registered(write, Direction::Write));
        assert_eq!(reactor.registered_count(), 1);

        assert!(reactor.deregister(write, Direction::Write).is_some());
        assert_eq!(reactor.registered_count(), 0);

        close(read);
        close(write);
    }

    #[test]
    fn test_poll_queues_ready_handles() {
        let mut reactor = reactor();
        let (read, write) = pipe();
        let count = Rc::new(Cell::new(0));
        let mut ready = ReadyQueue::new();

        reactor.register(read, Direction::Read, counting(&count)).unwrap();
        assert_eq!(reactor.poll(Some(Duration::ZERO), &mut ready).unwrap(), 0);

        let byte = 7u8;
        assert_eq!(unsafe { libc::write(write, &byte as *const u8 as *const _, 1) }, 1);
        assert_eq!(reactor.poll(Some(Duration::from_secs(1)), &mut ready).unwrap(), 1);

        ready.pop().unwrap().run();
        assert_eq!(count.get(), 1);

        close(read);
        close(write);
    }

    #[test]
    fn test_poll_drops_cancelled_handles() {
        let mut reactor = reactor();
        let (read, write) = pipe();
        let count = Rc::new(Cell::new(0));
        let mut ready = ReadyQueue::new();

        let handle = counting(&count);
        reactor.register(write, Direction::Write, handle.clone()).unwrap();
        handle.cancel();

        assert_eq!(reactor.poll(Some(Duration::from_secs(1)), &mut ready).unwrap(), 0);
        assert!(ready.is_empty());
        assert!(!reactor.is_registered(write, Direction::Write));

        close(read);
        close(write);
    }

    #[test]
    fn test_wake_fd_is_reserved() {
        let notifier = Arc::new(Notifier::new().unwrap());
        let mut reactor = Reactor::new(4, notifier.clone()).unwrap();

        let err = reactor
            .register(notifier.read_fd(), Direction::Read, Handle::once(|| {}))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        notifier.notify();
        let mut ready = ReadyQueue::new();
        assert_eq!(reactor.poll(Some(Duration::from_secs(1)), &mut ready).unwrap(), 0);
    }
}
