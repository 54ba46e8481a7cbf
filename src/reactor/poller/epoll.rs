use crate::reactor::event::{Event, Interest};
use crate::reactor::poller::timeout_millis;

use libc::{
    EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD, EPOLLERR, EPOLLHUP, EPOLLIN,
    EPOLLOUT, EPOLLRDHUP, epoll_create1, epoll_ctl, epoll_event, epoll_wait,
};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

pub(crate) struct Poller {
    epoll: RawFd,
    events: Vec<epoll_event>,
}

impl Poller {
    pub(crate) fn new(max_events: usize) -> io::Result<Self> {
        let epoll = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if epoll < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            epoll,
            events: Vec::with_capacity(max_events.max(1)),
        })
    }

    pub(crate) fn update(&self, fd: RawFd, old: Interest, new: Interest) -> io::Result<()> {
        let op = match (old.is_empty(), new.is_empty()) {
            (true, true) => return Ok(()),
            (true, false) => EPOLL_CTL_ADD,
            (false, true) => EPOLL_CTL_DEL,
            (false, false) => EPOLL_CTL_MOD,
        };

        let mut flags = 0u32;
        if new.read {
            flags |= (EPOLLIN | EPOLLRDHUP) as u32;
        }
        if new.write {
            flags |= EPOLLOUT as u32;
        }

        let mut event = epoll_event {
            events: flags,
            u64: fd as u64,
        };

        let ret = unsafe { epoll_ctl(self.epoll, op, fd, &mut event) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // The descriptor may already be closed, which removes it from the
            // epoll set on its own.
            if op == EPOLL_CTL_DEL && matches!(err.raw_os_error(), Some(libc::ENOENT | libc::EBADF)) {
                return Ok(());
            }
            return Err(err);
        }

        Ok(())
    }

    pub(crate) fn wait(&mut self, out: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        self.events.clear();

        let n = unsafe {
            epoll_wait(
                self.epoll,
                self.events.as_mut_ptr(),
                self.events.capacity() as i32,
                timeout_millis(timeout),
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        unsafe { self.events.set_len(n as usize) };

        for event in &self.events {
            let bits = event.events;
            let token = event.u64;

            out.push(Event {
                fd: token as RawFd,
                readable: bits & (EPOLLIN | EPOLLRDHUP | EPOLLHUP | EPOLLERR) as u32 != 0,
                writable: bits & (EPOLLOUT | EPOLLHUP | EPOLLERR) as u32 != 0,
                error: bits & EPOLLERR as u32 != 0,
            });
        }

        Ok(())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe { libc::close(self.epoll) };
    }
}
