use crate::reactor::event::{Event, Interest};

use libc::{EV_ADD, EV_DELETE, EV_ENABLE, EV_EOF, EV_ERROR, EVFILT_READ, EVFILT_WRITE, kevent, kqueue};
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

pub(crate) struct Poller {
    kqueue: RawFd,
    events: Vec<kevent>,
}

fn change(fd: RawFd, filter: i16, flags: u16) -> kevent {
    kevent {
        ident: fd as usize,
        filter,
        flags,
        fflags: 0,
        data: 0,
        udata: ptr::null_mut(),
    }
}

impl Poller {
    pub(crate) fn new(max_events: usize) -> io::Result<Self> {
        let kqueue = unsafe { kqueue() };
        if kqueue < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            kqueue,
            events: Vec::with_capacity(max_events.max(1)),
        })
    }

    pub(crate) fn update(&self, fd: RawFd, old: Interest, new: Interest) -> io::Result<()> {
        let mut changes = Vec::with_capacity(2);

        if old.read != new.read {
            let flags = if new.read { EV_ADD | EV_ENABLE } else { EV_DELETE };
            changes.push(change(fd, EVFILT_READ, flags));
        }

        if old.write != new.write {
            let flags = if new.write { EV_ADD | EV_ENABLE } else { EV_DELETE };
            changes.push(change(fd, EVFILT_WRITE, flags));
        }

        if changes.is_empty() {
            return Ok(());
        }

        let ret = unsafe {
            kevent(
                self.kqueue,
                changes.as_ptr(),
                changes.len() as i32,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };

        if ret < 0 {
            let err = io::Error::last_os_error();
            if new.is_empty() && matches!(err.raw_os_error(), Some(libc::ENOENT | libc::EBADF)) {
                return Ok(());
            }
            return Err(err);
        }

        Ok(())
    }

    pub(crate) fn wait(&mut self, out: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        self.events.clear();

        let ts = timeout.map(|timeout| libc::timespec {
            tv_sec: timeout.as_secs().min(i64::MAX as u64) as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts
            .as_ref()
            .map_or(ptr::null(), |ts| ts as *const libc::timespec);

        let n = unsafe {
            kevent(
                self.kqueue,
                ptr::null(),
                0,
                self.events.as_mut_ptr(),
                self.events.capacity() as i32,
                ts_ptr,
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
            let error = event.flags & EV_ERROR != 0;
            let eof = event.flags & EV_EOF != 0;

            out.push(Event {
                fd: event.ident as RawFd,
                readable: event.filter == EVFILT_READ || (error || eof),
                writable: event.filter == EVFILT_WRITE || error,
                error,
            });
        }

        Ok(())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe { libc::close(self.kqueue) };
    }
}
