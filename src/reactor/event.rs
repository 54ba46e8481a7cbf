use std::os::unix::io::RawFd;

/// Which readiness a callback is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

/// The set of readiness kinds a descriptor is registered for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Interest {
    pub(crate) read: bool,
    pub(crate) write: bool,
}

impl Interest {
    pub(crate) const NONE: Self = Self {
        read: false,
        write: false,
    };

    pub(crate) const READ: Self = Self {
        read: true,
        write: false,
    };

    pub(crate) fn is_empty(&self) -> bool {
        !self.read && !self.write
    }
}

/// One readiness notification decoded from the OS multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Event {
    pub(crate) fd: RawFd,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
    pub(crate) error: bool,
}
