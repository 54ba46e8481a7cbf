//! Fluent builder for [`EventThread`] construction.
//!
//! Provides a builder pattern interface for creating and configuring event
//! loops, either on the current thread or on a dedicated one.

use crate::runtime::EventThread;
use crate::runtime::driver::{self, SpawnedLoop};

use std::fmt;
use std::io;
use std::time::Duration;

/// Receives failure messages from callbacks that panicked on the loop.
pub(crate) type ExceptionHandler = Box<dyn Fn(&str) + Send>;

pub(crate) struct Config {
    pub(crate) name: Option<String>,
    pub(crate) max_events: usize,
    pub(crate) fd_retry_delay: Duration,
    pub(crate) debug: bool,
    pub(crate) exception_handler: Option<ExceptionHandler>,
    pub(crate) pool: scarlet_executor::Builder,
}

/// Builder for constructing [`EventThread`] instances with a fluent API.
///
/// # Example
/// ```ignore
/// let lp = EventThreadBuilder::new()
///     .name("network")
///     .min_kept_workers(2)
///     .debug(true)
///     .build()?;
/// ```
pub struct EventThreadBuilder {
    name: Option<String>,
    min_kept_workers: usize,
    worker_name_prefix: String,
    max_events: usize,
    fd_retry_delay: Duration,
    debug: bool,
    exception_handler: Option<ExceptionHandler>,
}

impl Default for EventThreadBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EventThreadBuilder {
    /// Creates a builder with the default configuration: four idle executor
    /// workers kept alive, 64 readiness events per poll, a 100 ms retry delay
    /// after recoverable multiplexer failures, debug off.
    pub fn new() -> Self {
        Self {
            name: None,
            min_kept_workers: 4,
            worker_name_prefix: "scarlet-worker".to_string(),
            max_events: 64,
            fd_retry_delay: Duration::from_millis(100),
            debug: false,
            exception_handler: None,
        }
    }

    /// Names the loop. Also used as the OS thread name by [`EventThreadBuilder::spawn`].
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Number of idle executor workers kept alive between jobs.
    pub fn min_kept_workers(mut self, count: usize) -> Self {
        self.min_kept_workers = count;
        self
    }

    /// Prefix of executor thread names, which become `<prefix>-<n>`.
    pub fn worker_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.worker_name_prefix = prefix.into();
        self
    }

    /// Maximum readiness events fetched from the OS per poll.
    pub fn max_events(mut self, count: usize) -> Self {
        self.max_events = count.max(1);
        self
    }

    /// Delay before polling again after the multiplexer ran out of
    /// descriptors or memory.
    pub fn fd_retry_delay(mut self, delay: Duration) -> Self {
        self.fd_retry_delay = delay;
        self
    }

    /// Enables the extra bookkeeping used for diagnostics: futures report a
    /// `Retrieved` state once read, and tasks remember where they were spawned.
    pub fn debug(mut self, enabled: bool) -> Self {
        self.debug = enabled;
        self
    }

    /// Replaces the default exception handler, which logs with `log::error!`.
    ///
    /// The handler is called on the loop thread, between two callbacks. It
    /// must not block.
    pub fn exception_handler(mut self, handler: impl Fn(&str) + Send + 'static) -> Self {
        self.exception_handler = Some(Box::new(handler));
        self
    }

    /// Builds a loop bound to the current thread.
    ///
    /// # Errors
    /// Fails if the OS refuses the multiplexer or the wake-up pipe.
    pub fn build(self) -> io::Result<EventThread> {
        EventThread::from_config(self.into_config())
    }

    /// Builds a loop on a new OS thread and runs it until stopped.
    ///
    /// The loop is closed when `run_forever` returns.
    ///
    /// # Returns
    /// The loop's thread-safe handle and the thread's join handle.
    pub fn spawn(self) -> io::Result<SpawnedLoop> {
        let name = self.name.clone();
        driver::spawn(name, move || self.build())
    }

    fn into_config(self) -> Config {
        let pool = scarlet_executor::Pool::builder()
            .min_kept(self.min_kept_workers)
            .name_prefix(self.worker_name_prefix);

        Config {
            name: self.name,
            max_events: self.max_events,
            fd_retry_delay: self.fd_retry_delay,
            debug: self.debug,
            exception_handler: self.exception_handler,
            pool,
        }
    }
}

impl fmt::Debug for EventThreadBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventThreadBuilder")
            .field("name", &self.name)
            .field("min_kept_workers", &self.min_kept_workers)
            .field("worker_name_prefix", &self.worker_name_prefix)
            .field("max_events", &self.max_events)
            .field("fd_retry_delay", &self.fd_retry_delay)
            .field("debug", &self.debug)
            .field("exception_handler", &self.exception_handler.is_some())
            .finish()
    }
}
