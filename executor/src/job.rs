/// A unit of blocking work handed to a [`WorkerThread`](crate::WorkerThread).
///
/// A job is consumed exactly once: either [`Job::run`] on the worker thread, or
/// [`Job::cancel`] when the worker is shut down before reaching it or when the
/// job reports itself abandoned.
pub trait Job: Send + 'static {
    /// Whether the party waiting for this job has given up on it.
    ///
    /// Checked by the worker right before running. An abandoned job is
    /// cancelled instead of run.
    fn is_abandoned(&self) -> bool {
        false
    }

    /// Runs the job on the worker thread.
    fn run(self: Box<Self>);

    /// Consumes the job without running it.
    fn cancel(self: Box<Self>);
}

/// Adapter turning a plain closure into a [`Job`]. Cancelling drops the closure.
pub struct FnJob<F>(F);

impl<F> FnJob<F>
where
    F: FnOnce() + Send + 'static,
{
    pub fn new(function: F) -> Box<Self> {
        Box::new(Self(function))
    }
}

impl<F> Job for FnJob<F>
where
    F: FnOnce() + Send + 'static,
{
    fn run(self: Box<Self>) {
        (self.0)()
    }

    fn cancel(self: Box<Self>) {}
}
