//! Loop internals and the thread-safe side of a loop.

pub(crate) mod context;
pub(crate) mod core;
pub(crate) mod driver;
pub mod handle;
pub(crate) mod pause;
pub(crate) mod queue;
pub(crate) mod shared;
pub(crate) mod waker;
pub mod yield_now;

pub use self::core::EventThread;
pub(crate) use self::core::WeakLoop;
pub use driver::{LoopHandle, SpawnedLoop};
pub use handle::{Handle, TimerHandle};
pub use pause::PauseGuard;
pub(crate) use waker::make_waker;
pub use yield_now::yield_now;
