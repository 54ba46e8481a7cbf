//! Time utilities: sleeping and racing futures against deadlines.
//!
//! - [`sleep`] for non-blocking delays
//! - [`future_or_timeout`] for arming a deadline on an existing future
//! - [`wait_for`] for running any computation with a deadline
//!
//! # Example: Sleep
//!
//! ```ignore
//! use scarlet::time::sleep;
//! use std::time::Duration;
//!
//! let nap = sleep(&lp, Duration::from_millis(10));
//! lp.spawn(async move {
//!     nap.await?;
//!     Ok(())
//! });
//! ```
//!
//! # Example: Timeout
//!
//! ```ignore
//! use scarlet::time::{sleep, wait_for};
//! use scarlet::Error;
//! use std::time::Duration;
//!
//! let slow = sleep(&lp, Duration::from_secs(1));
//! let result = lp.run_until_complete(wait_for(&lp, slow, Duration::from_millis(10)));
//! assert!(matches!(result, Err(Error::Timeout)));
//! ```

pub mod sleep;
pub mod timeout;

pub use sleep::sleep;
pub use timeout::{future_or_timeout, wait_for};
