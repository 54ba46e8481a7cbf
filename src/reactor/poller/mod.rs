//! OS readiness multiplexers.
//!
//! Every backend exposes the same three operations: `update` the interest
//! set of a descriptor (empty means deregistered), `wait` for readiness with
//! an optional timeout, and close on drop. Backends are level-triggered.

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(target_os = "macos")]
mod kqueue;

#[cfg(target_os = "linux")]
pub(crate) use epoll::Poller;
#[cfg(target_os = "macos")]
pub(crate) use kqueue::Poller;

use std::time::Duration;

/// Converts a poll timeout to milliseconds, rounding up so a timer due in
/// 0.4ms does not make the loop spin with zero timeouts.
pub(crate) fn timeout_millis(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(timeout) => timeout
            .as_nanos()
            .div_ceil(1_000_000)
            .min(i32::MAX as u128) as i32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(None, -1)]
    #[case(Some(Duration::ZERO), 0)]
    #[case(Some(Duration::from_micros(400)), 1)]
    #[case(Some(Duration::from_millis(25)), 25)]
    #[case(Some(Duration::from_secs(u64::MAX)), i32::MAX)]
    fn test_timeout_millis(#[case] timeout: Option<Duration>, #[case] expected: i32) {
        assert_eq!(timeout_millis(timeout), expected);
    }
}
