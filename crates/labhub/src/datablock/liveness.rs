// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 labhub contributors

//! OS-level liveness and clock probes.
//!
//! # PID recycling
//!
//! `is_process_alive` uses `kill(pid, 0)`, which answers "does this PID name
//! a process right now". A recycled PID therefore produces a false positive.
//! That bias is deliberate: treating a recycled PID as alive means recovery
//! refuses to touch a slot that might still have a live owner, which is the
//! safe direction. Operators can override with `force` once they have
//! verified the process themselves.

use std::time::Duration;

/// Check whether `pid` names a live process.
///
/// `EPERM` counts as alive: the process exists, we merely may not signal it.
/// PID 0 and PIDs outside the platform range count as dead.
#[must_use]
pub fn is_process_alive(pid: u64) -> bool {
    if pid == 0 || pid > i32::MAX as u64 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission checks,
    // it never delivers a signal.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Current monotonic clock reading in nanoseconds.
///
/// `CLOCK_MONOTONIC` is system-wide, so ticks written by one process compare
/// meaningfully against ticks read by another on the same host.
#[must_use]
pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid out-pointer; CLOCK_MONOTONIC is supported on
    // every target this crate builds for.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
}

/// Convert a tick delta to a `Duration`, saturating on clock regressions.
#[inline]
#[must_use]
pub fn ns_since(earlier_ns: u64) -> Duration {
    Duration::from_nanos(monotonic_ns().saturating_sub(earlier_ns))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_is_alive() {
        assert!(is_process_alive(u64::from(std::process::id())));
    }

    #[test]
    fn test_pid_zero_is_dead() {
        assert!(!is_process_alive(0));
    }

    #[test]
    fn test_out_of_range_pid_is_dead() {
        assert!(!is_process_alive(u64::MAX));
    }

    #[test]
    fn test_reaped_child_is_dead() {
        let mut child = std::process::Command::new("true")
            .spawn()
            .expect("spawn child");
        let pid = u64::from(child.id());
        child.wait().expect("wait child");
        assert!(!is_process_alive(pid));
    }

    #[test]
    fn test_monotonic_advances() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
    }

    #[test]
    fn test_ns_since_saturates() {
        let future = monotonic_ns() + 1_000_000_000;
        assert_eq!(ns_since(future), Duration::ZERO);
    }
}
