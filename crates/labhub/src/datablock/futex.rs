// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 labhub contributors

//! Inter-process futex wait/wake on words inside the mapped region.
//!
//! Uses the SHARED futex opcodes (`FUTEX_WAIT` = 0, `FUTEX_WAKE` = 1), never
//! the `_PRIVATE` variants: private futexes match waiters by virtual address
//! and silently fail to wake other processes mapping the same region.
//!
//! Waiters follow the snapshot discipline: read the counter, re-check the
//! condition, then wait for the counter to move past the snapshot. Spurious
//! wakeups are allowed everywhere, so callers always re-check their
//! condition after [`wait`] returns.

use std::sync::atomic::AtomicU32;
use std::time::Duration;

/// Outcome of a futex wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    /// Woken, timed out, or interrupted; the caller re-checks its condition
    Woken,
    /// The word no longer held the expected value; the condition may have
    /// changed already
    Stale,
}

#[cfg(target_os = "linux")]
mod sys {
    use super::{Duration, WaitOutcome};
    use std::ptr;
    use std::sync::atomic::AtomicU32;

    const FUTEX_WAIT: i32 = 0; // shared, not FUTEX_WAIT_PRIVATE (128)
    const FUTEX_WAKE: i32 = 1; // shared, not FUTEX_WAKE_PRIVATE (129)

    pub(crate) fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> WaitOutcome {
        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: libc::c_long::from(d.subsec_nanos()),
        });
        let ts_ptr = ts
            .as_ref()
            .map_or(ptr::null(), |t| t as *const libc::timespec);

        // SAFETY: `word` is a live AtomicU32 for the duration of the call;
        // the kernel matches shared-futex waiters by the underlying physical
        // page, which is exactly what a mapped region provides.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word as *const AtomicU32 as *const u32,
                FUTEX_WAIT,
                expected,
                ts_ptr,
                ptr::null::<u32>(),
                0i32,
            )
        };

        if rc == -1 && std::io::Error::last_os_error().raw_os_error() == Some(libc::EAGAIN) {
            WaitOutcome::Stale
        } else {
            WaitOutcome::Woken
        }
    }

    pub(crate) fn wake_all(word: &AtomicU32) {
        // SAFETY: same addressing argument as `wait`; waking is always safe
        // and wakes at most the processes blocked on this word.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                word as *const AtomicU32 as *const u32,
                FUTEX_WAKE,
                i32::MAX,
                ptr::null::<libc::timespec>(),
                ptr::null::<u32>(),
                0i32,
            );
        }
    }
}

// Portable fallback: bounded sleep instead of a kernel wait. Correctness is
// preserved because every waiter re-checks its condition in a loop; only
// wakeup latency degrades.
#[cfg(not(target_os = "linux"))]
mod sys {
    use super::{Duration, WaitOutcome};
    use std::sync::atomic::{AtomicU32, Ordering};

    const POLL_SLICE: Duration = Duration::from_millis(1);

    pub(crate) fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> WaitOutcome {
        if word.load(Ordering::Acquire) != expected {
            return WaitOutcome::Stale;
        }
        let slice = timeout.map_or(POLL_SLICE, |t| t.min(POLL_SLICE));
        std::thread::sleep(slice);
        WaitOutcome::Woken
    }

    pub(crate) fn wake_all(_word: &AtomicU32) {}
}

/// Block until `word` moves past `expected` or the timeout elapses.
///
/// Returns [`WaitOutcome::Stale`] when the word already changed; either way
/// the caller must re-check the condition it is waiting for.
#[inline]
pub(crate) fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> WaitOutcome {
    sys::wait(word, expected, timeout)
}

/// Wake every process blocked on `word`.
#[inline]
pub(crate) fn wake_all(word: &AtomicU32) {
    sys::wake_all(word);
}
