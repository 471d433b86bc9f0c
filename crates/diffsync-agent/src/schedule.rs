//! Adaptive idle waits
//!
//! When no new work is available the fetcher and applier sleep. How long is
//! a pure function of configuration and elapsed time, so it lives here and
//! the loops only carry the two counters it needs.
//!
//! ## Fetcher
//!
//! ```text
//! no first wait yet ─────────────────────→ First      (first_sleep)
//! last batch < cadence ago ──────────────→ Aligned    (cadence - elapsed)
//! overdue, fewer than quick_retries polls → QuickRetry (quick_retry)
//! overdue, quick retries spent ──────────→ SlowRetry  (slow_retry)
//! ```
//!
//! ## Applier
//!
//! First wait is `first_sleep`; afterwards `cadence - elapsed`, never below
//! `applier_floor`.

use std::fmt;
use std::time::Duration;

use crate::config::TimingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitKind {
    First,
    Aligned,
    QuickRetry,
    SlowRetry,
}

impl WaitKind {
    /// True for the polls made after the producer's next diff was due.
    pub fn is_overdue(&self) -> bool {
        matches!(self, WaitKind::QuickRetry | WaitKind::SlowRetry)
    }
}

impl fmt::Display for WaitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WaitKind::First => "first",
            WaitKind::Aligned => "aligned",
            WaitKind::QuickRetry => "quick-retry",
            WaitKind::SlowRetry => "slow-retry",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wait {
    pub kind: WaitKind,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct WaitPolicy {
    pub cadence: Duration,
    pub first_sleep: Duration,
    pub quick_retry: Duration,
    pub quick_retries: u32,
    pub slow_retry: Duration,
    pub applier_floor: Duration,
}

impl WaitPolicy {
    pub fn from_timing(timing: &TimingConfig) -> Self {
        Self {
            cadence: timing.cadence(),
            first_sleep: timing.first_sleep(),
            quick_retry: timing.quick_retry(),
            quick_retries: timing.quick_retries,
            slow_retry: timing.slow_retry(),
            applier_floor: timing.applier_floor(),
        }
    }

    /// Fetcher idle wait.
    ///
    /// `since_last_batch` is `None` until this process completes a batch;
    /// `overdue_polls` counts the overdue waits already taken since then.
    pub fn fetcher_wait(
        &self,
        since_last_batch: Option<Duration>,
        first_wait_done: bool,
        overdue_polls: u32,
    ) -> Wait {
        if !first_wait_done {
            return Wait {
                kind: WaitKind::First,
                duration: self.first_sleep,
            };
        }

        if let Some(elapsed) = since_last_batch {
            if elapsed < self.cadence {
                return Wait {
                    kind: WaitKind::Aligned,
                    duration: self.cadence - elapsed,
                };
            }
        }

        if overdue_polls < self.quick_retries {
            Wait {
                kind: WaitKind::QuickRetry,
                duration: self.quick_retry,
            }
        } else {
            Wait {
                kind: WaitKind::SlowRetry,
                duration: self.slow_retry,
            }
        }
    }

    /// Applier idle wait.
    pub fn applier_wait(&self, since_last_batch: Option<Duration>, first_wait_done: bool) -> Wait {
        if !first_wait_done {
            return Wait {
                kind: WaitKind::First,
                duration: self.first_sleep,
            };
        }

        let remaining = since_last_batch
            .map(|elapsed| self.cadence.saturating_sub(elapsed))
            .unwrap_or(Duration::ZERO);
        Wait {
            kind: WaitKind::Aligned,
            duration: remaining.max(self.applier_floor),
        }
    }
}
