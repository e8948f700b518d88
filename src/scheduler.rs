use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Granularity of the coarse sleep phase. Sleeping in chunks keeps the
/// worker responsive to cancellation without giving up scheduling accuracy.
pub const SLEEP_CHUNK: Duration = Duration::from_millis(25);

/// Overshoot beyond which a waited delay is reported as inaccurate.
pub const ACCURACY_TOLERANCE: Duration = Duration::from_millis(100);

/// How far behind schedule a command must be before its wait is counted as
/// skipped rather than merely late.
pub const SKIP_THRESHOLD: Duration = Duration::from_secs(10);

/// A falling-behind warning is emitted on every multiple of this many
/// consecutive skipped waits.
pub const SKIP_WARNING_EVERY: u32 = 100;

const SPIN_BURST: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Slept (and possibly spun) until the requested offset.
    Waited,
    /// Already past the offset but within [`SKIP_THRESHOLD`]; ran immediately.
    Immediate,
    /// More than [`SKIP_THRESHOLD`] behind; the wait was skipped entirely.
    Skipped,
    /// Cancellation was observed while sleeping.
    Cancelled,
}

/// Schedules command execution against a worker's anchor time.
///
/// The wait combines coarse 25 ms sleeps, which yield the thread, with a
/// short busy-wait tail that closes the gap left by scheduler granularity.
/// Consecutive skipped waits are tracked so a replay that has fallen far
/// behind surfaces periodically in the log instead of on every command.
#[derive(Debug)]
pub struct DelayScheduler {
    name: String,
    consecutive_skipped: u32,
}

impl DelayScheduler {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            consecutive_skipped: 0,
        }
    }

    pub fn consecutive_skipped(&self) -> u32 {
        self.consecutive_skipped
    }

    /// Sleeps until `anchor + offset_ms`, or returns immediately when the
    /// target is already in the past. `None` offsets run immediately and do
    /// not touch the skip accounting.
    pub async fn wait_for_offset(
        &mut self,
        offset_ms: Option<u64>,
        anchor: Instant,
        cancel: &CancellationToken,
    ) -> WaitOutcome {
        let Some(offset_ms) = offset_ms else {
            return WaitOutcome::Immediate;
        };
        let offset = Duration::from_millis(offset_ms);
        let elapsed_since_anchor = anchor.elapsed();

        if offset > elapsed_since_anchor {
            self.consecutive_skipped = 0;
            let delay = offset - elapsed_since_anchor;
            let start = Instant::now();

            while start.elapsed() + SLEEP_CHUNK < delay {
                tokio::select! {
                    _ = cancel.cancelled() => return WaitOutcome::Cancelled,
                    _ = tokio::time::sleep(SLEEP_CHUNK) => {}
                }
            }
            while start.elapsed() < delay {
                for _ in 0..SPIN_BURST {
                    std::hint::spin_loop();
                }
            }

            let overshoot = start.elapsed().saturating_sub(delay);
            if overshoot > ACCURACY_TOLERANCE {
                tracing::warn!(
                    worker = %self.name,
                    requested_ms = offset_ms,
                    overshoot_ms = overshoot.as_millis() as u64,
                    "inaccurate delay"
                );
            }
            return WaitOutcome::Waited;
        }

        let behind = elapsed_since_anchor - offset;
        if behind > SKIP_THRESHOLD {
            self.consecutive_skipped += 1;
            if self.consecutive_skipped % SKIP_WARNING_EVERY == 0 {
                tracing::warn!(
                    worker = %self.name,
                    behind_ms = behind.as_millis() as u64,
                    consecutive_skipped = self.consecutive_skipped,
                    "replay falling behind; delays are being skipped"
                );
            }
            WaitOutcome::Skipped
        } else {
            WaitOutcome::Immediate
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    use super::{DelayScheduler, WaitOutcome, SKIP_WARNING_EVERY};

    #[tokio::test]
    async fn waits_until_the_requested_offset() {
        let mut scheduler = DelayScheduler::new("test");
        let cancel = CancellationToken::new();
        let anchor = Instant::now();

        let outcome = scheduler.wait_for_offset(Some(80), anchor, &cancel).await;

        assert_eq!(outcome, WaitOutcome::Waited);
        let elapsed = anchor.elapsed();
        assert!(elapsed >= Duration::from_millis(80), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(230), "elapsed {elapsed:?}");
        assert_eq!(scheduler.consecutive_skipped(), 0);
    }

    #[tokio::test]
    async fn missing_offset_runs_immediately() {
        let mut scheduler = DelayScheduler::new("test");
        let cancel = CancellationToken::new();
        let outcome = scheduler.wait_for_offset(None, Instant::now(), &cancel).await;
        assert_eq!(outcome, WaitOutcome::Immediate);
    }

    #[tokio::test]
    async fn slightly_behind_runs_immediately_without_skip_accounting() {
        let mut scheduler = DelayScheduler::new("test");
        let cancel = CancellationToken::new();
        let anchor = Instant::now() - Duration::from_secs(5);

        let outcome = scheduler.wait_for_offset(Some(500), anchor, &cancel).await;

        assert_eq!(outcome, WaitOutcome::Immediate);
        assert_eq!(scheduler.consecutive_skipped(), 0);
    }

    #[tokio::test]
    async fn far_behind_skips_and_counts() {
        let mut scheduler = DelayScheduler::new("test");
        let cancel = CancellationToken::new();
        let anchor = Instant::now() - Duration::from_secs(11);

        let outcome = scheduler.wait_for_offset(Some(500), anchor, &cancel).await;

        assert_eq!(outcome, WaitOutcome::Skipped);
        assert_eq!(scheduler.consecutive_skipped(), 1);
    }

    #[tokio::test]
    async fn skip_counter_accumulates_to_the_warning_multiple() {
        let mut scheduler = DelayScheduler::new("test");
        let cancel = CancellationToken::new();
        let anchor = Instant::now() - Duration::from_secs(20);

        for _ in 0..SKIP_WARNING_EVERY {
            let outcome = scheduler.wait_for_offset(Some(0), anchor, &cancel).await;
            assert_eq!(outcome, WaitOutcome::Skipped);
        }
        assert_eq!(scheduler.consecutive_skipped(), SKIP_WARNING_EVERY);
    }

    #[tokio::test]
    async fn waiting_resets_the_skip_counter() {
        let mut scheduler = DelayScheduler::new("test");
        let cancel = CancellationToken::new();
        let anchor = Instant::now() - Duration::from_secs(11);
        scheduler.wait_for_offset(Some(0), anchor, &cancel).await;
        assert_eq!(scheduler.consecutive_skipped(), 1);

        // An offset slightly in the future takes the waited path and clears
        // the counter.
        let outcome = scheduler
            .wait_for_offset(Some(11_050), anchor, &cancel)
            .await;
        assert_eq!(outcome, WaitOutcome::Waited);
        assert_eq!(scheduler.consecutive_skipped(), 0);
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_long_wait() {
        let mut scheduler = DelayScheduler::new("test");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let anchor = Instant::now();

        let outcome = scheduler.wait_for_offset(Some(60_000), anchor, &cancel).await;
        assert_eq!(outcome, WaitOutcome::Cancelled);
        assert!(anchor.elapsed() < Duration::from_secs(5));
    }
}
