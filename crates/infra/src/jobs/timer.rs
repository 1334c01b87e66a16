//! Adaptive scheduler timer.
//!
//! A single restartable countdown driving the run loop:
//!
//! - [`SchedulerTimer::reset_at`] arms the timer for the next known due time,
//!   clamped into `[now + TIMER_MIN_DURATION, now + TIMER_MAX_DURATION]`. The
//!   upper bound makes the loop re-poll periodically even when it knows of no
//!   upcoming work (another instance may have added some).
//! - [`SchedulerTimer::reschedule_earlier`] nudges an armed timer: it only
//!   rearms when the requested time is earlier than the armed one, or when the
//!   timer is *edgy* (the last poll left ready work behind), in which case it
//!   fires right away.
//!
//! Rearming replaces the underlying deadline, so a tick that already elapsed
//! but was not yet observed is discarded rather than delivered twice.

use std::pin::Pin;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{Instant, Sleep};

/// Longest the timer ever sleeps.
pub const TIMER_MAX_DURATION: Duration = Duration::from_secs(30 * 60);

/// Shortest the timer ever sleeps; "fire now" means this.
pub const TIMER_MIN_DURATION: Duration = Duration::from_millis(1);

#[derive(Debug)]
pub struct SchedulerTimer {
    sleep: Pin<Box<Sleep>>,
    next: DateTime<Utc>,
    edgy: bool,
}

impl SchedulerTimer {
    /// A timer that fires immediately.
    pub fn new() -> Self {
        Self {
            sleep: Box::pin(tokio::time::sleep(Duration::ZERO)),
            next: Utc::now(),
            edgy: false,
        }
    }

    pub fn is_edgy(&self) -> bool {
        self.edgy
    }

    /// Wall-clock time the timer is armed for.
    pub fn next(&self) -> DateTime<Utc> {
        self.next
    }

    /// Rearm for `next`; returns the armed duration.
    pub fn reset_at(&mut self, next: DateTime<Utc>, edgy: bool) -> Duration {
        self.reset_at_from(Utc::now(), next, edgy)
    }

    /// Rearm earlier if warranted; returns the armed duration, or
    /// `Duration::ZERO` when nothing changed.
    ///
    /// `None` means "something finished": it only matters to an edgy timer.
    pub fn reschedule_earlier(&mut self, next: Option<DateTime<Utc>>) -> Duration {
        self.reschedule_earlier_from(Utc::now(), next)
    }

    /// Wait for the timer to fire. Cancel-safe.
    pub async fn tick(&mut self) {
        self.sleep.as_mut().await;
    }

    fn reset_at_from(&mut self, now: DateTime<Utc>, next: DateTime<Utc>, edgy: bool) -> Duration {
        self.edgy = edgy;
        self.arm(now, clamp_duration(now, next))
    }

    fn reschedule_earlier_from(
        &mut self,
        now: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
    ) -> Duration {
        let dur = if self.edgy {
            // One immediate re-poll per edgy period; the poll decides again.
            self.edgy = false;
            TIMER_MIN_DURATION
        } else {
            match next {
                Some(next) if next < self.next => clamp_duration(now, next),
                _ => return Duration::ZERO,
            }
        };

        self.arm(now, dur)
    }

    fn arm(&mut self, now: DateTime<Utc>, dur: Duration) -> Duration {
        self.next = now + chrono::Duration::from_std(dur).unwrap_or(chrono::Duration::zero());
        self.sleep.as_mut().reset(Instant::now() + dur);
        dur
    }
}

impl Default for SchedulerTimer {
    fn default() -> Self {
        Self::new()
    }
}

fn clamp_duration(now: DateTime<Utc>, next: DateTime<Utc>) -> Duration {
    (next - now)
        .to_std()
        .unwrap_or(Duration::ZERO)
        .clamp(TIMER_MIN_DURATION, TIMER_MAX_DURATION)
}
