// =============================================================================
// Clock & Scheduler - timezone-aware reset boundaries and the heartbeat
// =============================================================================
//
// Two background tasks live here:
//   1. The daily reset task: sleeps until the next configured wall-clock
//      reset instant (DST-aware) and broadcasts `ScheduledReset`.
//   2. The tick task: broadcasts `Tick` every few seconds; the account
//      workers use it to expire timers and lockouts and to run the session
//      window check.
//
// On startup `catch_up_reset` replays a missed boundary: if the last reset
// recorded in the store is older than the most recent past occurrence, the
// process was down across the boundary and one reset is fired immediately.
//
// If the system clock jumps backward by more than the drift threshold, both
// tasks hold their fire until wall clock and monotonic clock agree again.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::config::RiskConfig;
use crate::store::Store;
use crate::types::RiskEvent;

/// Clock-drift tolerance before the scheduler pauses.
const DRIFT_THRESHOLD_SECS: i64 = 30;

// ---------------------------------------------------------------------------
// Local-instant resolution
// ---------------------------------------------------------------------------

/// Resolve a local wall-clock (date, time) in `tz` to a UTC instant.
///
/// On the DST fall-back day the wall-clock time exists twice; the earlier
/// instant wins, so a daily trigger still fires exactly once. In the
/// spring-forward gap the wall-clock time does not exist at all; the instant
/// one hour later is used.
pub fn local_instant(date: NaiveDate, time: NaiveTime, tz: Tz) -> DateTime<Utc> {
    let naive = date.and_time(time);
    match tz.from_local_datetime(&naive) {
        chrono::LocalResult::Single(t) => t.with_timezone(&Utc),
        chrono::LocalResult::Ambiguous(first, _second) => first.with_timezone(&Utc),
        chrono::LocalResult::None => {
            let shifted = naive + ChronoDuration::hours(1);
            match tz.from_local_datetime(&shifted) {
                chrono::LocalResult::Single(t) => t.with_timezone(&Utc),
                chrono::LocalResult::Ambiguous(first, _) => first.with_timezone(&Utc),
                // Unreachable for real timezones; pin to UTC interpretation.
                chrono::LocalResult::None => Utc.from_utc_datetime(&shifted),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Computes reset occurrences and trading-day attribution for one configured
/// (reset_time, timezone) pair.
#[derive(Debug, Clone, Copy)]
pub struct Scheduler {
    reset_time: NaiveTime,
    tz: Tz,
}

impl Scheduler {
    pub fn new(reset_time: NaiveTime, tz: Tz) -> Self {
        Self { reset_time, tz }
    }

    pub fn from_config(config: &RiskConfig) -> Result<Self> {
        Ok(Self::new(config.reset_naive_time()?, config.tz()?))
    }

    pub fn tz(&self) -> Tz {
        self.tz
    }

    /// The next wall-clock occurrence of the reset time strictly after
    /// `from`.
    pub fn next_occurrence(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        let local_date = from.with_timezone(&self.tz).date_naive();
        let today = local_instant(local_date, self.reset_time, self.tz);
        if today > from {
            today
        } else {
            local_instant(local_date + ChronoDuration::days(1), self.reset_time, self.tz)
        }
    }

    /// The most recent occurrence at or before `from`.
    pub fn previous_occurrence(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        let local_date = from.with_timezone(&self.tz).date_naive();
        let today = local_instant(local_date, self.reset_time, self.tz);
        if today <= from {
            today
        } else {
            local_instant(local_date - ChronoDuration::days(1), self.reset_time, self.tz)
        }
    }

    /// The trading day a timestamp belongs to. The day boundary sits exactly
    /// at the reset instant: a timestamp equal to the reset belongs to the
    /// new day. Trading days are labelled by the local calendar date on
    /// which they end.
    pub fn trading_day(&self, ts: DateTime<Utc>) -> NaiveDate {
        let local = ts.with_timezone(&self.tz);
        if local.time() >= self.reset_time {
            local.date_naive() + ChronoDuration::days(1)
        } else {
            local.date_naive()
        }
    }

    /// Resolve an "HH:MM" wall-clock time (session open/close) on the same
    /// local day as `at`.
    pub fn local_time_on_day(&self, at: DateTime<Utc>, time: NaiveTime) -> DateTime<Utc> {
        local_instant(at.with_timezone(&self.tz).date_naive(), time, self.tz)
    }
}

// ---------------------------------------------------------------------------
// Drift guard
// ---------------------------------------------------------------------------

struct DriftAnchor {
    wall: DateTime<Utc>,
    mono: Instant,
}

/// Detects backward wall-clock jumps by comparing against the monotonic
/// clock. While the wall clock lags the monotonic projection by more than
/// the threshold, `clock_ok` reports false and time-driven actions pause.
pub struct DriftGuard {
    anchor: Mutex<DriftAnchor>,
    threshold: ChronoDuration,
}

impl DriftGuard {
    pub fn new() -> Self {
        Self {
            anchor: Mutex::new(DriftAnchor { wall: Utc::now(), mono: Instant::now() }),
            threshold: ChronoDuration::seconds(DRIFT_THRESHOLD_SECS),
        }
    }

    /// Returns true when the wall clock is trustworthy. Re-anchors on every
    /// healthy observation so ordinary NTP slew never accumulates.
    pub fn clock_ok(&self) -> bool {
        let mut anchor = self.anchor.lock();
        let now = Utc::now();
        let elapsed = ChronoDuration::from_std(anchor.mono.elapsed())
            .unwrap_or_else(|_| ChronoDuration::seconds(0));
        let expected = anchor.wall + elapsed;
        if expected - now > self.threshold {
            warn!(
                expected = %expected,
                observed = %now,
                "wall clock behind monotonic projection; pausing time-driven actions"
            );
            return false;
        }
        anchor.wall = now;
        anchor.mono = Instant::now();
        true
    }
}

impl Default for DriftGuard {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

/// Fire a catch-up reset if the process was down across a boundary.
/// Returns the instant fired, if any.
pub async fn catch_up_reset(
    scheduler: &Scheduler,
    store: &Store,
    bus: &EventBus,
) -> Result<Option<DateTime<Utc>>> {
    let now = Utc::now();
    let most_recent = scheduler.previous_occurrence(now);
    let last_seen = store.last_reset_at()?;

    let missed = match last_seen {
        Some(last) => last < most_recent,
        None => true,
    };
    if !missed {
        debug!(last_seen = ?last_seen, "no catch-up reset needed");
        return Ok(None);
    }

    info!(
        reset_time = %most_recent,
        last_seen = ?last_seen,
        "firing catch-up reset for boundary crossed while down"
    );
    store.set_last_reset_at(most_recent)?;
    bus.broadcast(RiskEvent::ScheduledReset { reset_time: most_recent }).await;
    Ok(Some(most_recent))
}

/// Daily reset loop. Runs forever; spawn once at startup.
pub async fn run_reset_scheduler(
    scheduler: Scheduler,
    store: Arc<Store>,
    bus: Arc<EventBus>,
    drift: Arc<DriftGuard>,
) {
    loop {
        let now = Utc::now();
        let next = scheduler.next_occurrence(now);
        let wait = (next - now).to_std().unwrap_or_default();
        info!(next_reset = %next, wait_secs = wait.as_secs(), "reset scheduler armed");
        tokio::time::sleep(wait).await;

        // Hold fire while the wall clock is untrustworthy.
        while !drift.clock_ok() {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        }

        if let Err(e) = store.set_last_reset_at(next) {
            warn!(error = %e, "failed to persist reset instant");
        }
        info!(reset_time = %next, "daily reset fired");
        bus.broadcast(RiskEvent::ScheduledReset { reset_time: next }).await;
    }
}

/// Heartbeat loop: broadcasts `Tick` every `interval_secs`. Skips beats
/// while the wall clock is untrustworthy.
pub async fn run_tick_task(bus: Arc<EventBus>, drift: Arc<DriftGuard>, interval_secs: u64) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if !drift.clock_ok() {
            continue;
        }
        bus.broadcast(RiskEvent::Tick { now: Utc::now() }).await;
    }
}

// =============================================================================
// Tests
// =============================================================================
