// =============================================================================
// Daily PnL Tracker - accumulates broker-reported realized P&L per account
// =============================================================================
//
// Only full-turn fills (non-null realized P&L) contribute. Additions are
// rounded half-to-even to cents before accumulating, and each (account,
// trading day) owns exactly one row in the store. Prior-day rows are left in
// place as the audit archive; `reset` just writes a fresh zero row for the
// new day.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::{debug, info};

use crate::clock::Scheduler;
use crate::store::Store;
use crate::types::AccountId;

/// Tracks the realized P&L of the current trading day per account, backed by
/// one durable row per (account, day).
pub struct PnlTracker {
    store: Arc<Store>,
    scheduler: Scheduler,
    cache: RwLock<HashMap<AccountId, (NaiveDate, Decimal)>>,
}

impl PnlTracker {
    pub fn new(store: Arc<Store>, scheduler: Scheduler) -> Self {
        Self { store, scheduler, cache: RwLock::new(HashMap::new()) }
    }

    /// Add a realized P&L amount observed at `at`. Returns the new daily
    /// total. The amount is rounded half-to-even to cents first.
    pub fn add_realized(&self, account: &str, pnl: Decimal, at: DateTime<Utc>) -> Result<Decimal> {
        let day = self.scheduler.trading_day(at);
        let rounded = pnl.round_dp_with_strategy(2, RoundingStrategy::MidpointNearestEven);

        let current = self.daily_for(account, day)?;
        let total = current + rounded;
        self.store.set_daily_pnl(account, day, total, at)?;
        self.cache.write().insert(account.to_string(), (day, total));

        debug!(account, %day, added = %rounded, total = %total, "realized pnl accumulated");
        Ok(total)
    }

    /// The accumulated realized P&L of the trading day containing `at`.
    pub fn get_daily(&self, account: &str, at: DateTime<Utc>) -> Result<Decimal> {
        self.daily_for(account, self.scheduler.trading_day(at))
    }

    /// Zero the tracker for the trading day beginning at `reset_time`. The
    /// previous day's row stays behind as the archive.
    pub fn reset(&self, account: &str, reset_time: DateTime<Utc>) -> Result<()> {
        let new_day = self.scheduler.trading_day(reset_time);
        self.store.set_daily_pnl(account, new_day, Decimal::ZERO, reset_time)?;
        self.cache.write().insert(account.to_string(), (new_day, Decimal::ZERO));
        info!(account, %new_day, "daily pnl reset");
        Ok(())
    }

    fn daily_for(&self, account: &str, day: NaiveDate) -> Result<Decimal> {
        if let Some((cached_day, total)) = self.cache.read().get(account) {
            if *cached_day == day {
                return Ok(*total);
            }
        }
        let total = self.store.daily_pnl(account, day)?.unwrap_or(Decimal::ZERO);
        self.cache.write().insert(account.to_string(), (day, total));
        Ok(total)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, TimeZone};
    use chrono_tz::America::New_York;
    use rust_decimal_macros::dec;

    fn tracker() -> PnlTracker {
        let scheduler =
            Scheduler::new(NaiveTime::from_hms_opt(17, 0, 0).unwrap(), New_York);
        PnlTracker::new(Arc::new(Store::open_in_memory().unwrap()), scheduler)
    }

    fn noon_et(d: u32) -> DateTime<Utc> {
        // 12:00 ET in June = 16:00 UTC.
        Utc.with_ymd_and_hms(2025, 6, d, 16, 0, 0).unwrap()
    }

    #[test]
    fn additions_accumulate() {
        let t = tracker();
        let at = noon_et(2);
        assert_eq!(t.add_realized("ACCT", dec!(-200), at).unwrap(), dec!(-200));
        assert_eq!(t.add_realized("ACCT", dec!(-150), at).unwrap(), dec!(-350));
        assert_eq!(t.add_realized("ACCT", dec!(-200), at).unwrap(), dec!(-550));
        assert_eq!(t.get_daily("ACCT", at).unwrap(), dec!(-550));
    }

    #[test]
    fn rounding_is_half_to_even() {
        let t = tracker();
        let at = noon_et(2);
        // 0.125 rounds to 0.12 (even), 0.135 rounds to 0.14 (even).
        t.add_realized("ACCT", dec!(0.125), at).unwrap();
        assert_eq!(t.get_daily("ACCT", at).unwrap(), dec!(0.12));
        t.add_realized("ACCT", dec!(0.135), at).unwrap();
        assert_eq!(t.get_daily("ACCT", at).unwrap(), dec!(0.26));
    }

    #[test]
    fn trade_at_exact_reset_belongs_to_new_day() {
        let t = tracker();
        let before = Utc.with_ymd_and_hms(2025, 6, 2, 20, 59, 59).unwrap();
        let at_reset = Utc.with_ymd_and_hms(2025, 6, 2, 21, 0, 0).unwrap(); // 17:00 ET
        t.add_realized("ACCT", dec!(-100), before).unwrap();
        t.add_realized("ACCT", dec!(-40), at_reset).unwrap();
        assert_eq!(t.get_daily("ACCT", before).unwrap(), dec!(-100));
        assert_eq!(t.get_daily("ACCT", at_reset).unwrap(), dec!(-40));
    }

    #[test]
    fn reset_zeroes_the_new_day_and_archives_the_old() {
        let t = tracker();
        let at = noon_et(2);
        t.add_realized("ACCT", dec!(-300), at).unwrap();
        let reset_time = Utc.with_ymd_and_hms(2025, 6, 2, 21, 0, 0).unwrap();
        t.reset("ACCT", reset_time).unwrap();
        // New day starts at zero.
        assert_eq!(t.get_daily("ACCT", reset_time).unwrap(), dec!(0));
        // Old day's row is still queryable.
        assert_eq!(t.get_daily("ACCT", at).unwrap(), dec!(-300));
    }

    #[test]
    fn accounts_are_independent() {
        let t = tracker();
        let at = noon_et(2);
        t.add_realized("A", dec!(-100), at).unwrap();
        t.add_realized("B", dec!(50), at).unwrap();
        assert_eq!(t.get_daily("A", at).unwrap(), dec!(-100));
        assert_eq!(t.get_daily("B", at).unwrap(), dec!(50));
    }
}
