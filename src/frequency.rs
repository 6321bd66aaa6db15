// =============================================================================
// Trade-Frequency Counter - rolling-window trade counts per account
// =============================================================================
//
// Every executed trade inserts one row keyed by the broker trade id, so a
// re-delivered fill can never double count. Window counts are range queries
// over the rows; the session window starts at the most recent scheduled
// reset for the account.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use crate::store::Store;
use crate::types::AccountId;

/// Counts trades over rolling windows, backed by one store row per trade.
pub struct FrequencyCounter {
    store: Arc<Store>,
    session_start: RwLock<HashMap<AccountId, DateTime<Utc>>>,
}

impl FrequencyCounter {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store, session_start: RwLock::new(HashMap::new()) }
    }

    /// Record a trade. Returns false when this trade id was already seen;
    /// the caller must then skip all per-trade accounting for the event.
    pub fn record(&self, trade_id: &str, account: &str, ts: DateTime<Utc>) -> Result<bool> {
        let fresh = self.store.insert_trade_count(trade_id, account, ts)?;
        if !fresh {
            debug!(trade_id, account, "duplicate trade delivery ignored");
        }
        Ok(fresh)
    }

    /// Number of trades in the last `window_secs` seconds.
    pub fn count_in(&self, account: &str, window_secs: u64, now: DateTime<Utc>) -> Result<u32> {
        let since = now - chrono::Duration::seconds(window_secs as i64);
        self.store.count_trades_since(account, since)
    }

    /// Number of trades since the account's session began (the most recent
    /// scheduled reset). With no recorded session start every row counts.
    pub fn count_since_session_start(&self, account: &str) -> Result<u32> {
        let since = self
            .session_start
            .read()
            .get(account)
            .copied()
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.store.count_trades_since(account, since)
    }

    /// Mark the start of a new session for the account.
    pub fn note_session_start(&self, account: &str, at: DateTime<Utc>) {
        self.session_start.write().insert(account.to_string(), at);
    }

    /// Drop rows older than the widest window anyone can query. The session
    /// window is bounded by the last reset, so pruning up to it is safe.
    pub fn prune(&self, now: DateTime<Utc>) -> Result<usize> {
        let oldest_session = self
            .session_start
            .read()
            .values()
            .min()
            .copied()
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let hour_ago = now - chrono::Duration::seconds(3600);
        let cutoff = oldest_session.min(hour_ago);
        self.store.prune_trade_counts(cutoff)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn counter() -> FrequencyCounter {
        FrequencyCounter::new(Arc::new(Store::open_in_memory().unwrap()))
    }

    #[test]
    fn windows_count_only_recent_trades() {
        let c = counter();
        let now = Utc::now();
        c.record("t-1", "ACCT", now - chrono::Duration::seconds(10)).unwrap();
        c.record("t-2", "ACCT", now - chrono::Duration::seconds(30)).unwrap();
        c.record("t-3", "ACCT", now - chrono::Duration::seconds(90)).unwrap();
        assert_eq!(c.count_in("ACCT", 60, now).unwrap(), 2);
        assert_eq!(c.count_in("ACCT", 3600, now).unwrap(), 3);
    }

    #[test]
    fn redelivered_trade_counts_once() {
        let c = counter();
        let now = Utc::now();
        assert!(c.record("t-1", "ACCT", now).unwrap());
        assert!(!c.record("t-1", "ACCT", now).unwrap());
        assert_eq!(c.count_in("ACCT", 60, now).unwrap(), 1);
    }

    #[test]
    fn session_count_starts_at_reset() {
        let c = counter();
        let now = Utc::now();
        c.record("t-1", "ACCT", now - chrono::Duration::seconds(7200)).unwrap();
        c.record("t-2", "ACCT", now - chrono::Duration::seconds(60)).unwrap();

        // No session recorded yet: everything counts.
        assert_eq!(c.count_since_session_start("ACCT").unwrap(), 2);

        c.note_session_start("ACCT", now - chrono::Duration::seconds(3600));
        assert_eq!(c.count_since_session_start("ACCT").unwrap(), 1);
    }

    #[test]
    fn accounts_do_not_share_counts() {
        let c = counter();
        let now = Utc::now();
        c.record("t-1", "A", now).unwrap();
        c.record("t-2", "B", now).unwrap();
        assert_eq!(c.count_in("A", 60, now).unwrap(), 1);
        assert_eq!(c.count_in("B", 60, now).unwrap(), 1);
    }

    #[test]
    fn prune_keeps_session_and_hour_windows_intact() {
        let c = counter();
        let now = Utc::now();
        c.note_session_start("ACCT", now - chrono::Duration::seconds(1800));
        c.record("t-old", "ACCT", now - chrono::Duration::seconds(7200)).unwrap();
        c.record("t-new", "ACCT", now - chrono::Duration::seconds(100)).unwrap();

        c.prune(now).unwrap();
        assert_eq!(c.count_since_session_start("ACCT").unwrap(), 1);
        assert_eq!(c.count_in("ACCT", 3600, now).unwrap(), 1);
    }
}
