// =============================================================================
// Position-Extremes Tracker - per-position high/low since open
// =============================================================================
//
// Feeds the trailing-stop arithmetic: on open the extremes collapse to the
// entry price, every quote while the position lives widens them, and the
// entry is dropped when the position closes. Rows are persisted so a restart
// mid-position does not forget the high-water mark.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::debug;

use crate::store::Store;
use crate::types::{AccountId, Symbol};

/// High/low water marks for one open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extremes {
    pub high: Decimal,
    pub low: Decimal,
}

/// Tracks price extremes for every open position.
pub struct ExtremesTracker {
    store: Arc<Store>,
    map: RwLock<HashMap<(AccountId, Symbol), Extremes>>,
}

impl ExtremesTracker {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store, map: RwLock::new(HashMap::new()) }
    }

    /// Reload persisted extremes at startup.
    pub fn load(&self) -> Result<usize> {
        let rows = self.store.load_extremes()?;
        let count = rows.len();
        let mut map = self.map.write();
        map.clear();
        for (account, symbol, high, low) in rows {
            map.insert((account, symbol), Extremes { high, low });
        }
        Ok(count)
    }

    /// A position opened: both extremes collapse to the entry price.
    pub fn on_open(&self, account: &str, symbol: &str, entry: Decimal) -> Result<()> {
        self.store.upsert_extremes(account, symbol, entry, entry)?;
        self.map
            .write()
            .insert((account.to_string(), symbol.to_string()), Extremes { high: entry, low: entry });
        debug!(account, symbol, entry = %entry, "extremes reset to entry");
        Ok(())
    }

    /// A quote arrived while the position is open. Returns the updated
    /// extremes, or `None` when no position is tracked for the pair.
    pub fn on_quote(&self, account: &str, symbol: &str, last: Decimal) -> Result<Option<Extremes>> {
        let key = (account.to_string(), symbol.to_string());
        let updated = {
            let mut map = self.map.write();
            let Some(entry) = map.get_mut(&key) else {
                return Ok(None);
            };
            entry.high = entry.high.max(last);
            entry.low = entry.low.min(last);
            *entry
        };
        // Persisting every quote is cheap at quote rates this engine sees;
        // the row is single-writer per account.
        self.store.upsert_extremes(account, symbol, updated.high, updated.low)?;
        Ok(Some(updated))
    }

    pub fn get(&self, account: &str, symbol: &str) -> Option<Extremes> {
        self.map.read().get(&(account.to_string(), symbol.to_string())).copied()
    }

    /// The position closed: forget its extremes.
    pub fn on_close(&self, account: &str, symbol: &str) -> Result<()> {
        if self.map.write().remove(&(account.to_string(), symbol.to_string())).is_some() {
            self.store.delete_extremes(account, symbol)?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn tracker() -> ExtremesTracker {
        ExtremesTracker::new(Arc::new(Store::open_in_memory().unwrap()))
    }

    #[test]
    fn open_collapses_to_entry() {
        let t = tracker();
        t.on_open("ACCT", "MNQ", dec!(21000)).unwrap();
        assert_eq!(
            t.get("ACCT", "MNQ").unwrap(),
            Extremes { high: dec!(21000), low: dec!(21000) }
        );
    }

    #[test]
    fn quotes_widen_extremes() {
        let t = tracker();
        t.on_open("ACCT", "MNQ", dec!(21000)).unwrap();
        t.on_quote("ACCT", "MNQ", dec!(21004)).unwrap();
        t.on_quote("ACCT", "MNQ", dec!(20990)).unwrap();
        t.on_quote("ACCT", "MNQ", dec!(21002)).unwrap();
        assert_eq!(
            t.get("ACCT", "MNQ").unwrap(),
            Extremes { high: dec!(21004), low: dec!(20990) }
        );
    }

    #[test]
    fn quotes_without_position_are_ignored() {
        let t = tracker();
        assert!(t.on_quote("ACCT", "MNQ", dec!(21000)).unwrap().is_none());
    }

    #[test]
    fn close_forgets_and_reopen_resets() {
        let t = tracker();
        t.on_open("ACCT", "MNQ", dec!(21000)).unwrap();
        t.on_quote("ACCT", "MNQ", dec!(21050)).unwrap();
        t.on_close("ACCT", "MNQ").unwrap();
        assert!(t.get("ACCT", "MNQ").is_none());

        t.on_open("ACCT", "MNQ", dec!(20900)).unwrap();
        assert_eq!(
            t.get("ACCT", "MNQ").unwrap(),
            Extremes { high: dec!(20900), low: dec!(20900) }
        );
    }

    #[test]
    fn extremes_restore_after_reload() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let t = ExtremesTracker::new(store.clone());
        t.on_open("ACCT", "MNQ", dec!(21000)).unwrap();
        t.on_quote("ACCT", "MNQ", dec!(21010)).unwrap();

        let t2 = ExtremesTracker::new(store);
        assert_eq!(t2.load().unwrap(), 1);
        assert_eq!(
            t2.get("ACCT", "MNQ").unwrap(),
            Extremes { high: dec!(21010), low: dec!(21000) }
        );
    }
}
