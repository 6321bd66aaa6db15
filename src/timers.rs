// =============================================================================
// Timer Manager - short-lived cooldown and grace timers with auto-release
// =============================================================================
//
// Timers are independent of lockouts: a cooldown does not force positions
// closed by itself, it only makes the pre-trade gate reject new entries
// until it expires. Grace timers (tag prefix `grace:`) are bookkeeping for
// the stop-loss grace rule and never block trading.
//
// One active timer per (account, tag); `start` overwrites.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::store::Store;
use crate::types::AccountId;

/// Tag prefix for stop-loss grace timers. These never gate trading.
pub const GRACE_TAG_PREFIX: &str = "grace:";

/// The grace-timer tag for a symbol.
pub fn grace_tag(symbol: &str) -> String {
    format!("{GRACE_TAG_PREFIX}{symbol}")
}

/// Owns all active timers across accounts, mirrored in the store.
pub struct TimerManager {
    store: Arc<Store>,
    active: RwLock<HashMap<(AccountId, String), DateTime<Utc>>>,
}

impl TimerManager {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store, active: RwLock::new(HashMap::new()) }
    }

    /// Reload persisted timers at startup.
    pub fn load(&self) -> Result<usize> {
        let rows = self.store.load_timers()?;
        let count = rows.len();
        let mut active = self.active.write();
        active.clear();
        for (account, tag, expires_at) in rows {
            active.insert((account, tag), expires_at);
        }
        if count > 0 {
            info!(count, "restored active timers from store");
        }
        Ok(count)
    }

    /// Arm (or re-arm) a timer. Overwrites any existing timer with the same
    /// tag. Returns the expiry instant.
    pub fn start(
        &self,
        account: &str,
        tag: &str,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let expires_at = now
            + chrono::Duration::from_std(duration)
                .unwrap_or_else(|_| chrono::Duration::seconds(0));
        self.store.upsert_timer(account, tag, expires_at)?;
        self.active.write().insert((account.to_string(), tag.to_string()), expires_at);
        info!(account, tag, secs = duration.as_secs(), expires = %expires_at, "timer armed");
        Ok(expires_at)
    }

    /// Disarm a timer. Returns true when one was active.
    pub fn cancel(&self, account: &str, tag: &str) -> Result<bool> {
        let removed =
            self.active.write().remove(&(account.to_string(), tag.to_string())).is_some();
        if removed {
            self.store.delete_timer(account, tag)?;
            debug!(account, tag, "timer cancelled");
        }
        Ok(removed)
    }

    /// Whether a specific timer is still running.
    pub fn is_active(&self, account: &str, tag: &str, now: DateTime<Utc>) -> bool {
        self.active
            .read()
            .get(&(account.to_string(), tag.to_string()))
            .is_some_and(|expires| *expires > now)
    }

    /// The longest-running cooldown currently blocking the account, if any.
    /// Grace timers are excluded; they never gate trading.
    pub fn blocking_cooldown(
        &self,
        account: &str,
        now: DateTime<Utc>,
    ) -> Option<(String, DateTime<Utc>)> {
        self.active
            .read()
            .iter()
            .filter(|((acct, tag), expires)| {
                acct == account && !tag.starts_with(GRACE_TAG_PREFIX) && **expires > now
            })
            .max_by_key(|(_, expires)| **expires)
            .map(|((_, tag), expires)| (tag.clone(), *expires))
    }

    /// All active timers (admin inspection).
    pub fn all(&self) -> Vec<(AccountId, String, DateTime<Utc>)> {
        self.active
            .read()
            .iter()
            .map(|((account, tag), expires)| (account.clone(), tag.clone(), *expires))
            .collect()
    }

    /// Expire every timer whose instant has passed. Returns the expired
    /// (account, tag) pairs so the engine can publish `TimerExpired`.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<Vec<(AccountId, String)>> {
        self.expire(now, None)
    }

    /// Like `tick`, but restricted to one account. The per-account workers
    /// use this so expiry events stay inside their own queue's ordering.
    pub fn tick_account(&self, account: &str, now: DateTime<Utc>) -> Result<Vec<(AccountId, String)>> {
        self.expire(now, Some(account))
    }

    fn expire(
        &self,
        now: DateTime<Utc>,
        only_account: Option<&str>,
    ) -> Result<Vec<(AccountId, String)>> {
        let due: Vec<(AccountId, String)> = self
            .active
            .read()
            .iter()
            .filter(|((account, _), expires)| {
                now >= **expires && only_account.is_none_or(|a| a == account)
            })
            .map(|((account, tag), _)| (account.clone(), tag.clone()))
            .collect();
        for (account, tag) in &due {
            self.store.delete_timer(account, tag)?;
            self.active.write().remove(&(account.clone(), tag.clone()));
            info!(account = %account, tag = %tag, "timer expired");
        }
        Ok(due)
    }
}

// =============================================================================
// Tests
// =============================================================================
