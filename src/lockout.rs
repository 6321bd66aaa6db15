// =============================================================================
// Lockout Manager - active lockouts and their release conditions
// =============================================================================
//
// At most one lockout exists per (account, rule, scope). `set` is idempotent
// for identical triples; a later `set` replaces an earlier one only when its
// release is strictly later. There is no manual unlock path: lockouts leave
// through `tick` (UntilInstant), through a `can_trade = true` account flag
// (UntilFlag), or never (Permanent).
//
// The in-memory list mirrors the store; rows are written before the memory
// update so a crash can only lose releases, never installs.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::store::Store;
use crate::types::{LockScope, Lockout, ReleaseSpec, RuleId};

/// Restrictiveness rank used when several lockouts match a query.
fn release_rank(release: &ReleaseSpec) -> u8 {
    match release {
        ReleaseSpec::UntilInstant(_) => 0,
        ReleaseSpec::UntilFlag => 1,
        ReleaseSpec::Manual => 2,
        ReleaseSpec::Permanent => 3,
    }
}

/// True when `new` releases strictly later than `old`.
fn strictly_later(new: &ReleaseSpec, old: &ReleaseSpec) -> bool {
    match (new, old) {
        (ReleaseSpec::UntilInstant(a), ReleaseSpec::UntilInstant(b)) => a > b,
        _ => release_rank(new) > release_rank(old),
    }
}

/// Owns every active lockout across all supervised accounts.
pub struct LockoutManager {
    store: Arc<Store>,
    active: RwLock<Vec<Lockout>>,
}

impl LockoutManager {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store, active: RwLock::new(Vec::new()) }
    }

    /// Reload persisted lockouts. Called once at startup, before the feed
    /// opens.
    pub fn load(&self) -> Result<usize> {
        let loaded = self.store.load_lockouts()?;
        let count = loaded.len();
        *self.active.write() = loaded;
        if count > 0 {
            info!(count, "restored active lockouts from store");
        }
        Ok(count)
    }

    /// Install (or extend) a lockout. Returns true when the set changed
    /// state: a fresh install or a strictly-later release replacing an
    /// earlier one.
    pub fn set(&self, lockout: Lockout) -> Result<bool> {
        {
            let active = self.active.read();
            if let Some(existing) = active.iter().find(|l| {
                l.account_id == lockout.account_id
                    && l.rule_id == lockout.rule_id
                    && l.scope == lockout.scope
            }) {
                if !strictly_later(&lockout.release, &existing.release) {
                    debug!(
                        account = %lockout.account_id,
                        rule = %lockout.rule_id,
                        scope = %lockout.scope,
                        "lockout already in force; set is a no-op"
                    );
                    return Ok(false);
                }
            }
        }

        self.store.upsert_lockout(&lockout)?;
        let mut active = self.active.write();
        active.retain(|l| {
            !(l.account_id == lockout.account_id
                && l.rule_id == lockout.rule_id
                && l.scope == lockout.scope)
        });
        info!(
            account = %lockout.account_id,
            rule = %lockout.rule_id,
            scope = %lockout.scope,
            release = %lockout.release,
            reason = %lockout.reason,
            "lockout installed"
        );
        active.push(lockout);
        Ok(true)
    }

    /// Remove one lockout. Only release paths call this.
    pub fn clear(&self, account: &str, rule_id: RuleId, scope: &LockScope) -> Result<()> {
        self.store.delete_lockout(account, rule_id, scope)?;
        self.active.write().retain(|l| {
            !(l.account_id == account && l.rule_id == rule_id && &l.scope == scope)
        });
        Ok(())
    }

    /// The most restrictive lockout matching (account, symbol), if any. An
    /// account-scoped lockout dominates a symbol-scoped one.
    pub fn is_locked(&self, account: &str, symbol: Option<&str>) -> Option<Lockout> {
        let active = self.active.read();
        let matching = active.iter().filter(|l| {
            l.account_id == account
                && match (&l.scope, symbol) {
                    (LockScope::Account, _) => true,
                    (LockScope::Symbol(locked_sym), Some(sym)) => locked_sym == sym,
                    (LockScope::Symbol(_), None) => false,
                }
        });
        matching
            .max_by(|a, b| {
                let account_first =
                    matches!(a.scope, LockScope::Account).cmp(&matches!(b.scope, LockScope::Account));
                account_first.then_with(|| {
                    match (&a.release, &b.release) {
                        (ReleaseSpec::UntilInstant(x), ReleaseSpec::UntilInstant(y)) => x.cmp(y),
                        (x, y) => release_rank(x).cmp(&release_rank(y)),
                    }
                })
            })
            .cloned()
    }

    /// All active lockouts (admin inspection).
    pub fn all(&self) -> Vec<Lockout> {
        self.active.read().clone()
    }

    /// Release every `UntilInstant` lockout whose instant has passed.
    /// Returns the released lockouts so the engine can publish
    /// `LockoutReleased` events.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<Vec<Lockout>> {
        self.release_due(now, None)
    }

    /// Like `tick`, but restricted to one account. The per-account workers
    /// use this so release events stay inside their own queue's ordering.
    pub fn tick_account(&self, account: &str, now: DateTime<Utc>) -> Result<Vec<Lockout>> {
        self.release_due(now, Some(account))
    }

    fn release_due(&self, now: DateTime<Utc>, only_account: Option<&str>) -> Result<Vec<Lockout>> {
        let due: Vec<Lockout> = self
            .active
            .read()
            .iter()
            .filter(|l| {
                matches!(l.release, ReleaseSpec::UntilInstant(t) if now >= t)
                    && only_account.is_none_or(|a| a == l.account_id)
            })
            .cloned()
            .collect();
        for lockout in &due {
            self.clear(&lockout.account_id, lockout.rule_id, &lockout.scope)?;
            info!(
                account = %lockout.account_id,
                rule = %lockout.rule_id,
                scope = %lockout.scope,
                "lockout released (instant passed)"
            );
        }
        Ok(due)
    }

    /// React to an account flag update. A `can_trade = true` flag releases
    /// every `UntilFlag` lockout for that account.
    pub fn on_account_flags(&self, account: &str, can_trade: bool) -> Result<Vec<Lockout>> {
        if !can_trade {
            return Ok(Vec::new());
        }
        let due: Vec<Lockout> = self
            .active
            .read()
            .iter()
            .filter(|l| l.account_id == account && l.release == ReleaseSpec::UntilFlag)
            .cloned()
            .collect();
        for lockout in &due {
            self.clear(&lockout.account_id, lockout.rule_id, &lockout.scope)?;
            info!(
                account = %lockout.account_id,
                rule = %lockout.rule_id,
                "lockout released (can_trade restored)"
            );
        }
        Ok(due)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn manager() -> LockoutManager {
        LockoutManager::new(Arc::new(Store::open_in_memory().unwrap()))
    }

    fn lockout(rule_id: RuleId, scope: LockScope, release: ReleaseSpec) -> Lockout {
        Lockout {
            account_id: "ACCT".into(),
            rule_id,
            scope,
            reason: "test".into(),
            locked_at: Utc::now(),
            release,
        }
    }

    #[test]
    fn set_is_idempotent_for_identical_triple() {
        let m = manager();
        let release = ReleaseSpec::UntilInstant(Utc::now() + Duration::hours(1));
        assert!(m
            .set(lockout(RuleId::DailyRealizedLoss, LockScope::Account, release.clone()))
            .unwrap());
        assert!(!m
            .set(lockout(RuleId::DailyRealizedLoss, LockScope::Account, release))
            .unwrap());
        assert_eq!(m.all().len(), 1);
    }

    #[test]
    fn later_release_replaces_earlier() {
        let m = manager();
        let t1 = Utc::now() + Duration::hours(1);
        let t2 = t1 + Duration::hours(2);
        m.set(lockout(RuleId::DailyRealizedLoss, LockScope::Account, ReleaseSpec::UntilInstant(t1)))
            .unwrap();
        // Earlier release does not shorten the lockout.
        assert!(!m
            .set(lockout(
                RuleId::DailyRealizedLoss,
                LockScope::Account,
                ReleaseSpec::UntilInstant(t1 - Duration::minutes(30)),
            ))
            .unwrap());
        // Strictly later release extends it.
        assert!(m
            .set(lockout(
                RuleId::DailyRealizedLoss,
                LockScope::Account,
                ReleaseSpec::UntilInstant(t2),
            ))
            .unwrap());
        match m.is_locked("ACCT", None).unwrap().release {
            ReleaseSpec::UntilInstant(t) => assert_eq!(t, t2),
            other => panic!("unexpected release {other:?}"),
        }
    }

    #[test]
    fn account_scope_dominates_symbol_scope() {
        let m = manager();
        m.set(lockout(
            RuleId::SymbolBlocks,
            LockScope::Symbol("ES".into()),
            ReleaseSpec::Permanent,
        ))
        .unwrap();
        m.set(lockout(
            RuleId::DailyRealizedLoss,
            LockScope::Account,
            ReleaseSpec::UntilInstant(Utc::now() + Duration::hours(1)),
        ))
        .unwrap();

        let hit = m.is_locked("ACCT", Some("ES")).unwrap();
        assert_eq!(hit.scope, LockScope::Account);
        // A different symbol is still caught by the account lockout.
        assert!(m.is_locked("ACCT", Some("MNQ")).is_some());
    }

    #[test]
    fn symbol_lockout_only_matches_its_symbol() {
        let m = manager();
        m.set(lockout(
            RuleId::SymbolBlocks,
            LockScope::Symbol("ES".into()),
            ReleaseSpec::Permanent,
        ))
        .unwrap();
        assert!(m.is_locked("ACCT", Some("ES")).is_some());
        assert!(m.is_locked("ACCT", Some("MNQ")).is_none());
        assert!(m.is_locked("ACCT", None).is_none());
    }

    #[test]
    fn tick_releases_only_past_instants() {
        let m = manager();
        let now = Utc::now();
        m.set(lockout(
            RuleId::DailyRealizedLoss,
            LockScope::Account,
            ReleaseSpec::UntilInstant(now - Duration::seconds(1)),
        ))
        .unwrap();
        m.set(lockout(
            RuleId::SessionHours,
            LockScope::Account,
            ReleaseSpec::UntilInstant(now + Duration::hours(1)),
        ))
        .unwrap();
        m.set(lockout(RuleId::SymbolBlocks, LockScope::Symbol("ES".into()), ReleaseSpec::Permanent))
            .unwrap();

        let released = m.tick(now).unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].rule_id, RuleId::DailyRealizedLoss);
        assert_eq!(m.all().len(), 2);
    }

    #[test]
    fn can_trade_true_releases_flag_lockouts() {
        let m = manager();
        m.set(lockout(RuleId::AuthGuard, LockScope::Account, ReleaseSpec::UntilFlag)).unwrap();

        // can_trade=false releases nothing.
        assert!(m.on_account_flags("ACCT", false).unwrap().is_empty());
        assert!(m.is_locked("ACCT", None).is_some());

        let released = m.on_account_flags("ACCT", true).unwrap();
        assert_eq!(released.len(), 1);
        assert!(m.is_locked("ACCT", None).is_none());
    }

    #[test]
    fn lockouts_restore_after_reload() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let m = LockoutManager::new(store.clone());
        m.set(lockout(RuleId::AuthGuard, LockScope::Account, ReleaseSpec::UntilFlag)).unwrap();

        let m2 = LockoutManager::new(store);
        assert_eq!(m2.load().unwrap(), 1);
        assert!(m2.is_locked("ACCT", None).is_some());
    }
}
