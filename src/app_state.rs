// =============================================================================
// Central Application State - Sentinel risk engine
// =============================================================================
//
// The single aggregation point for the managers and shared snapshot. Workers
// and the admin API hold one `Arc<AppState>`; each subsystem manages its own
// interior mutability, so AppState itself is plain immutable wiring.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::info;

use crate::audit::{Audit, KIND_RELEASED};
use crate::clock::Scheduler;
use crate::config::RiskConfig;
use crate::engine_state::EngineState;
use crate::extremes::ExtremesTracker;
use crate::frequency::FrequencyCounter;
use crate::lockout::LockoutManager;
use crate::pnl::PnlTracker;
use crate::store::Store;
use crate::timers::TimerManager;
use crate::types::RiskEvent;

/// Shared application state wired once at startup.
pub struct AppState {
    pub config: Arc<RiskConfig>,
    pub store: Arc<Store>,
    pub engine_state: Arc<EngineState>,
    pub pnl: Arc<PnlTracker>,
    pub lockouts: Arc<LockoutManager>,
    pub timers: Arc<TimerManager>,
    pub frequency: Arc<FrequencyCounter>,
    pub extremes: Arc<ExtremesTracker>,
    pub audit: Arc<Audit>,
    pub scheduler: Scheduler,
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Wire up every subsystem from a validated config and an open store.
    pub fn new(config: RiskConfig, store: Arc<Store>) -> Result<Self> {
        let scheduler = Scheduler::from_config(&config).context("scheduler from config")?;
        Ok(Self {
            config: Arc::new(config),
            engine_state: Arc::new(EngineState::new()),
            pnl: Arc::new(PnlTracker::new(store.clone(), scheduler)),
            lockouts: Arc::new(LockoutManager::new(store.clone())),
            timers: Arc::new(TimerManager::new(store.clone())),
            frequency: Arc::new(FrequencyCounter::new(store.clone())),
            extremes: Arc::new(ExtremesTracker::new(store.clone())),
            audit: Arc::new(Audit::new(store.clone())),
            scheduler,
            store,
            start_time: std::time::Instant::now(),
        })
    }

    /// Restore persisted state after a restart and release anything that
    /// expired while the process was down. Returns the release events the
    /// engine must still react to (e.g. a grace timer that ran out),
    /// grouped with their owning account so they can be enqueued in order.
    pub fn recover(&self) -> Result<Vec<(String, RiskEvent)>> {
        let now = Utc::now();
        self.lockouts.load()?;
        self.timers.load()?;
        self.extremes.load()?;

        // Seed session starts so per-session counts survive the restart.
        for account in &self.config.accounts {
            let start = match self.store.session_start(account)? {
                Some(start) => start,
                None => self.scheduler.previous_occurrence(now),
            };
            self.frequency.note_session_start(account, start);
        }

        let mut events = Vec::new();
        for (account, tag) in self.timers.tick(now)? {
            events.push((
                account.clone(),
                RiskEvent::TimerExpired { account_id: account, tag },
            ));
        }
        for lockout in self.lockouts.tick(now)? {
            self.audit.record(
                &lockout.account_id,
                Some(lockout.rule_id),
                None,
                KIND_RELEASED,
                "lockout expired while process was down",
                None,
                None,
            );
            events.push((
                lockout.account_id.clone(),
                RiskEvent::LockoutReleased {
                    account_id: lockout.account_id,
                    rule_id: lockout.rule_id,
                    scope: lockout.scope,
                },
            ));
        }

        info!(
            lockouts = self.lockouts.all().len(),
            timers = self.timers.all().len(),
            catch_up_events = events.len(),
            "state recovered from store"
        );
        Ok(events)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LockScope, Lockout, ReleaseSpec, RuleId};
    use std::time::Duration;

    fn config() -> RiskConfig {
        RiskConfig { accounts: vec!["ACCT".into()], ..Default::default() }
    }

    #[test]
    fn recover_restores_live_state_and_releases_expired() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let now = Utc::now();

        // Simulate the previous process: one live lockout, one expired
        // lockout, one expired timer.
        {
            let app = AppState::new(config(), store.clone()).unwrap();
            app.lockouts
                .set(Lockout {
                    account_id: "ACCT".into(),
                    rule_id: RuleId::DailyRealizedLoss,
                    scope: LockScope::Account,
                    reason: "live".into(),
                    locked_at: now,
                    release: ReleaseSpec::UntilInstant(now + chrono::Duration::hours(4)),
                })
                .unwrap();
            app.lockouts
                .set(Lockout {
                    account_id: "ACCT".into(),
                    rule_id: RuleId::SessionHours,
                    scope: LockScope::Account,
                    reason: "stale".into(),
                    locked_at: now - chrono::Duration::hours(5),
                    release: ReleaseSpec::UntilInstant(now - chrono::Duration::hours(1)),
                })
                .unwrap();
            app.timers
                .start(
                    "ACCT",
                    "loss_cooldown",
                    Duration::from_secs(1),
                    now - chrono::Duration::hours(1),
                )
                .unwrap();
        }

        // Fresh process over the same store.
        let app = AppState::new(config(), store).unwrap();
        let events = app.recover().unwrap();

        assert_eq!(app.lockouts.all().len(), 1);
        assert_eq!(app.lockouts.all()[0].rule_id, RuleId::DailyRealizedLoss);
        assert!(app.timers.all().is_empty());

        let kinds: Vec<&str> = events.iter().map(|(_, e)| e.kind()).collect();
        assert!(kinds.contains(&"timer_expired"));
        assert!(kinds.contains(&"lockout_released"));
    }

    #[test]
    fn recover_seeds_session_start_from_scheduler_when_unset() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let app = AppState::new(config(), store).unwrap();
        app.recover().unwrap();
        // A trade far before the previous reset must not count.
        app.frequency
            .record("old", "ACCT", Utc::now() - chrono::Duration::days(3))
            .unwrap();
        assert_eq!(app.frequency.count_since_session_start("ACCT").unwrap(), 0);
    }
}
