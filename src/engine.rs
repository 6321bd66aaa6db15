// =============================================================================
// Engine - per-account workers driving the whole evaluation pipeline
// =============================================================================
//
// One worker task per supervised account, fed by that account's FIFO queue.
// For each event the worker, strictly in order:
//
//   1. expands a heartbeat tick into timer/lockout expiry sub-events,
//   2. folds the event into the shared snapshot (classifying position
//      transitions on the way),
//   3. updates the stateful managers (P&L, frequency, extremes, flag-driven
//      lockout releases, daily resets),
//   4. runs the pre-trade gate for entry events while blocked,
//   5. evaluates the enabled rules in configured order,
//   6. hands the collected verdicts to the enforcement dispatcher.
//
// A rule failure is logged and treated as "no verdict". Store failures
// propagate; after a few consecutive ones the worker stops with a critical
// log rather than silently supervising without persistence. Other accounts
// are unaffected.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::app_state::AppState;
use crate::audit::{KIND_DUPLICATE, KIND_RELEASED};
use crate::bus::EventBus;
use crate::dispatcher::Dispatcher;
use crate::rules::{build_rules, Rule, RuleCtx};
use crate::types::{RiskEvent, Verdict};

/// Consecutive store failures tolerated before an account worker stops.
const MAX_STORE_FAILURES: u32 = 3;

pub struct Engine {
    app: Arc<AppState>,
    dispatcher: Arc<Dispatcher>,
    bus: Arc<EventBus>,
}

impl Engine {
    pub fn new(app: Arc<AppState>, dispatcher: Arc<Dispatcher>, bus: Arc<EventBus>) -> Self {
        Self { app, dispatcher, bus }
    }

    /// Register a queue and spawn a worker for every configured account.
    pub fn spawn_account_workers(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        for account in &self.app.config.accounts {
            let rx = self.bus.register(account);
            let engine = Arc::clone(self);
            let account = account.clone();
            handles.push(tokio::spawn(async move {
                engine.run_worker(account, rx).await;
            }));
        }
        handles
    }

    async fn run_worker(&self, account: String, mut rx: mpsc::Receiver<RiskEvent>) {
        info!(account = %account, "account worker started");
        let rules = build_rules(&self.app.config);
        let mut store_failures: u32 = 0;

        while let Some(event) = rx.recv().await {
            let result = self.handle(&account, event, &rules).await;
            match result {
                Ok(()) => store_failures = 0,
                Err(e) => {
                    store_failures += 1;
                    error!(
                        account = %account,
                        error = %e,
                        consecutive = store_failures,
                        "event processing failed"
                    );
                    if store_failures >= MAX_STORE_FAILURES {
                        error!(
                            account = %account,
                            "store unavailable; stopping account worker - trading for this \
                             account is no longer supervised"
                        );
                        break;
                    }
                }
            }
        }
        warn!(account = %account, "account worker exited");
    }

    /// Handle one queued event: expand ticks into their expiry sub-events,
    /// then process everything in order.
    async fn handle(
        &self,
        account: &str,
        event: RiskEvent,
        rules: &[Box<dyn Rule>],
    ) -> Result<()> {
        if let RiskEvent::Tick { now } = &event {
            for sub_event in self.expire_due(account, *now)? {
                self.process_event(account, sub_event, rules).await?;
            }
        }
        self.process_event(account, event, rules).await
    }

    /// Expire this account's due timers and lockouts, returning the
    /// resulting sub-events. Sub-events never produce further sub-events.
    fn expire_due(&self, account: &str, now: chrono::DateTime<Utc>) -> Result<Vec<RiskEvent>> {
        let mut events = Vec::new();
        for (account_id, tag) in self.app.timers.tick_account(account, now)? {
            events.push(RiskEvent::TimerExpired { account_id, tag });
        }
        for lockout in self.app.lockouts.tick_account(account, now)? {
            self.app.audit.record(
                &lockout.account_id,
                Some(lockout.rule_id),
                None,
                KIND_RELEASED,
                &format!("lockout released: {}", lockout.reason),
                None,
                None,
            );
            events.push(RiskEvent::LockoutReleased {
                account_id: lockout.account_id,
                rule_id: lockout.rule_id,
                scope: lockout.scope,
            });
        }
        Ok(events)
    }

    /// The per-event pipeline. Public for tests; production traffic arrives
    /// through the worker queues.
    pub async fn process_event(
        &self,
        account: &str,
        event: RiskEvent,
        rules: &[Box<dyn Rule>],
    ) -> Result<()> {
        let now = Utc::now();
        let app = &self.app;

        // 1. Fold into the snapshot; position reports come back classified.
        let event = app.engine_state.apply(event);

        // 2. Stateful manager updates.
        match &event {
            RiskEvent::TradeExecuted(t) => {
                let fresh = app.frequency.record(&t.trade_id, &t.account_id, t.executed_at)?;
                if !fresh {
                    app.audit.record(
                        &t.account_id,
                        None,
                        Some(&t.symbol),
                        KIND_DUPLICATE,
                        &format!("trade {} re-delivered; ignored", t.trade_id),
                        None,
                        None,
                    );
                    return Ok(());
                }
                if let Some(realized) = t.realized_pnl {
                    let total = app.pnl.add_realized(&t.account_id, realized, t.executed_at)?;
                    debug!(account, realized = %realized, daily = %total, "full-turn fill");
                }
            }
            RiskEvent::PositionOpened(p) => {
                app.extremes.on_open(&p.account_id, &p.symbol, p.average_price)?;
            }
            RiskEvent::PositionClosed(p) => {
                app.extremes.on_close(&p.account_id, &p.symbol)?;
            }
            RiskEvent::MarketDataUpdated(q) => {
                app.extremes.on_quote(account, &q.symbol, q.last_price)?;
            }
            RiskEvent::AccountUpdated(f) => {
                for lockout in app.lockouts.on_account_flags(&f.account_id, f.can_trade)? {
                    app.audit.record(
                        &f.account_id,
                        Some(lockout.rule_id),
                        None,
                        KIND_RELEASED,
                        "lockout released: can_trade restored",
                        None,
                        None,
                    );
                }
            }
            RiskEvent::ScheduledReset { reset_time } => {
                app.pnl.reset(account, *reset_time)?;
                app.frequency.note_session_start(account, *reset_time);
                app.store.set_session_start(account, *reset_time)?;
                app.frequency.prune(now)?;
                info!(account, reset_time = %reset_time, "daily boundary applied");
            }
            _ => {}
        }

        // 3. Pre-trade gate: entry events while blocked are undone here and
        // never reach the rules.
        if matches!(event, RiskEvent::PositionOpened(_) | RiskEvent::OrderPlaced(_))
            && self.dispatcher.pre_trade_gate(account, &event, &app.engine_state, now).await
        {
            return Ok(());
        }

        // 4. Rules, in configured order. A failing rule yields no verdict.
        let ctx = RuleCtx {
            account,
            config: &app.config,
            state: &app.engine_state,
            pnl: &app.pnl,
            lockouts: &app.lockouts,
            timers: &app.timers,
            frequency: &app.frequency,
            extremes: &app.extremes,
            scheduler: &app.scheduler,
            now,
        };
        let mut verdicts: Vec<(crate::types::RuleId, Verdict)> = Vec::new();
        for rule in rules {
            match rule.evaluate(&event, &ctx) {
                Ok(vs) => verdicts.extend(vs.into_iter().map(|v| (rule.id(), v))),
                Err(e) => {
                    error!(
                        account,
                        rule = %rule.id(),
                        event = event.kind(),
                        error = %e,
                        "rule evaluation failed; treating as no verdict"
                    );
                }
            }
        }

        // 5. Enforcement.
        if !verdicts.is_empty() {
            self.dispatcher.enforce(account, &event, verdicts, &app.engine_state, now).await?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
