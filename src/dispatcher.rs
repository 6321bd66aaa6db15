// =============================================================================
// Enforcement Dispatcher - turns rule verdicts into broker commands
// =============================================================================
//
// Receives the verdicts produced for one event and merges them:
//
//   1. An account-scoped flatten-and-lock subsumes everything else: install
//      the lockouts, flatten the account, done.
//   2. Symbol-scoped flatten-and-locks close and lock just their symbol,
//      subsuming close/reduce verdicts for the same symbol.
//   3. Cooldowns start the longest requested timer; any of them asking for a
//      flatten closes everything. Automations are dropped.
//   4. Otherwise, close/reduce verdicts merge per symbol (smallest surviving
//      size wins), rejects cancel their order, and automations fire for
//      positions that still exist.
//
// Lockout and timer rows are written BEFORE any broker command goes out, so
// a crash between the write and the command leaves the account locked, never
// unlocked with a breach outstanding. Broker commands retry with exponential
// backoff; on exhaustion the event is audited as enforcement_failed and the
// lockout stays.
// =============================================================================

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::audit::{
    Audit, KIND_BREACH, KIND_ENFORCEMENT, KIND_ENFORCEMENT_FAILED, KIND_GATED,
};
use crate::broker::BrokerCommands;
use crate::config::RiskConfig;
use crate::engine_state::EngineState;
use crate::lockout::LockoutManager;
use crate::pnl::PnlTracker;
use crate::timers::TimerManager;
use crate::types::{
    AutomationAction, LockScope, Lockout, OrderKind, ReleaseSpec, RiskEvent, RuleId, Side,
    Symbol, Verdict,
};

pub struct Dispatcher {
    broker: Arc<dyn BrokerCommands>,
    lockouts: Arc<LockoutManager>,
    timers: Arc<TimerManager>,
    pnl: Arc<PnlTracker>,
    audit: Arc<Audit>,
    config: Arc<RiskConfig>,
}

impl Dispatcher {
    pub fn new(
        broker: Arc<dyn BrokerCommands>,
        lockouts: Arc<LockoutManager>,
        timers: Arc<TimerManager>,
        pnl: Arc<PnlTracker>,
        audit: Arc<Audit>,
        config: Arc<RiskConfig>,
    ) -> Self {
        Self { broker, lockouts, timers, pnl, audit, config }
    }

    /// JSON capture of what a decision was made against: open positions,
    /// working orders, the triggering symbol's latest quote, and the daily
    /// realized P&L. Written onto breach and gate audit rows so they can be
    /// reconstructed later.
    fn snapshot(
        &self,
        account: &str,
        event: &RiskEvent,
        state: &EngineState,
        now: DateTime<Utc>,
    ) -> String {
        let quote = event.symbol().and_then(|s| state.last_quote(s));
        let daily_pnl = self.pnl.get_daily(account, now).ok();
        serde_json::json!({
            "event": event.kind(),
            "symbol": event.symbol(),
            "positions": state.open_positions(account),
            "open_orders": state.open_orders(account),
            "last_quote": quote,
            "daily_pnl": daily_pnl,
        })
        .to_string()
    }

    // -------------------------------------------------------------------------
    // Pre-trade gate
    // -------------------------------------------------------------------------

    /// Short-circuit check run before rules for entry events. While a
    /// lockout or cooldown is in force, the triggering position/order is
    /// closed/cancelled immediately and rule evaluation is skipped.
    /// Returns true when the event was handled here.
    pub async fn pre_trade_gate(
        &self,
        account: &str,
        event: &RiskEvent,
        state: &EngineState,
        now: DateTime<Utc>,
    ) -> bool {
        let blocked_by: Option<(Option<RuleId>, String)> =
            if let Some(lockout) = self.lockouts.is_locked(account, event.symbol()) {
                Some((Some(lockout.rule_id), format!("lockout [{}]: {}", lockout.scope, lockout.reason)))
            } else {
                self.timers
                    .blocking_cooldown(account, now)
                    .map(|(tag, expires)| (None, format!("cooldown '{tag}' until {expires}")))
            };
        let Some((rule_id, why)) = blocked_by else {
            return false;
        };

        match event {
            RiskEvent::PositionOpened(p) => {
                warn!(account, symbol = %p.symbol, %why, "position opened while blocked; closing");
                let symbol = p.symbol.clone();
                self.run_command(account, "close_position", || {
                    self.broker.close_position(account, &symbol)
                })
                .await;
                self.audit.record(
                    account,
                    rule_id,
                    Some(&p.symbol),
                    KIND_GATED,
                    &format!("closed position opened while blocked: {why}"),
                    Some(&self.snapshot(account, event, state, now)),
                    None,
                );
                true
            }
            RiskEvent::OrderPlaced(o) => {
                warn!(account, order_id = %o.order_id, %why, "order placed while blocked; cancelling");
                let order_id = o.order_id.clone();
                self.run_command(account, "cancel_order", || {
                    self.broker.cancel_order(account, &order_id)
                })
                .await;
                self.audit.record(
                    account,
                    rule_id,
                    Some(&o.symbol),
                    KIND_GATED,
                    &format!("cancelled order placed while blocked: {why}"),
                    Some(&self.snapshot(account, event, state, now)),
                    None,
                );
                true
            }
            _ => false,
        }
    }

    // -------------------------------------------------------------------------
    // Verdict merging and enforcement
    // -------------------------------------------------------------------------

    /// Apply the merged verdicts for one event. Store writes (lockouts,
    /// timers) happen before any broker command; store failures propagate,
    /// broker failures are retried and then audited as enforcement_failed.
    pub async fn enforce(
        &self,
        account: &str,
        event: &RiskEvent,
        verdicts: Vec<(RuleId, Verdict)>,
        state: &EngineState,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if verdicts.is_empty() {
            return Ok(());
        }

        // One state capture per event; every breach row it produced shares it.
        let snapshot = self.snapshot(account, event, state, now);
        for (rule_id, verdict) in &verdicts {
            info!(account, rule = %rule_id, verdict = %verdict.summary(), "rule breach");
            self.audit.record(
                account,
                Some(*rule_id),
                event.symbol(),
                KIND_BREACH,
                &format!("on {}: {}", event.kind(), verdict.summary()),
                Some(&snapshot),
                None,
            );
        }

        // Partition by verdict shape.
        let mut account_locks: Vec<(RuleId, ReleaseSpec, String)> = Vec::new();
        let mut symbol_locks: Vec<(RuleId, Symbol, ReleaseSpec, String)> = Vec::new();
        let mut cooldowns: Vec<(RuleId, String, Duration, bool, String)> = Vec::new();
        // Smallest surviving size per symbol (a full close is target 0).
        let mut targets: HashMap<Symbol, (RuleId, i64)> = HashMap::new();
        let mut rejects: Vec<(RuleId, String)> = Vec::new();
        let mut automations: Vec<(RuleId, AutomationAction)> = Vec::new();

        for (rule_id, verdict) in verdicts {
            match verdict {
                Verdict::FlattenAndLock { scope: LockScope::Account, release, reason } => {
                    account_locks.push((rule_id, release, reason));
                }
                Verdict::FlattenAndLock { scope: LockScope::Symbol(symbol), release, reason } => {
                    symbol_locks.push((rule_id, symbol, release, reason));
                }
                Verdict::FlattenAndCooldown { tag, duration, flatten, reason } => {
                    cooldowns.push((rule_id, tag, duration, flatten, reason));
                }
                Verdict::ClosePosition { symbol, .. } => {
                    targets
                        .entry(symbol)
                        .and_modify(|(_, size)| *size = 0)
                        .or_insert((rule_id, 0));
                }
                Verdict::ReduceToLimit { symbol, target_size, .. } => {
                    targets
                        .entry(symbol)
                        .and_modify(|(_, size)| *size = (*size).min(target_size))
                        .or_insert((rule_id, target_size));
                }
                Verdict::RejectOrder { order_id, .. } => {
                    rejects.push((rule_id, order_id));
                }
                Verdict::Automation(action) => automations.push((rule_id, action)),
            }
        }

        // Durable state first: every lockout row, then the cooldown timer.
        for (rule_id, release, reason) in &account_locks {
            self.lockouts.set(Lockout {
                account_id: account.to_string(),
                rule_id: *rule_id,
                scope: LockScope::Account,
                reason: reason.clone(),
                locked_at: now,
                release: release.clone(),
            })?;
        }
        for (rule_id, symbol, release, reason) in &symbol_locks {
            self.lockouts.set(Lockout {
                account_id: account.to_string(),
                rule_id: *rule_id,
                scope: LockScope::Symbol(symbol.clone()),
                reason: reason.clone(),
                locked_at: now,
                release: release.clone(),
            })?;
        }
        let cooldown = if account_locks.is_empty() {
            // Longest cooldown wins.
            cooldowns.iter().max_by_key(|(_, _, duration, _, _)| *duration)
        } else {
            // Subsumed by the hard lockout.
            None
        };
        if let Some((rule_id, tag, duration, _, reason)) = cooldown {
            self.timers.start(account, tag, *duration, now)?;
            self.audit.record(
                account,
                Some(*rule_id),
                None,
                KIND_ENFORCEMENT,
                &format!("cooldown '{tag}' for {}s: {reason}", duration.as_secs()),
                None,
                Some("ok"),
            );
        }

        // Broker commands second.
        if !account_locks.is_empty() {
            self.flatten(account, state).await;
            return Ok(());
        }

        let mut closed_symbols: Vec<Symbol> = Vec::new();
        for (rule_id, symbol, _, _) in &symbol_locks {
            if state.position(account, symbol).is_some() {
                let ok = self
                    .run_command(account, "close_position", || {
                        self.broker.close_position(account, symbol)
                    })
                    .await;
                self.record_outcome(account, *rule_id, Some(symbol), "close_position", ok);
            }
            for order in state.open_orders(account) {
                if &order.symbol == symbol {
                    self.run_command(account, "cancel_order", || {
                        self.broker.cancel_order(account, &order.order_id)
                    })
                    .await;
                }
            }
            closed_symbols.push(symbol.clone());
        }

        let flatten_requested = cooldowns.iter().any(|(_, _, _, flatten, _)| *flatten);
        if flatten_requested {
            self.flatten(account, state).await;
            return Ok(());
        }

        for (symbol, (rule_id, target)) in &targets {
            if closed_symbols.contains(symbol) {
                continue;
            }
            if state.position(account, symbol).is_none() {
                continue;
            }
            let ok = if *target <= 0 {
                closed_symbols.push(symbol.clone());
                self.run_command(account, "close_position", || {
                    self.broker.close_position(account, symbol)
                })
                .await
            } else {
                self.run_command(account, "partial_close_position", || {
                    self.broker.partial_close_position(account, symbol, *target)
                })
                .await
            };
            self.record_outcome(account, *rule_id, Some(symbol), "reduce_or_close", ok);
        }

        for (rule_id, order_id) in &rejects {
            let ok = self
                .run_command(account, "cancel_order", || {
                    self.broker.cancel_order(account, order_id)
                })
                .await;
            self.record_outcome(account, *rule_id, None, "cancel_order", ok);
        }

        // Automations only for positions that survived, and never while a
        // cooldown was issued this round.
        if cooldowns.is_empty() {
            for (rule_id, action) in automations {
                self.apply_automation(account, rule_id, action, state, &closed_symbols).await;
            }
        }

        Ok(())
    }

    async fn apply_automation(
        &self,
        account: &str,
        rule_id: RuleId,
        action: AutomationAction,
        state: &EngineState,
        closed_symbols: &[Symbol],
    ) {
        let symbol = match &action {
            AutomationAction::PlaceStop { symbol, .. }
            | AutomationAction::PlaceTakeProfit { symbol, .. }
            | AutomationAction::PlaceBracket { symbol, .. }
            | AutomationAction::AdjustTrailingStop { symbol, .. } => symbol.clone(),
        };
        if closed_symbols.contains(&symbol) || state.position(account, &symbol).is_none() {
            return;
        }

        let ok = match action {
            AutomationAction::PlaceStop { symbol, side, size, stop_price } => {
                self.run_command(account, "place_order", || {
                    self.broker.place_order(
                        account,
                        &symbol,
                        OrderKind::Stop,
                        side,
                        size,
                        Some(stop_price),
                    )
                })
                .await
            }
            AutomationAction::PlaceTakeProfit { symbol, side, size, tp_price } => {
                self.run_command(account, "place_order", || {
                    self.broker.place_order(
                        account,
                        &symbol,
                        OrderKind::TakeProfit,
                        side,
                        size,
                        Some(tp_price),
                    )
                })
                .await
            }
            AutomationAction::PlaceBracket { symbol, side, size, stop_price, tp_price } => {
                let stop_ok = self
                    .run_command(account, "place_order", || {
                        self.broker.place_order(
                            account,
                            &symbol,
                            OrderKind::Stop,
                            side,
                            size,
                            Some(stop_price),
                        )
                    })
                    .await;
                let tp_ok = self
                    .run_command(account, "place_order", || {
                        self.broker.place_order(
                            account,
                            &symbol,
                            OrderKind::TakeProfit,
                            side,
                            size,
                            Some(tp_price),
                        )
                    })
                    .await;
                stop_ok && tp_ok
            }
            AutomationAction::AdjustTrailingStop { symbol, new_stop_price } => {
                let Some(position) = state.position(account, &symbol) else {
                    return;
                };
                let side = if position.size > 0 { Side::Sell } else { Side::Buy };
                self.run_command(account, "place_order", || {
                    self.broker.place_order(
                        account,
                        &symbol,
                        OrderKind::Stop,
                        side,
                        position.size.abs(),
                        Some(new_stop_price),
                    )
                })
                .await
            }
        };
        self.record_outcome(account, rule_id, Some(&symbol), "automation", ok);
    }

    /// Close every position and cancel every order, skipping the commands
    /// entirely when the account is already flat.
    async fn flatten(&self, account: &str, state: &EngineState) {
        if !state.open_positions(account).is_empty() {
            let ok = self
                .run_command(account, "close_all_positions", || {
                    self.broker.close_all_positions(account)
                })
                .await;
            if !ok {
                self.audit.record(
                    account,
                    None,
                    None,
                    KIND_ENFORCEMENT_FAILED,
                    "close_all_positions exhausted retries",
                    None,
                    Some("failed"),
                );
            }
        }
        if !state.open_orders(account).is_empty() {
            self.run_command(account, "cancel_all_orders", || {
                self.broker.cancel_all_orders(account)
            })
            .await;
        }
    }

    fn record_outcome(
        &self,
        account: &str,
        rule_id: RuleId,
        symbol: Option<&str>,
        what: &str,
        ok: bool,
    ) {
        let (kind, outcome) =
            if ok { (KIND_ENFORCEMENT, "ok") } else { (KIND_ENFORCEMENT_FAILED, "failed") };
        self.audit.record(account, Some(rule_id), symbol, kind, what, None, Some(outcome));
    }

    /// Run one broker command with per-call timeout and exponential backoff.
    /// Returns true on success, false when every attempt failed.
    async fn run_command<F, Fut>(&self, account: &str, what: &str, mut op: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let cfg = &self.config.enforcement;
        let timeout = self.config.command_timeout();
        for attempt in 0..cfg.max_attempts {
            match tokio::time::timeout(timeout, op()).await {
                Ok(Ok(())) => return true,
                Ok(Err(e)) => {
                    warn!(account, what, attempt, error = %e, "broker command failed")
                }
                Err(_) => warn!(account, what, attempt, "broker command timed out"),
            }
            if attempt + 1 < cfg.max_attempts {
                let backoff = cfg.backoff_base_ms * (1 << attempt);
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
        }
        error!(account, what, attempts = cfg.max_attempts, "broker command exhausted retries");
        false
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use crate::store::Store;
    use crate::types::Position;

    /// Records every command; optionally fails them all.
    struct MockBroker {
        commands: Mutex<Vec<String>>,
        fail: bool,
    }

    impl MockBroker {
        fn new(fail: bool) -> Self {
            Self { commands: Mutex::new(Vec::new()), fail }
        }

        fn log(&self, entry: String) -> Result<()> {
            self.commands.lock().push(entry);
            if self.fail {
                anyhow::bail!("simulated broker failure");
            }
            Ok(())
        }

        fn seen(&self) -> Vec<String> {
            self.commands.lock().clone()
        }
    }

    #[async_trait::async_trait]
    impl BrokerCommands for MockBroker {
        async fn close_all_positions(&self, account: &str) -> Result<()> {
            self.log(format!("close_all:{account}"))
        }
        async fn close_position(&self, account: &str, symbol: &str) -> Result<()> {
            self.log(format!("close:{account}:{symbol}"))
        }
        async fn partial_close_position(
            &self,
            account: &str,
            symbol: &str,
            target_size: i64,
        ) -> Result<()> {
            self.log(format!("partial:{account}:{symbol}:{target_size}"))
        }
        async fn cancel_all_orders(&self, account: &str) -> Result<()> {
            self.log(format!("cancel_all:{account}"))
        }
        async fn cancel_order(&self, account: &str, order_id: &str) -> Result<()> {
            self.log(format!("cancel:{account}:{order_id}"))
        }
        async fn place_order(
            &self,
            account: &str,
            symbol: &str,
            kind: OrderKind,
            _side: Side,
            size: i64,
            price: Option<Decimal>,
        ) -> Result<()> {
            self.log(format!(
                "place:{account}:{symbol}:{kind:?}:{size}@{}",
                price.map(|p| p.to_string()).unwrap_or_default()
            ))
        }
    }

    struct Fixture {
        broker: Arc<MockBroker>,
        lockouts: Arc<LockoutManager>,
        timers: Arc<TimerManager>,
        store: Arc<Store>,
        dispatcher: Dispatcher,
        state: EngineState,
    }

    fn fixture(fail: bool) -> Fixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let broker = Arc::new(MockBroker::new(fail));
        let lockouts = Arc::new(LockoutManager::new(store.clone()));
        let timers = Arc::new(TimerManager::new(store.clone()));
        let scheduler = crate::clock::Scheduler::new(
            chrono::NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            chrono_tz::America::New_York,
        );
        let pnl = Arc::new(PnlTracker::new(store.clone(), scheduler));
        let audit = Arc::new(Audit::new(store.clone()));
        let mut config = RiskConfig::default();
        config.enforcement.max_attempts = 2;
        config.enforcement.backoff_base_ms = 1;
        let dispatcher = Dispatcher::new(
            broker.clone(),
            lockouts.clone(),
            timers.clone(),
            pnl,
            audit,
            Arc::new(config),
        );
        Fixture { broker, lockouts, timers, store, dispatcher, state: EngineState::new() }
    }

    fn open(state: &EngineState, symbol: &str, size: i64) {
        state.apply(RiskEvent::PositionUpdated(Position {
            account_id: "ACCT".into(),
            symbol: symbol.into(),
            contract_id: format!("CON.F.US.{symbol}.U25"),
            size,
            average_price: dec!(21000),
            opened_at: Utc::now(),
        }));
    }

    fn tick_event() -> RiskEvent {
        RiskEvent::Tick { now: Utc::now() }
    }

    #[tokio::test]
    async fn account_lock_subsumes_closes() {
        let f = fixture(false);
        open(&f.state, "MNQ", 2);
        open(&f.state, "ES", 1);
        let verdicts = vec![
            (
                RuleId::UnrealizedLoss,
                Verdict::ClosePosition { symbol: "MNQ".into(), reason: "x".into() },
            ),
            (
                RuleId::DailyRealizedLoss,
                Verdict::FlattenAndLock {
                    scope: LockScope::Account,
                    release: ReleaseSpec::UntilInstant(Utc::now() + chrono::Duration::hours(4)),
                    reason: "daily loss".into(),
                },
            ),
        ];
        f.dispatcher
            .enforce("ACCT", &tick_event(), verdicts, &f.state, Utc::now())
            .await
            .unwrap();

        assert_eq!(f.broker.seen(), vec!["close_all:ACCT"]);
        assert!(f.lockouts.is_locked("ACCT", None).is_some());
    }

    #[tokio::test]
    async fn symbol_lock_closes_only_its_symbol() {
        let f = fixture(false);
        open(&f.state, "ES", 1);
        open(&f.state, "MNQ", 2);
        let verdicts = vec![(
            RuleId::SymbolBlocks,
            Verdict::FlattenAndLock {
                scope: LockScope::Symbol("ES".into()),
                release: ReleaseSpec::Permanent,
                reason: "blocked".into(),
            },
        )];
        f.dispatcher
            .enforce("ACCT", &tick_event(), verdicts, &f.state, Utc::now())
            .await
            .unwrap();

        assert_eq!(f.broker.seen(), vec!["close:ACCT:ES"]);
        assert!(f.lockouts.is_locked("ACCT", Some("ES")).is_some());
        assert!(f.lockouts.is_locked("ACCT", Some("MNQ")).is_none());
    }

    #[tokio::test]
    async fn longest_cooldown_wins_and_flatten_flag_is_honored() {
        let f = fixture(false);
        open(&f.state, "MNQ", 2);
        let now = Utc::now();
        let verdicts = vec![
            (
                RuleId::TradeFrequency,
                Verdict::FlattenAndCooldown {
                    tag: "freq_min".into(),
                    duration: Duration::from_secs(60),
                    flatten: false,
                    reason: "freq".into(),
                },
            ),
            (
                RuleId::LossCooldown,
                Verdict::FlattenAndCooldown {
                    tag: "loss_cooldown".into(),
                    duration: Duration::from_secs(600),
                    flatten: true,
                    reason: "loss".into(),
                },
            ),
        ];
        f.dispatcher.enforce("ACCT", &tick_event(), verdicts, &f.state, now).await.unwrap();

        // The longer timer was armed; the flatten request executed.
        assert!(f.timers.is_active("ACCT", "loss_cooldown", now));
        assert!(!f.timers.is_active("ACCT", "freq_min", now));
        assert_eq!(f.broker.seen(), vec!["close_all:ACCT"]);
    }

    #[tokio::test]
    async fn frequency_cooldown_alone_does_not_flatten() {
        let f = fixture(false);
        open(&f.state, "MNQ", 2);
        let now = Utc::now();
        let verdicts = vec![(
            RuleId::TradeFrequency,
            Verdict::FlattenAndCooldown {
                tag: "freq_min".into(),
                duration: Duration::from_secs(60),
                flatten: false,
                reason: "freq".into(),
            },
        )];
        f.dispatcher.enforce("ACCT", &tick_event(), verdicts, &f.state, now).await.unwrap();
        assert!(f.timers.is_active("ACCT", "freq_min", now));
        assert!(f.broker.seen().is_empty());
    }

    #[tokio::test]
    async fn per_symbol_merge_takes_smallest_surviving_size() {
        let f = fixture(false);
        open(&f.state, "MNQ", 5);
        let verdicts = vec![
            (
                RuleId::MaxContracts,
                Verdict::ReduceToLimit { symbol: "MNQ".into(), target_size: 3, reason: "a".into() },
            ),
            (
                RuleId::InstrumentLimits,
                Verdict::ReduceToLimit { symbol: "MNQ".into(), target_size: 2, reason: "b".into() },
            ),
        ];
        f.dispatcher
            .enforce("ACCT", &tick_event(), verdicts, &f.state, Utc::now())
            .await
            .unwrap();
        assert_eq!(f.broker.seen(), vec!["partial:ACCT:MNQ:2"]);
    }

    #[tokio::test]
    async fn close_beats_reduce_for_same_symbol() {
        let f = fixture(false);
        open(&f.state, "MNQ", 5);
        let verdicts = vec![
            (
                RuleId::MaxContracts,
                Verdict::ReduceToLimit { symbol: "MNQ".into(), target_size: 3, reason: "a".into() },
            ),
            (
                RuleId::UnrealizedLoss,
                Verdict::ClosePosition { symbol: "MNQ".into(), reason: "b".into() },
            ),
        ];
        f.dispatcher
            .enforce("ACCT", &tick_event(), verdicts, &f.state, Utc::now())
            .await
            .unwrap();
        assert_eq!(f.broker.seen(), vec!["close:ACCT:MNQ"]);
    }

    #[tokio::test]
    async fn automations_dropped_when_cooldown_present() {
        let f = fixture(false);
        open(&f.state, "MNQ", 2);
        let verdicts = vec![
            (
                RuleId::TradeManagement,
                Verdict::Automation(AutomationAction::AdjustTrailingStop {
                    symbol: "MNQ".into(),
                    new_stop_price: dec!(21002),
                }),
            ),
            (
                RuleId::TradeFrequency,
                Verdict::FlattenAndCooldown {
                    tag: "freq_min".into(),
                    duration: Duration::from_secs(60),
                    flatten: false,
                    reason: "freq".into(),
                },
            ),
        ];
        f.dispatcher
            .enforce("ACCT", &tick_event(), verdicts, &f.state, Utc::now())
            .await
            .unwrap();
        assert!(f.broker.seen().is_empty());
    }

    #[tokio::test]
    async fn automation_fires_for_surviving_position() {
        let f = fixture(false);
        open(&f.state, "MNQ", 2);
        let verdicts = vec![(
            RuleId::TradeManagement,
            Verdict::Automation(AutomationAction::AdjustTrailingStop {
                symbol: "MNQ".into(),
                new_stop_price: dec!(21002),
            }),
        )];
        f.dispatcher
            .enforce("ACCT", &tick_event(), verdicts, &f.state, Utc::now())
            .await
            .unwrap();
        assert_eq!(f.broker.seen(), vec!["place:ACCT:MNQ:Stop:2@21002"]);
    }

    #[tokio::test]
    async fn take_profit_automation_places_order() {
        let f = fixture(false);
        open(&f.state, "MNQ", 2);
        let verdicts = vec![(
            RuleId::TradeManagement,
            Verdict::Automation(AutomationAction::PlaceTakeProfit {
                symbol: "MNQ".into(),
                side: Side::Sell,
                size: 2,
                tp_price: dec!(21020),
            }),
        )];
        f.dispatcher
            .enforce("ACCT", &tick_event(), verdicts, &f.state, Utc::now())
            .await
            .unwrap();
        assert_eq!(f.broker.seen(), vec!["place:ACCT:MNQ:TakeProfit:2@21020"]);
    }

    #[tokio::test]
    async fn breach_rows_capture_a_state_snapshot() {
        let f = fixture(false);
        open(&f.state, "MNQ", 2);
        f.state.apply(RiskEvent::MarketDataUpdated(crate::types::Quote {
            symbol: "MNQ".into(),
            last_price: dec!(20800),
            ts: Utc::now(),
        }));

        let event = RiskEvent::MarketDataUpdated(crate::types::Quote {
            symbol: "MNQ".into(),
            last_price: dec!(20800),
            ts: Utc::now(),
        });
        let verdicts = vec![(
            RuleId::UnrealizedLoss,
            Verdict::ClosePosition { symbol: "MNQ".into(), reason: "unrealized -800".into() },
        )];
        f.dispatcher.enforce("ACCT", &event, verdicts, &f.state, Utc::now()).await.unwrap();

        let breach = f
            .store
            .recent_audit(20)
            .unwrap()
            .into_iter()
            .find(|row| row.kind == "breach")
            .expect("breach row written");
        assert_eq!(breach.rule_id.as_deref(), Some("RULE-004"));
        let snapshot: serde_json::Value =
            serde_json::from_str(breach.snapshot.as_deref().expect("snapshot attached")).unwrap();
        // The state the rule saw is reconstructable: the open position, the
        // quote that triggered it, and the day's realized total.
        assert_eq!(snapshot["positions"][0]["symbol"], "MNQ");
        assert_eq!(snapshot["positions"][0]["size"], 2);
        assert_eq!(snapshot["last_quote"]["last_price"], "20800");
        assert!(snapshot.get("daily_pnl").is_some());
    }

    #[tokio::test]
    async fn lockout_survives_broker_failure() {
        let f = fixture(true);
        open(&f.state, "MNQ", 2);
        let verdicts = vec![(
            RuleId::DailyRealizedLoss,
            Verdict::FlattenAndLock {
                scope: LockScope::Account,
                release: ReleaseSpec::UntilInstant(Utc::now() + chrono::Duration::hours(4)),
                reason: "daily loss".into(),
            },
        )];
        f.dispatcher
            .enforce("ACCT", &tick_event(), verdicts, &f.state, Utc::now())
            .await
            .unwrap();

        // Both attempts hit the broker, both failed; the lockout holds.
        assert_eq!(f.broker.seen().len(), 2);
        assert!(f.lockouts.is_locked("ACCT", None).is_some());
    }

    #[tokio::test]
    async fn gate_closes_position_opened_while_locked() {
        let f = fixture(false);
        f.lockouts
            .set(Lockout {
                account_id: "ACCT".into(),
                rule_id: RuleId::DailyRealizedLoss,
                scope: LockScope::Account,
                reason: "locked".into(),
                locked_at: Utc::now(),
                release: ReleaseSpec::UntilInstant(Utc::now() + chrono::Duration::hours(1)),
            })
            .unwrap();

        let event = RiskEvent::PositionOpened(Position {
            account_id: "ACCT".into(),
            symbol: "MNQ".into(),
            contract_id: "CON.F.US.MNQ.U25".into(),
            size: 1,
            average_price: dec!(21000),
            opened_at: Utc::now(),
        });
        let handled = f.dispatcher.pre_trade_gate("ACCT", &event, &f.state, Utc::now()).await;
        assert!(handled);
        assert_eq!(f.broker.seen(), vec!["close:ACCT:MNQ"]);
    }

    #[tokio::test]
    async fn gate_rejects_order_during_cooldown() {
        let f = fixture(false);
        let now = Utc::now();
        f.timers.start("ACCT", "freq_min", Duration::from_secs(60), now).unwrap();

        let event = RiskEvent::OrderPlaced(crate::types::Order {
            order_id: "o-7".into(),
            account_id: "ACCT".into(),
            symbol: "MNQ".into(),
            kind: OrderKind::Limit,
            side: Side::Buy,
            size: 1,
            price: Some(dec!(21000)),
            placed_at: now,
            state: crate::types::OrderState::Placed,
        });
        let handled = f.dispatcher.pre_trade_gate("ACCT", &event, &f.state, now).await;
        assert!(handled);
        assert_eq!(f.broker.seen(), vec!["cancel:ACCT:o-7"]);
    }

    #[tokio::test]
    async fn gate_passes_when_unblocked() {
        let f = fixture(false);
        let event = RiskEvent::PositionOpened(Position {
            account_id: "ACCT".into(),
            symbol: "MNQ".into(),
            contract_id: "CON.F.US.MNQ.U25".into(),
            size: 1,
            average_price: dec!(21000),
            opened_at: Utc::now(),
        });
        assert!(!f.dispatcher.pre_trade_gate("ACCT", &event, &f.state, Utc::now()).await);
        assert!(f.broker.seen().is_empty());
    }

    #[tokio::test]
    async fn grace_timer_does_not_gate() {
        let f = fixture(false);
        let now = Utc::now();
        f.timers
            .start("ACCT", &crate::timers::grace_tag("MNQ"), Duration::from_secs(120), now)
            .unwrap();
        let event = RiskEvent::PositionOpened(Position {
            account_id: "ACCT".into(),
            symbol: "ES".into(),
            contract_id: "CON.F.US.ES.U25".into(),
            size: 1,
            average_price: dec!(5400),
            opened_at: now,
        });
        assert!(!f.dispatcher.pre_trade_gate("ACCT", &event, &f.state, now).await);
    }
}
