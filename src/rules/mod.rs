// =============================================================================
// Rule Set - one module per risk rule, evaluated in configured order
// =============================================================================
//
// A rule is a function of (event, shared snapshot) to zero or more verdicts.
// Rules never enforce anything themselves and never write lockouts or
// cooldowns; the dispatcher interprets their verdicts. The one carve-out is
// the stop-loss grace rule, which arms and disarms its own grace timers
// (grace timers gate nothing, they are the rule's alarm clock).
//
// Evaluation order comes from config; rules missing from the configured
// order are appended in id order. A rule that returns an error is logged by
// the worker and treated as having produced no verdict.
// =============================================================================

mod auth_guard;
mod daily_realized;
mod instrument_limits;
mod max_contracts;
mod session_hours;
mod stop_loss_grace;
mod symbol_blocks;
mod trade_frequency;
mod trade_management;
mod unrealized;

pub use auth_guard::AuthGuard;
pub use daily_realized::{DailyRealizedLoss, DailyRealizedProfit};
pub use instrument_limits::InstrumentLimits;
pub use max_contracts::MaxContracts;
pub use session_hours::SessionHours;
pub use stop_loss_grace::StopLossGrace;
pub use symbol_blocks::SymbolBlocks;
pub use trade_frequency::{LossCooldown, TradeFrequency};
pub use trade_management::TradeManagement;
pub use unrealized::{UnrealizedLoss, UnrealizedProfit};

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::clock::Scheduler;
use crate::config::RiskConfig;
use crate::engine_state::EngineState;
use crate::extremes::ExtremesTracker;
use crate::frequency::FrequencyCounter;
use crate::lockout::LockoutManager;
use crate::pnl::PnlTracker;
use crate::timers::TimerManager;
use crate::types::{RiskEvent, RuleId, Verdict};

/// Everything a rule may read while evaluating one event. The worker builds
/// one per event, after state and manager updates, so rules observe the
/// post-update snapshot.
pub struct RuleCtx<'a> {
    /// The account whose queue this event came through. Broadcast events
    /// (quotes, ticks) carry no account of their own.
    pub account: &'a str,
    pub config: &'a RiskConfig,
    pub state: &'a EngineState,
    pub pnl: &'a PnlTracker,
    pub lockouts: &'a LockoutManager,
    pub timers: &'a TimerManager,
    pub frequency: &'a FrequencyCounter,
    pub extremes: &'a ExtremesTracker,
    pub scheduler: &'a Scheduler,
    pub now: DateTime<Utc>,
}

/// A single risk rule.
pub trait Rule: Send + Sync {
    fn id(&self) -> RuleId;

    /// Evaluate one event against the snapshot. Most rules return at most
    /// one verdict; trade management may return several automations.
    fn evaluate(&self, event: &RiskEvent, ctx: &RuleCtx<'_>) -> Result<Vec<Verdict>>;
}

fn instantiate(id: RuleId) -> Box<dyn Rule> {
    match id {
        RuleId::MaxContracts => Box::new(MaxContracts),
        RuleId::InstrumentLimits => Box::new(InstrumentLimits),
        RuleId::DailyRealizedLoss => Box::new(DailyRealizedLoss),
        RuleId::UnrealizedLoss => Box::new(UnrealizedLoss),
        RuleId::UnrealizedProfit => Box::new(UnrealizedProfit),
        RuleId::TradeFrequency => Box::new(TradeFrequency),
        RuleId::LossCooldown => Box::new(LossCooldown),
        RuleId::StopLossGrace => Box::new(StopLossGrace),
        RuleId::SessionHours => Box::new(SessionHours),
        RuleId::AuthGuard => Box::new(AuthGuard),
        RuleId::SymbolBlocks => Box::new(SymbolBlocks),
        RuleId::TradeManagement => Box::new(TradeManagement::new()),
        RuleId::DailyRealizedProfit => Box::new(DailyRealizedProfit),
    }
}

fn enabled(config: &RiskConfig, id: RuleId) -> bool {
    let rules = &config.rules;
    match id {
        RuleId::MaxContracts => rules.max_contracts.enabled,
        RuleId::InstrumentLimits => rules.instrument_limits.enabled,
        RuleId::DailyRealizedLoss => rules.daily_realized_loss.enabled,
        RuleId::UnrealizedLoss => rules.unrealized_loss.enabled,
        RuleId::UnrealizedProfit => rules.unrealized_profit.enabled,
        RuleId::TradeFrequency => rules.trade_frequency.enabled,
        RuleId::LossCooldown => rules.loss_cooldown.enabled,
        RuleId::StopLossGrace => rules.stop_loss_grace.enabled,
        RuleId::SessionHours => rules.session_hours.enabled,
        RuleId::AuthGuard => rules.auth_guard.enabled,
        RuleId::SymbolBlocks => rules.symbol_blocks.enabled,
        RuleId::TradeManagement => rules.trade_management.enabled,
        RuleId::DailyRealizedProfit => rules.daily_realized_profit.enabled,
    }
}

/// Build the enabled rule instances in evaluation order: configured order
/// first, then any rules the config omitted, in id order.
pub fn build_rules(config: &RiskConfig) -> Vec<Box<dyn Rule>> {
    let mut order: Vec<RuleId> = Vec::new();
    for code in &config.rule_order {
        if let Some(id) = RuleId::from_code(code) {
            if !order.contains(&id) {
                order.push(id);
            }
        }
    }
    for id in RuleId::ALL {
        if !order.contains(&id) {
            order.push(id);
        }
    }
    order.into_iter().filter(|id| enabled(config, *id)).map(instantiate).collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Arc;

    use chrono::NaiveTime;
    use chrono_tz::America::New_York;
    use rust_decimal::Decimal;

    use crate::config::ContractSpec;
    use crate::store::Store;
    use crate::types::{Position, Quote, Trade};

    /// Bundle of real managers over an in-memory store, for rule tests.
    pub struct Harness {
        pub config: RiskConfig,
        pub state: EngineState,
        pub pnl: PnlTracker,
        pub lockouts: LockoutManager,
        pub timers: TimerManager,
        pub frequency: FrequencyCounter,
        pub extremes: ExtremesTracker,
        pub scheduler: Scheduler,
        pub now: DateTime<Utc>,
    }

    impl Harness {
        pub fn new(mut config: RiskConfig) -> Self {
            config.contracts.insert(
                "MNQ".into(),
                ContractSpec {
                    tick_size: Decimal::new(25, 2),
                    tick_value: Decimal::new(50, 2),
                },
            );
            config.contracts.insert(
                "ES".into(),
                ContractSpec {
                    tick_size: Decimal::new(25, 2),
                    tick_value: Decimal::new(1250, 2),
                },
            );
            let store = Arc::new(Store::open_in_memory().unwrap());
            let scheduler =
                Scheduler::new(NaiveTime::from_hms_opt(17, 0, 0).unwrap(), New_York);
            Self {
                config,
                state: EngineState::new(),
                pnl: PnlTracker::new(store.clone(), scheduler),
                lockouts: LockoutManager::new(store.clone()),
                timers: TimerManager::new(store.clone()),
                frequency: FrequencyCounter::new(store.clone()),
                extremes: ExtremesTracker::new(store),
                scheduler,
                now: Utc::now(),
            }
        }

        pub fn ctx<'a>(&'a self, account: &'a str) -> RuleCtx<'a> {
            RuleCtx {
                account,
                config: &self.config,
                state: &self.state,
                pnl: &self.pnl,
                lockouts: &self.lockouts,
                timers: &self.timers,
                frequency: &self.frequency,
                extremes: &self.extremes,
                scheduler: &self.scheduler,
                now: self.now,
            }
        }

        /// Feed a position report through the engine state, returning the
        /// classified event (opened/updated/closed).
        pub fn report_position(&self, symbol: &str, size: i64, avg: Decimal) -> RiskEvent {
            let event = self.state.apply(RiskEvent::PositionUpdated(position(symbol, size, avg)));
            if let RiskEvent::PositionOpened(p) = &event {
                self.extremes.on_open(&p.account_id, &p.symbol, p.average_price).unwrap();
            }
            if let RiskEvent::PositionClosed(p) = &event {
                self.extremes.on_close(&p.account_id, &p.symbol).unwrap();
            }
            event
        }

        /// Feed a quote through state and extremes, returning the event.
        pub fn report_quote(&self, symbol: &str, last: Decimal) -> RiskEvent {
            let event = self.state.apply(RiskEvent::MarketDataUpdated(Quote {
                symbol: symbol.into(),
                last_price: last,
                ts: self.now,
            }));
            self.extremes.on_quote("ACCT", symbol, last).unwrap();
            event
        }
    }

    pub fn position(symbol: &str, size: i64, avg: Decimal) -> Position {
        Position {
            account_id: "ACCT".into(),
            symbol: symbol.into(),
            contract_id: format!("CON.F.US.{symbol}.U25"),
            size,
            average_price: avg,
            opened_at: Utc::now(),
        }
    }

    pub fn trade(id: &str, symbol: &str, realized: Option<Decimal>, at: DateTime<Utc>) -> Trade {
        Trade {
            trade_id: id.into(),
            account_id: "ACCT".into(),
            symbol: symbol.into(),
            size: 1,
            price: Decimal::new(21000, 0),
            realized_pnl: realized,
            executed_at: at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_rules_respects_configured_order() {
        let mut config = RiskConfig::default();
        config.rules.daily_realized_loss.enabled = true;
        config.rules.daily_realized_loss.limit = rust_decimal::Decimal::from(-500);
        config.rules.auth_guard.enabled = true;
        config.rules.max_contracts.enabled = true;
        config.rule_order =
            vec!["RULE-010".into(), "RULE-003".into(), "RULE-001".into()];

        let rules = build_rules(&config);
        let ids: Vec<RuleId> = rules.iter().map(|r| r.id()).collect();
        assert_eq!(
            ids,
            vec![RuleId::AuthGuard, RuleId::DailyRealizedLoss, RuleId::MaxContracts]
        );
    }

    #[test]
    fn disabled_rules_are_not_built() {
        let mut config = RiskConfig::default();
        config.rules.max_contracts.enabled = false;
        config.rules.auth_guard.enabled = false;
        assert!(build_rules(&config).is_empty());
    }

    #[test]
    fn omitted_rules_are_appended_in_id_order() {
        let mut config = RiskConfig::default();
        config.rules.auth_guard.enabled = true;
        config.rules.max_contracts.enabled = true;
        // Only RULE-010 configured; RULE-001 must still be evaluated after.
        config.rule_order = vec!["RULE-010".into()];
        let ids: Vec<RuleId> = build_rules(&config).iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec![RuleId::AuthGuard, RuleId::MaxContracts]);
    }
}
