// =============================================================================
// RULE-003 / RULE-013 - daily realized P&L boundaries (hard lockout)
// =============================================================================
//
// Both rules read the daily tracker after the engine has folded the trade's
// realized P&L in, and both derive their release instant from the same
// scheduler that drives the daily reset, so the lockout always lifts exactly
// at the next boundary.
// =============================================================================

use anyhow::Result;

use crate::rules::{Rule, RuleCtx};
use crate::types::{LockScope, ReleaseSpec, RiskEvent, RuleId, Trade, Verdict};

fn full_turn<'a>(event: &'a RiskEvent) -> Option<&'a Trade> {
    match event {
        RiskEvent::TradeExecuted(t) if t.realized_pnl.is_some() => Some(t),
        _ => None,
    }
}

pub struct DailyRealizedLoss;

impl Rule for DailyRealizedLoss {
    fn id(&self) -> RuleId {
        RuleId::DailyRealizedLoss
    }

    fn evaluate(&self, event: &RiskEvent, ctx: &RuleCtx<'_>) -> Result<Vec<Verdict>> {
        let Some(trade) = full_turn(event) else {
            return Ok(Vec::new());
        };
        let daily = ctx.pnl.get_daily(&trade.account_id, trade.executed_at)?;
        let limit = ctx.config.rules.daily_realized_loss.limit;
        if daily > limit {
            return Ok(Vec::new());
        }
        let next_reset = ctx.scheduler.next_occurrence(ctx.now);
        Ok(vec![Verdict::FlattenAndLock {
            scope: LockScope::Account,
            release: ReleaseSpec::UntilInstant(next_reset),
            reason: format!("daily realized pnl {daily} breached loss limit {limit}"),
        }])
    }
}

pub struct DailyRealizedProfit;

impl Rule for DailyRealizedProfit {
    fn id(&self) -> RuleId {
        RuleId::DailyRealizedProfit
    }

    fn evaluate(&self, event: &RiskEvent, ctx: &RuleCtx<'_>) -> Result<Vec<Verdict>> {
        let Some(trade) = full_turn(event) else {
            return Ok(Vec::new());
        };
        let daily = ctx.pnl.get_daily(&trade.account_id, trade.executed_at)?;
        let target = ctx.config.rules.daily_realized_profit.limit;
        if daily < target {
            return Ok(Vec::new());
        }
        let next_reset = ctx.scheduler.next_occurrence(ctx.now);
        Ok(vec![Verdict::FlattenAndLock {
            scope: LockScope::Account,
            release: ReleaseSpec::UntilInstant(next_reset),
            reason: format!("daily realized pnl {daily} reached profit target {target}"),
        }])
    }
}
