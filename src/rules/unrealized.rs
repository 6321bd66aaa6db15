// =============================================================================
// RULE-004 / RULE-005 - per-position unrealized P&L boundaries
// =============================================================================
//
// Both rules share the arithmetic: unrealized = (last - avg) * size *
// tick_value / tick_size, sign-correct for shorts. The loss rule closes the
// symbol when unrealized falls to the (negative) limit; the profit rule
// closes when it reaches the target. Only the event's symbol is touched.
//
// Closes produced here feed back as real trades, so a large unrealized loss
// naturally cascades into the daily realized-loss rule via the event loop.
// =============================================================================

use anyhow::Result;
use rust_decimal::Decimal;

use crate::engine_state::unrealized_pnl;
use crate::rules::{Rule, RuleCtx};
use crate::types::{RiskEvent, RuleId, Verdict};

/// Unrealized P&L of the account's position in the event's symbol, if it
/// can be computed (position open, quote known, contract spec configured).
fn event_unrealized(event: &RiskEvent, ctx: &RuleCtx<'_>) -> Result<Option<(String, Decimal)>> {
    let (symbol, last) = match event {
        RiskEvent::MarketDataUpdated(q) => (q.symbol.clone(), Some(q.last_price)),
        RiskEvent::PositionUpdated(p) => (p.symbol.clone(), None),
        _ => return Ok(None),
    };

    let Some(position) = ctx.state.position(ctx.account, &symbol) else {
        return Ok(None);
    };
    let last = match last {
        Some(last) => last,
        None => match ctx.state.last_quote(&symbol) {
            Some(quote) => quote.last_price,
            None => return Ok(None),
        },
    };
    let Some(spec) = ctx.config.contract(&symbol) else {
        return Ok(None);
    };
    Ok(Some((symbol, unrealized_pnl(&position, last, spec))))
}

pub struct UnrealizedLoss;

impl Rule for UnrealizedLoss {
    fn id(&self) -> RuleId {
        RuleId::UnrealizedLoss
    }

    fn evaluate(&self, event: &RiskEvent, ctx: &RuleCtx<'_>) -> Result<Vec<Verdict>> {
        let Some((symbol, unrealized)) = event_unrealized(event, ctx)? else {
            return Ok(Vec::new());
        };
        let limit = ctx.config.rules.unrealized_loss.limit;
        if unrealized > limit {
            return Ok(Vec::new());
        }
        Ok(vec![Verdict::ClosePosition {
            symbol,
            reason: format!("unrealized pnl {unrealized} breached loss limit {limit}"),
        }])
    }
}

pub struct UnrealizedProfit;

impl Rule for UnrealizedProfit {
    fn id(&self) -> RuleId {
        RuleId::UnrealizedProfit
    }

    fn evaluate(&self, event: &RiskEvent, ctx: &RuleCtx<'_>) -> Result<Vec<Verdict>> {
        let Some((symbol, unrealized)) = event_unrealized(event, ctx)? else {
            return Ok(Vec::new());
        };
        let target = ctx.config.rules.unrealized_profit.limit;
        if unrealized < target {
            return Ok(Vec::new());
        }
        Ok(vec![Verdict::ClosePosition {
            symbol,
            reason: format!("unrealized pnl {unrealized} reached profit target {target}"),
        }])
    }
}
