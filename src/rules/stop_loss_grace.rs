// =============================================================================
// RULE-008 No-Stop-Loss Grace - close positions left unprotected
// =============================================================================
//
// A fresh position arms a grace timer keyed to its symbol. Placing a
// protective stop (a sell stop for a long, a buy stop for a short) disarms
// it; if the timer expires with the position still open and unprotected, the
// position is closed. The grace clock starts at event-receipt time.
//
// Grace timers are this rule's alarm clock, not an enforcement: they never
// gate the pre-trade path, and this rule owns their arm/disarm lifecycle.
// =============================================================================

use std::time::Duration;

use anyhow::Result;

use crate::timers::{grace_tag, GRACE_TAG_PREFIX};
use crate::rules::{Rule, RuleCtx};
use crate::types::{OrderKind, RiskEvent, RuleId, Side, Verdict};

pub struct StopLossGrace;

impl Rule for StopLossGrace {
    fn id(&self) -> RuleId {
        RuleId::StopLossGrace
    }

    fn evaluate(&self, event: &RiskEvent, ctx: &RuleCtx<'_>) -> Result<Vec<Verdict>> {
        let cfg = &ctx.config.rules.stop_loss_grace;
        match event {
            RiskEvent::PositionOpened(p) => {
                ctx.timers.start(
                    &p.account_id,
                    &grace_tag(&p.symbol),
                    Duration::from_secs(cfg.grace_secs),
                    ctx.now,
                )?;
                Ok(Vec::new())
            }
            RiskEvent::PositionClosed(p) => {
                ctx.timers.cancel(&p.account_id, &grace_tag(&p.symbol))?;
                Ok(Vec::new())
            }
            RiskEvent::OrderPlaced(o) if o.kind == OrderKind::Stop => {
                let Some(position) = ctx.state.position(&o.account_id, &o.symbol) else {
                    return Ok(Vec::new());
                };
                let covering = if position.size > 0 { Side::Sell } else { Side::Buy };
                if o.side == covering {
                    ctx.timers.cancel(&o.account_id, &grace_tag(&o.symbol))?;
                }
                Ok(Vec::new())
            }
            RiskEvent::TimerExpired { account_id, tag } => {
                let Some(symbol) = tag.strip_prefix(GRACE_TAG_PREFIX) else {
                    return Ok(Vec::new());
                };
                if ctx.state.position(account_id, symbol).is_none() {
                    return Ok(Vec::new());
                }
                if ctx.state.has_protective_stop(account_id, symbol) {
                    return Ok(Vec::new());
                }
                Ok(vec![Verdict::ClosePosition {
                    symbol: symbol.to_string(),
                    reason: format!(
                        "no stop loss attached within {}s grace window",
                        cfg.grace_secs
                    ),
                }])
            }
            _ => Ok(Vec::new()),
        }
    }
}
