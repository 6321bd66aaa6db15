// =============================================================================
// RULE-002 Max Contracts Per Instrument - per-symbol contract caps
// =============================================================================

use anyhow::Result;

use crate::config::{InstrumentLimitMode, UnknownSymbolPolicy};
use crate::rules::{Rule, RuleCtx};
use crate::types::{RiskEvent, RuleId, Verdict};

pub struct InstrumentLimits;

impl Rule for InstrumentLimits {
    fn id(&self) -> RuleId {
        RuleId::InstrumentLimits
    }

    fn evaluate(&self, event: &RiskEvent, ctx: &RuleCtx<'_>) -> Result<Vec<Verdict>> {
        let position = match event {
            RiskEvent::PositionOpened(p) | RiskEvent::PositionUpdated(p) => p,
            _ => return Ok(Vec::new()),
        };

        let cfg = &ctx.config.rules.instrument_limits;
        let held = position.size.abs();

        let limit = match cfg.limits.get(&position.symbol) {
            Some(limit) => *limit,
            None => match &cfg.unknown_symbol {
                UnknownSymbolPolicy::Allow => return Ok(Vec::new()),
                UnknownSymbolPolicy::AllowWithLimit(limit) => *limit,
                UnknownSymbolPolicy::Block => {
                    return Ok(vec![Verdict::ClosePosition {
                        symbol: position.symbol.clone(),
                        reason: format!("no limit configured for {}; policy is block", position.symbol),
                    }]);
                }
            },
        };

        if held <= limit {
            return Ok(Vec::new());
        }

        let reason =
            format!("{held} contracts in {} exceeds per-instrument limit {limit}", position.symbol);
        let verdict = match cfg.mode {
            InstrumentLimitMode::ReduceToLimit => Verdict::ReduceToLimit {
                symbol: position.symbol.clone(),
                target_size: limit,
                reason,
            },
            InstrumentLimitMode::Close => {
                Verdict::ClosePosition { symbol: position.symbol.clone(), reason }
            }
        };
        Ok(vec![verdict])
    }
}
