// =============================================================================
// RULE-001 Max Contracts - account-wide contract cap
// =============================================================================
//
// Trade-by-trade enforcement: when the total absolute size across all open
// positions exceeds the limit, the just-updated symbol is reduced by the
// excess. No lockout; the trader may immediately act in other symbols.
// =============================================================================

use anyhow::Result;

use crate::rules::{Rule, RuleCtx};
use crate::types::{RiskEvent, RuleId, Verdict};

pub struct MaxContracts;

impl Rule for MaxContracts {
    fn id(&self) -> RuleId {
        RuleId::MaxContracts
    }

    fn evaluate(&self, event: &RiskEvent, ctx: &RuleCtx<'_>) -> Result<Vec<Verdict>> {
        let position = match event {
            RiskEvent::PositionOpened(p) | RiskEvent::PositionUpdated(p) => p,
            _ => return Ok(Vec::new()),
        };

        let limit = ctx.config.rules.max_contracts.limit;
        let total = ctx.state.total_abs_contracts(&position.account_id);
        if total <= limit {
            return Ok(Vec::new());
        }

        let excess = total - limit;
        let target_size = position.size.abs() - excess;
        let reason = format!(
            "account holds {total} contracts, limit {limit}; reducing {} by {excess}",
            position.symbol
        );

        let verdict = if target_size > 0 {
            Verdict::ReduceToLimit { symbol: position.symbol.clone(), target_size, reason }
        } else {
            // The offending position alone is smaller than the excess.
            Verdict::ClosePosition { symbol: position.symbol.clone(), reason }
        };
        Ok(vec![verdict])
    }
}
