// =============================================================================
// RULE-011 Symbol Blocks - banned instruments, permanently locked
// =============================================================================
//
// Any position in a blocked symbol is closed and the (account, symbol) pair
// gets a permanent symbol-scoped lockout. Patterns are simple globs: a
// trailing `*` matches any suffix, a leading `*` any prefix, both means
// contains, a bare `*` matches everything. Matching is case-insensitive.
// =============================================================================

use anyhow::Result;

use crate::rules::{Rule, RuleCtx};
use crate::types::{LockScope, ReleaseSpec, RiskEvent, RuleId, Verdict};

/// Case-insensitive glob match with `*` as any-prefix/any-suffix.
pub fn matches_pattern(pattern: &str, symbol: &str) -> bool {
    let pattern = pattern.to_uppercase();
    let symbol = symbol.to_uppercase();
    match (pattern.strip_prefix('*'), pattern.strip_suffix('*')) {
        _ if pattern == "*" => true,
        (Some(suffix), None) => symbol.ends_with(suffix),
        (None, Some(prefix)) => symbol.starts_with(prefix),
        (Some(_), Some(_)) => {
            let inner = &pattern[1..pattern.len() - 1];
            symbol.contains(inner)
        }
        (None, None) => symbol == pattern,
    }
}

pub struct SymbolBlocks;

impl Rule for SymbolBlocks {
    fn id(&self) -> RuleId {
        RuleId::SymbolBlocks
    }

    fn evaluate(&self, event: &RiskEvent, ctx: &RuleCtx<'_>) -> Result<Vec<Verdict>> {
        let position = match event {
            RiskEvent::PositionOpened(p) | RiskEvent::PositionUpdated(p) => p,
            _ => return Ok(Vec::new()),
        };

        let cfg = &ctx.config.rules.symbol_blocks;
        let Some(pattern) =
            cfg.blocked.iter().find(|pat| matches_pattern(pat, &position.symbol))
        else {
            return Ok(Vec::new());
        };

        Ok(vec![Verdict::FlattenAndLock {
            scope: LockScope::Symbol(position.symbol.clone()),
            release: ReleaseSpec::Permanent,
            reason: format!("symbol {} is blocked (pattern {pattern})", position.symbol),
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiskConfig;
    use crate::rules::test_support::Harness;
    use rust_decimal_macros::dec;

    #[test]
    fn glob_semantics() {
        assert!(matches_pattern("ES", "ES"));
        assert!(matches_pattern("es", "ES"));
        assert!(!matches_pattern("ES", "MES"));
        assert!(matches_pattern("ES*", "ES"));
        assert!(!matches_pattern("ES*", "MES"));
        assert!(matches_pattern("*USD", "BTCUSD"));
        assert!(!matches_pattern("*USD", "USDCAD"));
        assert!(matches_pattern("*NQ*", "MNQ"));
        assert!(matches_pattern("*", "ANYTHING"));
    }

    #[test]
    fn blocked_symbol_gets_permanent_symbol_lockout() {
        let mut config = RiskConfig::default();
        config.rules.symbol_blocks.enabled = true;
        config.rules.symbol_blocks.blocked = vec!["ES*".into()];
        let h = Harness::new(config);

        let event = h.report_position("ES", 1, dec!(5400));
        let verdicts = SymbolBlocks.evaluate(&event, &h.ctx("ACCT")).unwrap();
        match &verdicts[0] {
            Verdict::FlattenAndLock { scope, release, .. } => {
                assert_eq!(*scope, LockScope::Symbol("ES".into()));
                assert_eq!(*release, ReleaseSpec::Permanent);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unblocked_symbol_is_silent() {
        let mut config = RiskConfig::default();
        config.rules.symbol_blocks.enabled = true;
        config.rules.symbol_blocks.blocked = vec!["ES".into()];
        let h = Harness::new(config);
        let event = h.report_position("MNQ", 1, dec!(21000));
        assert!(SymbolBlocks.evaluate(&event, &h.ctx("ACCT")).unwrap().is_empty());
    }
}
