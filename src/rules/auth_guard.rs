// =============================================================================
// RULE-010 Auth Loss Guard - flatten while the broker revokes trading
// =============================================================================
//
// When the broker reports `can_trade = false` the account is flattened and
// locked until the flag flips back. The release itself is handled by the
// lockout manager on the matching `AccountUpdated` event; no human can
// clear it early.
// =============================================================================

use anyhow::Result;

use crate::rules::{Rule, RuleCtx};
use crate::types::{LockScope, ReleaseSpec, RiskEvent, RuleId, Verdict};

pub struct AuthGuard;

impl Rule for AuthGuard {
    fn id(&self) -> RuleId {
        RuleId::AuthGuard
    }

    fn evaluate(&self, event: &RiskEvent, _ctx: &RuleCtx<'_>) -> Result<Vec<Verdict>> {
        let flags = match event {
            RiskEvent::AccountUpdated(f) => f,
            _ => return Ok(Vec::new()),
        };
        if flags.can_trade {
            return Ok(Vec::new());
        }
        Ok(vec![Verdict::FlattenAndLock {
            scope: LockScope::Account,
            release: ReleaseSpec::UntilFlag,
            reason: "broker revoked trading (can_trade=false)".into(),
        }])
    }
}
