// =============================================================================
// RULE-009 Session Block Outside - no exposure outside the session window
// =============================================================================
//
// Checked on the periodic tick and on any position/order activity. Outside
// [open, close] local time the account is flattened and locked until the
// next session open. Overnight windows (close before open) are supported.
// =============================================================================

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};

use crate::clock::local_instant;
use crate::config::parse_hhmm;
use crate::rules::{Rule, RuleCtx};
use crate::types::{LockScope, ReleaseSpec, RiskEvent, RuleId, Verdict};

pub struct SessionHours;

impl SessionHours {
    fn in_session(open: NaiveTime, close: NaiveTime, local: NaiveTime) -> bool {
        if open <= close {
            local >= open && local < close
        } else {
            // Overnight session, e.g. 18:00 -> 16:00 next day.
            local >= open || local < close
        }
    }

    fn next_open(ctx: &RuleCtx<'_>, open: NaiveTime, now: DateTime<Utc>) -> DateTime<Utc> {
        let tz = ctx.scheduler.tz();
        let local_date = now.with_timezone(&tz).date_naive();
        let today = local_instant(local_date, open, tz);
        if today > now {
            today
        } else {
            local_instant(local_date + ChronoDuration::days(1), open, tz)
        }
    }
}

impl Rule for SessionHours {
    fn id(&self) -> RuleId {
        RuleId::SessionHours
    }

    fn evaluate(&self, event: &RiskEvent, ctx: &RuleCtx<'_>) -> Result<Vec<Verdict>> {
        match event {
            RiskEvent::Tick { .. }
            | RiskEvent::PositionOpened(_)
            | RiskEvent::PositionUpdated(_)
            | RiskEvent::OrderPlaced(_) => {}
            _ => return Ok(Vec::new()),
        }

        let cfg = &ctx.config.rules.session_hours;
        let open = parse_hhmm(&cfg.open)?;
        let close = parse_hhmm(&cfg.close)?;

        let local = ctx.now.with_timezone(&ctx.scheduler.tz()).time();
        if Self::in_session(open, close, local) {
            return Ok(Vec::new());
        }

        // Already locked by this rule: nothing new to say.
        if ctx
            .lockouts
            .is_locked(ctx.account, None)
            .is_some_and(|l| l.rule_id == RuleId::SessionHours)
        {
            return Ok(Vec::new());
        }

        let release_at = Self::next_open(ctx, open, ctx.now);
        Ok(vec![Verdict::FlattenAndLock {
            scope: LockScope::Account,
            release: ReleaseSpec::UntilInstant(release_at),
            reason: format!(
                "outside session hours {}-{} ({})",
                cfg.open, cfg.close, ctx.config.timezone
            ),
        }])
    }
}
