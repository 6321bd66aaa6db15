// =============================================================================
// RULE-006 Trade Frequency / RULE-007 Cooldown After Loss
// =============================================================================
//
// Both are cooldown-category rules. Trade frequency checks the per-minute,
// per-hour, and per-session windows in that order and benches the account
// for the matching duration without touching open positions. Cooldown-after-
// loss maps the loss magnitude onto ascending tiers and additionally
// flattens the account.
// =============================================================================

use std::time::Duration;

use anyhow::Result;
use rust_decimal::Decimal;

use crate::rules::{Rule, RuleCtx};
use crate::types::{RiskEvent, RuleId, Verdict};

pub const TAG_FREQ_MINUTE: &str = "freq_min";
pub const TAG_FREQ_HOUR: &str = "freq_hour";
pub const TAG_FREQ_SESSION: &str = "freq_session";
pub const TAG_LOSS_COOLDOWN: &str = "loss_cooldown";

pub struct TradeFrequency;

impl Rule for TradeFrequency {
    fn id(&self) -> RuleId {
        RuleId::TradeFrequency
    }

    fn evaluate(&self, event: &RiskEvent, ctx: &RuleCtx<'_>) -> Result<Vec<Verdict>> {
        let trade = match event {
            RiskEvent::TradeExecuted(t) => t,
            _ => return Ok(Vec::new()),
        };
        let cfg = &ctx.config.rules.trade_frequency;

        // Windows are checked narrowest first; the first breach wins.
        let minute = ctx.frequency.count_in(&trade.account_id, 60, ctx.now)?;
        if minute > cfg.per_minute {
            return Ok(vec![cooldown(
                TAG_FREQ_MINUTE,
                cfg.cooldown_minute_secs,
                format!("{minute} trades in the last minute, limit {}", cfg.per_minute),
            )]);
        }

        let hour = ctx.frequency.count_in(&trade.account_id, 3600, ctx.now)?;
        if hour > cfg.per_hour {
            return Ok(vec![cooldown(
                TAG_FREQ_HOUR,
                cfg.cooldown_hour_secs,
                format!("{hour} trades in the last hour, limit {}", cfg.per_hour),
            )]);
        }

        let session = ctx.frequency.count_since_session_start(&trade.account_id)?;
        if session > cfg.per_session {
            return Ok(vec![cooldown(
                TAG_FREQ_SESSION,
                cfg.cooldown_session_secs,
                format!("{session} trades this session, limit {}", cfg.per_session),
            )]);
        }

        Ok(Vec::new())
    }
}

fn cooldown(tag: &str, secs: u64, reason: String) -> Verdict {
    Verdict::FlattenAndCooldown {
        tag: tag.to_string(),
        duration: Duration::from_secs(secs),
        // The trade already happened; frequency breaches only bench the
        // account, they do not unwind positions.
        flatten: false,
        reason,
    }
}

pub struct LossCooldown;

impl Rule for LossCooldown {
    fn id(&self) -> RuleId {
        RuleId::LossCooldown
    }

    fn evaluate(&self, event: &RiskEvent, ctx: &RuleCtx<'_>) -> Result<Vec<Verdict>> {
        let trade = match event {
            RiskEvent::TradeExecuted(t) => t,
            _ => return Ok(Vec::new()),
        };
        let Some(realized) = trade.realized_pnl else {
            return Ok(Vec::new());
        };
        if realized >= Decimal::ZERO {
            return Ok(Vec::new());
        }

        let magnitude = -realized;
        // Tiers ascend; the deepest tier the loss reaches sets the bench.
        let tier = ctx
            .config
            .rules
            .loss_cooldown
            .tiers
            .iter()
            .rev()
            .find(|t| magnitude >= t.loss_at_least);
        let Some(tier) = tier else {
            return Ok(Vec::new());
        };

        Ok(vec![Verdict::FlattenAndCooldown {
            tag: TAG_LOSS_COOLDOWN.to_string(),
            duration: Duration::from_secs(tier.cooldown_secs),
            flatten: true,
            reason: format!(
                "realized loss {realized} reached cooldown tier {} ({}s)",
                tier.loss_at_least, tier.cooldown_secs
            ),
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LossCooldownTier, RiskConfig};
    use crate::rules::test_support::{trade, Harness};
    use rust_decimal_macros::dec;

    fn freq_harness() -> Harness {
        let mut config = RiskConfig::default();
        config.rules.trade_frequency.enabled = true;
        config.rules.trade_frequency.per_minute = 3;
        config.rules.trade_frequency.per_hour = 10;
        config.rules.trade_frequency.per_session = 20;
        Harness::new(config)
    }

    #[test]
    fn fourth_trade_in_a_minute_benches() {
        let h = freq_harness();
        let ctx = h.ctx("ACCT");
        for i in 0..3 {
            h.frequency
                .record(&format!("t-{i}"), "ACCT", h.now - chrono::Duration::seconds(30))
                .unwrap();
            let event =
                RiskEvent::TradeExecuted(trade(&format!("t-{i}"), "MNQ", Some(dec!(10)), h.now));
            assert!(TradeFrequency.evaluate(&event, &ctx).unwrap().is_empty());
        }

        h.frequency.record("t-4", "ACCT", h.now).unwrap();
        let event = RiskEvent::TradeExecuted(trade("t-4", "MNQ", Some(dec!(10)), h.now));
        let verdicts = TradeFrequency.evaluate(&event, &ctx).unwrap();
        match &verdicts[0] {
            Verdict::FlattenAndCooldown { tag, duration, flatten, .. } => {
                assert_eq!(tag, TAG_FREQ_MINUTE);
                assert_eq!(*duration, Duration::from_secs(60));
                assert!(!flatten);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn hour_window_checked_after_minute() {
        let h = freq_harness();
        // Eleven trades spread beyond the minute window.
        for i in 0..11 {
            h.frequency
                .record(
                    &format!("t-{i}"),
                    "ACCT",
                    h.now - chrono::Duration::seconds(120 + i * 60),
                )
                .unwrap();
        }
        let event = RiskEvent::TradeExecuted(trade("t-x", "MNQ", Some(dec!(10)), h.now));
        let verdicts = TradeFrequency.evaluate(&event, &h.ctx("ACCT")).unwrap();
        assert!(matches!(
            &verdicts[0],
            Verdict::FlattenAndCooldown { tag, .. } if tag == TAG_FREQ_HOUR
        ));
    }

    #[test]
    fn session_window_counts_from_reset() {
        let mut config = RiskConfig::default();
        config.rules.trade_frequency.enabled = true;
        config.rules.trade_frequency.per_minute = 100;
        config.rules.trade_frequency.per_hour = 100;
        config.rules.trade_frequency.per_session = 2;
        let h = Harness::new(config);
        h.frequency.note_session_start("ACCT", h.now - chrono::Duration::seconds(600));

        // One trade before the session does not count.
        h.frequency
            .record("pre", "ACCT", h.now - chrono::Duration::seconds(900))
            .unwrap();
        for i in 0..3 {
            h.frequency
                .record(&format!("t-{i}"), "ACCT", h.now - chrono::Duration::seconds(60))
                .unwrap();
        }
        let event = RiskEvent::TradeExecuted(trade("t-x", "MNQ", Some(dec!(10)), h.now));
        let verdicts = TradeFrequency.evaluate(&event, &h.ctx("ACCT")).unwrap();
        assert!(matches!(
            &verdicts[0],
            Verdict::FlattenAndCooldown { tag, .. } if tag == TAG_FREQ_SESSION
        ));
    }

    fn loss_harness() -> Harness {
        let mut config = RiskConfig::default();
        config.rules.loss_cooldown.enabled = true;
        config.rules.loss_cooldown.tiers = vec![
            LossCooldownTier { loss_at_least: dec!(100), cooldown_secs: 120 },
            LossCooldownTier { loss_at_least: dec!(300), cooldown_secs: 600 },
        ];
        Harness::new(config)
    }

    #[test]
    fn loss_maps_to_matching_tier() {
        let h = loss_harness();
        let ctx = h.ctx("ACCT");

        let event = RiskEvent::TradeExecuted(trade("t-1", "MNQ", Some(dec!(-150)), h.now));
        let verdicts = LossCooldown.evaluate(&event, &ctx).unwrap();
        match &verdicts[0] {
            Verdict::FlattenAndCooldown { tag, duration, flatten, .. } => {
                assert_eq!(tag, TAG_LOSS_COOLDOWN);
                assert_eq!(*duration, Duration::from_secs(120));
                assert!(flatten);
            }
            other => panic!("unexpected {other:?}"),
        }

        // Deep loss lands in the higher tier.
        let event = RiskEvent::TradeExecuted(trade("t-2", "MNQ", Some(dec!(-450)), h.now));
        let verdicts = LossCooldown.evaluate(&event, &ctx).unwrap();
        assert!(matches!(
            &verdicts[0],
            Verdict::FlattenAndCooldown { duration, .. } if *duration == Duration::from_secs(600)
        ));
    }

    #[test]
    fn small_losses_and_wins_are_ignored() {
        let h = loss_harness();
        let ctx = h.ctx("ACCT");
        let event = RiskEvent::TradeExecuted(trade("t-1", "MNQ", Some(dec!(-50)), h.now));
        assert!(LossCooldown.evaluate(&event, &ctx).unwrap().is_empty());
        let event = RiskEvent::TradeExecuted(trade("t-2", "MNQ", Some(dec!(200)), h.now));
        assert!(LossCooldown.evaluate(&event, &ctx).unwrap().is_empty());
        let event = RiskEvent::TradeExecuted(trade("t-3", "MNQ", None, h.now));
        assert!(LossCooldown.evaluate(&event, &ctx).unwrap().is_empty());
    }
}
