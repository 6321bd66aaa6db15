// =============================================================================
// RULE-012 Trade Management - bracket placement and trailing stops
// =============================================================================
//
// The only automation-category rule: it never enforces, it suggests orders.
// On open it proposes a stop, a take-profit, or a full bracket at configured
// tick distances. While quotes stream in with the trailing stop enabled, it
// re-proposes the stop from the tracked extreme, but only when the new stop
// is strictly closer to the market than the last one it emitted - the stop
// ratchets, it never widens.
// =============================================================================

use std::collections::HashMap;

use anyhow::Result;
use parking_lot::RwLock;
use rust_decimal::Decimal;

use crate::config::ProtectionMode;
use crate::rules::{Rule, RuleCtx};
use crate::types::{AccountId, AutomationAction, RiskEvent, RuleId, Side, Symbol, Verdict};

pub struct TradeManagement {
    /// Last stop price proposed per (account, symbol).
    last_stop: RwLock<HashMap<(AccountId, Symbol), Decimal>>,
}

impl TradeManagement {
    pub fn new() -> Self {
        Self { last_stop: RwLock::new(HashMap::new()) }
    }
}

impl Default for TradeManagement {
    fn default() -> Self {
        Self::new()
    }
}

impl Rule for TradeManagement {
    fn id(&self) -> RuleId {
        RuleId::TradeManagement
    }

    fn evaluate(&self, event: &RiskEvent, ctx: &RuleCtx<'_>) -> Result<Vec<Verdict>> {
        let cfg = &ctx.config.rules.trade_management;
        match event {
            RiskEvent::PositionOpened(p) => {
                let Some(spec) = ctx.config.contract(&p.symbol) else {
                    return Ok(Vec::new());
                };
                let long = p.size > 0;
                let covering = if long { Side::Sell } else { Side::Buy };
                let size = p.size.abs();
                let stop_offset = Decimal::from(cfg.stop_ticks) * spec.tick_size;
                let tp_offset = Decimal::from(cfg.take_profit_ticks) * spec.tick_size;
                let (stop_price, tp_price) = if long {
                    (p.average_price - stop_offset, p.average_price + tp_offset)
                } else {
                    (p.average_price + stop_offset, p.average_price - tp_offset)
                };

                let action = match cfg.protection {
                    ProtectionMode::Stop => AutomationAction::PlaceStop {
                        symbol: p.symbol.clone(),
                        side: covering,
                        size,
                        stop_price,
                    },
                    ProtectionMode::TakeProfit => AutomationAction::PlaceTakeProfit {
                        symbol: p.symbol.clone(),
                        side: covering,
                        size,
                        tp_price,
                    },
                    ProtectionMode::Bracket => AutomationAction::PlaceBracket {
                        symbol: p.symbol.clone(),
                        side: covering,
                        size,
                        stop_price,
                        tp_price,
                    },
                };
                // The trailing ratchet compares against the last stop we
                // proposed; a take-profit-only open places none.
                if cfg.protection != ProtectionMode::TakeProfit {
                    self.last_stop
                        .write()
                        .insert((p.account_id.clone(), p.symbol.clone()), stop_price);
                }
                Ok(vec![Verdict::Automation(action)])
            }
            RiskEvent::PositionClosed(p) => {
                self.last_stop.write().remove(&(p.account_id.clone(), p.symbol.clone()));
                Ok(Vec::new())
            }
            RiskEvent::MarketDataUpdated(q) if cfg.trailing_stop.enabled => {
                let Some(position) = ctx.state.position(ctx.account, &q.symbol) else {
                    return Ok(Vec::new());
                };
                let Some(spec) = ctx.config.contract(&q.symbol) else {
                    return Ok(Vec::new());
                };
                let Some(extremes) = ctx.extremes.get(ctx.account, &q.symbol) else {
                    return Ok(Vec::new());
                };

                let long = position.size > 0;
                let trail = Decimal::from(cfg.trailing_stop.trail_ticks) * spec.tick_size;
                let proposed =
                    if long { extremes.high - trail } else { extremes.low + trail };

                let key = (ctx.account.to_string(), q.symbol.clone());
                let prior = self.last_stop.read().get(&key).copied();
                let improves = match prior {
                    None => true,
                    // The stop only ratchets toward the market.
                    Some(prior) => {
                        if long {
                            proposed > prior
                        } else {
                            proposed < prior
                        }
                    }
                };
                if !improves {
                    return Ok(Vec::new());
                }

                self.last_stop.write().insert(key, proposed);
                Ok(vec![Verdict::Automation(AutomationAction::AdjustTrailingStop {
                    symbol: q.symbol.clone(),
                    new_stop_price: proposed,
                })])
            }
            _ => Ok(Vec::new()),
        }
    }
}
