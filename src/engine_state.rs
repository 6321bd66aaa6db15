// =============================================================================
// Engine State - authoritative in-memory snapshot per account
// =============================================================================
//
// Holds current positions, working orders, latest quotes, and account flags.
// The account worker is the sole writer for its account's slice; rules and
// the admin API only read. `apply` also classifies raw position reports into
// opened/updated/closed transitions from the size change, since the feed
// itself only ever says "position updated".
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::debug;

use crate::config::ContractSpec;
use crate::types::{
    AccountFlags, AccountId, Order, OrderKind, OrderState, Position, Quote, RiskEvent, Side,
    Symbol,
};

/// Unrealized P&L of a position against the latest price, in currency units.
/// Sign-correct for shorts because `size` is signed.
pub fn unrealized_pnl(position: &Position, last: Decimal, spec: &ContractSpec) -> Decimal {
    (last - position.average_price) * Decimal::from(position.size) * spec.tick_value
        / spec.tick_size
}

/// Shared snapshot of broker-reported state.
pub struct EngineState {
    positions: RwLock<HashMap<(AccountId, Symbol), Position>>,
    orders: RwLock<HashMap<String, Order>>,
    quotes: RwLock<HashMap<Symbol, Quote>>,
    flags: RwLock<HashMap<AccountId, AccountFlags>>,
}

impl EngineState {
    pub fn new() -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
            orders: RwLock::new(HashMap::new()),
            quotes: RwLock::new(HashMap::new()),
            flags: RwLock::new(HashMap::new()),
        }
    }

    /// Fold an event into the snapshot and return its classified form.
    /// Position reports come back as `PositionOpened` / `PositionUpdated` /
    /// `PositionClosed` depending on the size transition; everything else
    /// passes through unchanged.
    pub fn apply(&self, event: RiskEvent) -> RiskEvent {
        match event {
            RiskEvent::PositionUpdated(p)
            | RiskEvent::PositionOpened(p)
            | RiskEvent::PositionClosed(p) => self.apply_position(p),
            RiskEvent::OrderPlaced(mut o) => {
                o.state = OrderState::Placed;
                self.orders.write().insert(o.order_id.clone(), o.clone());
                RiskEvent::OrderPlaced(o)
            }
            RiskEvent::OrderFilled(o) => {
                self.orders.write().remove(&o.order_id);
                RiskEvent::OrderFilled(o)
            }
            RiskEvent::OrderCancelled(o) => {
                self.orders.write().remove(&o.order_id);
                RiskEvent::OrderCancelled(o)
            }
            RiskEvent::MarketDataUpdated(q) => {
                self.quotes.write().insert(q.symbol.clone(), q.clone());
                RiskEvent::MarketDataUpdated(q)
            }
            RiskEvent::AccountUpdated(f) => {
                self.flags.write().insert(f.account_id.clone(), f.clone());
                RiskEvent::AccountUpdated(f)
            }
            other => other,
        }
    }

    fn apply_position(&self, p: Position) -> RiskEvent {
        let key = (p.account_id.clone(), p.symbol.clone());
        let mut positions = self.positions.write();
        let prior = positions.get(&key).cloned();

        if p.size == 0 {
            return match prior {
                Some(previous) => {
                    positions.remove(&key);
                    debug!(
                        account = %previous.account_id,
                        symbol = %previous.symbol,
                        "position closed"
                    );
                    RiskEvent::PositionClosed(previous)
                }
                // Flat report for a position we never tracked; nothing to do.
                None => RiskEvent::PositionClosed(p),
            };
        }

        match prior {
            None => {
                positions.insert(key, p.clone());
                debug!(account = %p.account_id, symbol = %p.symbol, size = p.size, "position opened");
                RiskEvent::PositionOpened(p)
            }
            Some(previous) => {
                // Keep the original open time across size/price updates.
                let mut updated = p;
                updated.opened_at = previous.opened_at;
                positions.insert(key, updated.clone());
                RiskEvent::PositionUpdated(updated)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Read access
    // -------------------------------------------------------------------------

    pub fn open_positions(&self, account: &str) -> Vec<Position> {
        self.positions
            .read()
            .values()
            .filter(|p| p.account_id == account)
            .cloned()
            .collect()
    }

    pub fn all_positions(&self) -> Vec<Position> {
        self.positions.read().values().cloned().collect()
    }

    pub fn position(&self, account: &str, symbol: &str) -> Option<Position> {
        self.positions.read().get(&(account.to_string(), symbol.to_string())).cloned()
    }

    /// Total absolute contracts held across all symbols of the account.
    pub fn total_abs_contracts(&self, account: &str) -> i64 {
        self.positions
            .read()
            .values()
            .filter(|p| p.account_id == account)
            .map(|p| p.size.abs())
            .sum()
    }

    pub fn open_orders(&self, account: &str) -> Vec<Order> {
        self.orders
            .read()
            .values()
            .filter(|o| o.account_id == account && o.state == OrderState::Placed)
            .cloned()
            .collect()
    }

    /// Whether a working stop order protects the account's position in
    /// `symbol` (a sell stop for a long, a buy stop for a short).
    pub fn has_protective_stop(&self, account: &str, symbol: &str) -> bool {
        let Some(position) = self.position(account, symbol) else {
            return false;
        };
        let covering_side = if position.size > 0 { Side::Sell } else { Side::Buy };
        self.orders.read().values().any(|o| {
            o.account_id == account
                && o.symbol == symbol
                && o.kind == OrderKind::Stop
                && o.side == covering_side
                && o.state == OrderState::Placed
        })
    }

    pub fn last_quote(&self, symbol: &str) -> Option<Quote> {
        self.quotes.read().get(symbol).cloned()
    }

    pub fn can_trade(&self, account: &str) -> bool {
        self.flags.read().get(account).map(|f| f.can_trade).unwrap_or(true)
    }
}

impl Default for EngineState {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
