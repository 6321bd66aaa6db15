// =============================================================================
// Shared types used across the Sentinel risk engine
// =============================================================================
//
// Everything here is deliberately dumb data: events flowing in from the
// broker feed, verdicts flowing out of the rules, and the handful of enums
// both sides agree on. All mutation lives in the managers.
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Opaque broker account identifier, e.g. `"PRAC-V2-126244"`.
pub type AccountId = String;

/// Root instrument symbol, e.g. `"MNQ"` (extracted from the contract id).
pub type Symbol = String;

// ---------------------------------------------------------------------------
// Order / position primitives
// ---------------------------------------------------------------------------

/// Direction of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Broker order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit,
    Stop,
    TakeProfit,
}

/// Lifecycle state of an order as reported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    Placed,
    Filled,
    Cancelled,
}

/// A tracked open position. Created on the first non-zero size report,
/// destroyed when size transitions back to zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub account_id: AccountId,
    pub symbol: Symbol,
    pub contract_id: String,
    /// Signed size: positive = long, negative = short.
    pub size: i64,
    pub average_price: Decimal,
    pub opened_at: DateTime<Utc>,
}

/// A working or terminal order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub account_id: AccountId,
    pub symbol: Symbol,
    pub kind: OrderKind,
    pub side: Side,
    pub size: i64,
    pub price: Option<Decimal>,
    pub placed_at: DateTime<Utc>,
    pub state: OrderState,
}

/// A fill report. `realized_pnl` is `None` on half-turn opening fills; only
/// full-turn fills carry broker-computed realized P&L.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    pub account_id: AccountId,
    pub symbol: Symbol,
    pub size: i64,
    pub price: Decimal,
    pub realized_pnl: Option<Decimal>,
    pub executed_at: DateTime<Utc>,
}

/// Latest market quote for a symbol. Latest wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: Symbol,
    pub last_price: Decimal,
    pub ts: DateTime<Utc>,
}

/// Account-level flags pushed by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountFlags {
    pub account_id: AccountId,
    pub can_trade: bool,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Rule identifiers
// ---------------------------------------------------------------------------

/// Stable identifier of each risk rule. The numeric form (`RULE-003`) is the
/// wire/config/audit representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleId {
    MaxContracts,
    InstrumentLimits,
    DailyRealizedLoss,
    UnrealizedLoss,
    UnrealizedProfit,
    TradeFrequency,
    LossCooldown,
    StopLossGrace,
    SessionHours,
    AuthGuard,
    SymbolBlocks,
    TradeManagement,
    DailyRealizedProfit,
}

impl RuleId {
    pub const ALL: [RuleId; 13] = [
        RuleId::MaxContracts,
        RuleId::InstrumentLimits,
        RuleId::DailyRealizedLoss,
        RuleId::UnrealizedLoss,
        RuleId::UnrealizedProfit,
        RuleId::TradeFrequency,
        RuleId::LossCooldown,
        RuleId::StopLossGrace,
        RuleId::SessionHours,
        RuleId::AuthGuard,
        RuleId::SymbolBlocks,
        RuleId::TradeManagement,
        RuleId::DailyRealizedProfit,
    ];

    /// Canonical `RULE-NNN` code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MaxContracts => "RULE-001",
            Self::InstrumentLimits => "RULE-002",
            Self::DailyRealizedLoss => "RULE-003",
            Self::UnrealizedLoss => "RULE-004",
            Self::UnrealizedProfit => "RULE-005",
            Self::TradeFrequency => "RULE-006",
            Self::LossCooldown => "RULE-007",
            Self::StopLossGrace => "RULE-008",
            Self::SessionHours => "RULE-009",
            Self::AuthGuard => "RULE-010",
            Self::SymbolBlocks => "RULE-011",
            Self::TradeManagement => "RULE-012",
            Self::DailyRealizedProfit => "RULE-013",
        }
    }

    /// Parse the canonical code back into a `RuleId`.
    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|r| r.code() == code)
    }
}

impl std::fmt::Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

// ---------------------------------------------------------------------------
// Lockouts
// ---------------------------------------------------------------------------

/// What a lockout applies to. An account-scoped lockout dominates every
/// symbol-scoped one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockScope {
    Account,
    Symbol(Symbol),
}

impl std::fmt::Display for LockScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Account => write!(f, "account"),
            Self::Symbol(sym) => write!(f, "symbol:{sym}"),
        }
    }
}

impl LockScope {
    /// Parse the persisted form (`"account"` or `"symbol:MNQ"`).
    pub fn parse(raw: &str) -> Option<Self> {
        if raw == "account" {
            Some(Self::Account)
        } else {
            raw.strip_prefix("symbol:").map(|s| Self::Symbol(s.to_string()))
        }
    }
}

/// How an active lockout is released. There is no manual unlock path:
/// `Manual` exists for completeness but no rule produces it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseSpec {
    UntilInstant(DateTime<Utc>),
    UntilFlag,
    Manual,
    Permanent,
}

impl std::fmt::Display for ReleaseSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UntilInstant(t) => write!(f, "until {}", t.to_rfc3339()),
            Self::UntilFlag => write!(f, "until can_trade=true"),
            Self::Manual => write!(f, "manual"),
            Self::Permanent => write!(f, "permanent"),
        }
    }
}

/// An active trading lockout. At most one per (account, rule, scope).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lockout {
    pub account_id: AccountId,
    pub rule_id: RuleId,
    pub scope: LockScope,
    pub reason: String,
    pub locked_at: DateTime<Utc>,
    pub release: ReleaseSpec,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A normalized event flowing through the per-account queue. Position
/// open/close variants are derived by the engine from size transitions; the
/// feed itself only ever reports `PositionUpdated`.
#[derive(Debug, Clone)]
pub enum RiskEvent {
    PositionOpened(Position),
    PositionUpdated(Position),
    /// Carries the last known shape of the position before it went flat.
    PositionClosed(Position),
    OrderPlaced(Order),
    OrderFilled(Order),
    OrderCancelled(Order),
    TradeExecuted(Trade),
    MarketDataUpdated(Quote),
    AccountUpdated(AccountFlags),
    /// Daily boundary fired by the scheduler (or its startup catch-up).
    ScheduledReset { reset_time: DateTime<Utc> },
    /// Cooldown or grace timer ran out.
    TimerExpired { account_id: AccountId, tag: String },
    /// A lockout's release condition fired.
    LockoutReleased { account_id: AccountId, rule_id: RuleId, scope: LockScope },
    /// Periodic heartbeat driving timer/lockout expiry and session checks.
    Tick { now: DateTime<Utc> },
}

impl RiskEvent {
    /// Short tag for logging and audit rows.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PositionOpened(_) => "position_opened",
            Self::PositionUpdated(_) => "position_updated",
            Self::PositionClosed(_) => "position_closed",
            Self::OrderPlaced(_) => "order_placed",
            Self::OrderFilled(_) => "order_filled",
            Self::OrderCancelled(_) => "order_cancelled",
            Self::TradeExecuted(_) => "trade_executed",
            Self::MarketDataUpdated(_) => "market_data",
            Self::AccountUpdated(_) => "account_updated",
            Self::ScheduledReset { .. } => "scheduled_reset",
            Self::TimerExpired { .. } => "timer_expired",
            Self::LockoutReleased { .. } => "lockout_released",
            Self::Tick { .. } => "tick",
        }
    }

    /// The account this event belongs to, if it is account-scoped. Quotes,
    /// resets, and ticks fan out to every account queue instead.
    pub fn account_id(&self) -> Option<&str> {
        match self {
            Self::PositionOpened(p) | Self::PositionUpdated(p) | Self::PositionClosed(p) => {
                Some(&p.account_id)
            }
            Self::OrderPlaced(o) | Self::OrderFilled(o) | Self::OrderCancelled(o) => {
                Some(&o.account_id)
            }
            Self::TradeExecuted(t) => Some(&t.account_id),
            Self::AccountUpdated(f) => Some(&f.account_id),
            Self::TimerExpired { account_id, .. } => Some(account_id),
            Self::LockoutReleased { account_id, .. } => Some(account_id),
            Self::MarketDataUpdated(_) | Self::ScheduledReset { .. } | Self::Tick { .. } => None,
        }
    }

    /// The symbol this event concerns, when there is one.
    pub fn symbol(&self) -> Option<&str> {
        match self {
            Self::PositionOpened(p) | Self::PositionUpdated(p) | Self::PositionClosed(p) => {
                Some(&p.symbol)
            }
            Self::OrderPlaced(o) | Self::OrderFilled(o) | Self::OrderCancelled(o) => {
                Some(&o.symbol)
            }
            Self::TradeExecuted(t) => Some(&t.symbol),
            Self::MarketDataUpdated(q) => Some(&q.symbol),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Verdicts
// ---------------------------------------------------------------------------

/// Order-placement suggestion emitted by the trade-management rule. Never
/// enforces anything; the dispatcher forwards it to the broker as a plain
/// order command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AutomationAction {
    PlaceStop { symbol: Symbol, side: Side, size: i64, stop_price: Decimal },
    PlaceTakeProfit { symbol: Symbol, side: Side, size: i64, tp_price: Decimal },
    PlaceBracket {
        symbol: Symbol,
        side: Side,
        size: i64,
        stop_price: Decimal,
        tp_price: Decimal,
    },
    AdjustTrailingStop { symbol: Symbol, new_stop_price: Decimal },
}

/// The outcome of evaluating one rule against one event. The dispatcher
/// merges all verdicts produced for an event before acting.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Non-enforcing order suggestion (trade management only).
    Automation(AutomationAction),
    /// Close the named position in full. No lockout.
    ClosePosition { symbol: Symbol, reason: String },
    /// Partially close the named position down to `target_size` contracts.
    ReduceToLimit { symbol: Symbol, target_size: i64, reason: String },
    /// Cancel a working order.
    RejectOrder { order_id: String, reason: String },
    /// Hard enforcement: for `LockScope::Account`, flatten everything and
    /// lock the account; for `LockScope::Symbol`, close that symbol and
    /// install a symbol-scoped lockout.
    FlattenAndLock { scope: LockScope, release: ReleaseSpec, reason: String },
    /// Start a cooldown timer; `flatten` additionally closes all open
    /// positions (loss cooldown does, trade frequency does not).
    FlattenAndCooldown { tag: String, duration: Duration, flatten: bool, reason: String },
}

impl Verdict {
    /// One-line summary for logs and the audit trail.
    pub fn summary(&self) -> String {
        match self {
            Self::Automation(a) => format!("automation: {a:?}"),
            Self::ClosePosition { symbol, reason } => {
                format!("close {symbol}: {reason}")
            }
            Self::ReduceToLimit { symbol, target_size, reason } => {
                format!("reduce {symbol} to {target_size}: {reason}")
            }
            Self::RejectOrder { order_id, reason } => {
                format!("reject order {order_id}: {reason}")
            }
            Self::FlattenAndLock { scope, release, reason } => {
                format!("flatten+lock [{scope}] ({release}): {reason}")
            }
            Self::FlattenAndCooldown { tag, duration, flatten, reason } => {
                format!(
                    "cooldown '{tag}' {}s flatten={flatten}: {reason}",
                    duration.as_secs()
                )
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
