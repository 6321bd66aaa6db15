// =============================================================================
// Broker boundary - the narrow surface between the engine and the gateway
// =============================================================================
//
// The engine only ever issues the five command shapes below and only ever
// consumes the normalized events the feed adapter produces. Everything
// gateway-specific (auth, endpoints, frame shapes) stays inside this module.
// =============================================================================

pub mod client;
pub mod contract;
pub mod feed;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::types::{OrderKind, Side};

/// Commands the enforcement dispatcher may issue. Implemented by the live
/// gateway client and by test doubles.
#[async_trait]
pub trait BrokerCommands: Send + Sync {
    /// Close every open position for the account.
    async fn close_all_positions(&self, account: &str) -> Result<()>;

    /// Close the account's position in one symbol.
    async fn close_position(&self, account: &str, symbol: &str) -> Result<()>;

    /// Reduce the account's position in one symbol to `target_size`
    /// contracts (absolute).
    async fn partial_close_position(
        &self,
        account: &str,
        symbol: &str,
        target_size: i64,
    ) -> Result<()>;

    /// Cancel every working order for the account.
    async fn cancel_all_orders(&self, account: &str) -> Result<()>;

    /// Cancel one working order.
    async fn cancel_order(&self, account: &str, order_id: &str) -> Result<()>;

    /// Place an order (used for trade-management automations).
    async fn place_order(
        &self,
        account: &str,
        symbol: &str,
        kind: OrderKind,
        side: Side,
        size: i64,
        price: Option<Decimal>,
    ) -> Result<()>;
}
