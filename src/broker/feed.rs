// =============================================================================
// Gateway Event Feed - websocket frames normalized into risk events
// =============================================================================
//
// The gateway pushes duck-typed JSON frames; this adapter turns them into
// the tagged `RiskEvent` variants the engine consumes. Unknown frame kinds
// and unknown payload fields are ignored; a frame missing a required field
// is malformed and dropped with an audit record. Contract ids that do not
// parse are treated the same way.
//
// The connection is re-established after a 5 second pause on any error, in
// a loop that never exits.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::client::GatewayClient;
use super::contract::root_symbol;
use crate::audit::{Audit, KIND_MALFORMED};
use crate::bus::EventBus;
use crate::types::{
    AccountFlags, Order, OrderKind, OrderState, Position, Quote, RiskEvent, Side, Trade,
};

/// Pause between reconnect attempts.
const RECONNECT_DELAY_SECS: u64 = 5;

#[derive(Debug, Deserialize)]
struct Frame {
    event: String,
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionPayload {
    account_id: String,
    contract_id: String,
    size: i64,
    average_price: Decimal,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderPayload {
    account_id: String,
    order_id: String,
    contract_id: String,
    #[serde(rename = "type")]
    kind: String,
    side: String,
    size: i64,
    #[serde(default)]
    price: Option<Decimal>,
    status: String,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TradePayload {
    account_id: String,
    trade_id: String,
    contract_id: String,
    size: i64,
    price: Decimal,
    #[serde(default)]
    profit_and_loss: Option<Decimal>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuotePayload {
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    contract_id: Option<String>,
    last: Decimal,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountPayload {
    account_id: String,
    can_trade: bool,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

fn parse_side(raw: &str) -> Result<Side> {
    match raw.to_ascii_lowercase().as_str() {
        "buy" => Ok(Side::Buy),
        "sell" => Ok(Side::Sell),
        other => anyhow::bail!("unknown order side {other:?}"),
    }
}

fn parse_kind(raw: &str) -> Result<OrderKind> {
    match raw.to_ascii_lowercase().as_str() {
        "market" => Ok(OrderKind::Market),
        "limit" => Ok(OrderKind::Limit),
        "stop" => Ok(OrderKind::Stop),
        "take_profit" | "takeprofit" => Ok(OrderKind::TakeProfit),
        other => anyhow::bail!("unknown order type {other:?}"),
    }
}

fn parse_status(raw: &str) -> Result<OrderState> {
    match raw.to_ascii_lowercase().as_str() {
        "placed" | "working" | "open" => Ok(OrderState::Placed),
        "filled" => Ok(OrderState::Filled),
        "cancelled" | "canceled" => Ok(OrderState::Cancelled),
        other => anyhow::bail!("unknown order status {other:?}"),
    }
}

/// Normalize one raw frame. `Ok(None)` means a frame kind we deliberately
/// ignore (heartbeats etc); an error means the frame was malformed.
pub fn parse_frame(text: &str) -> Result<Option<RiskEvent>> {
    let frame: Frame = serde_json::from_str(text).context("frame is not an event envelope")?;
    let now = Utc::now();

    let event = match frame.event.as_str() {
        "position_update" => {
            let p: PositionPayload =
                serde_json::from_value(frame.data).context("bad position payload")?;
            let symbol = root_symbol(&p.contract_id)
                .with_context(|| format!("bad contract id {:?}", p.contract_id))?
                .to_string();
            RiskEvent::PositionUpdated(Position {
                account_id: p.account_id,
                symbol,
                contract_id: p.contract_id,
                size: p.size,
                average_price: p.average_price,
                opened_at: p.timestamp.unwrap_or(now),
            })
        }
        "order_update" => {
            let o: OrderPayload =
                serde_json::from_value(frame.data).context("bad order payload")?;
            let symbol = root_symbol(&o.contract_id)
                .with_context(|| format!("bad contract id {:?}", o.contract_id))?
                .to_string();
            let order = Order {
                order_id: o.order_id,
                account_id: o.account_id,
                symbol,
                kind: parse_kind(&o.kind)?,
                side: parse_side(&o.side)?,
                size: o.size,
                price: o.price,
                placed_at: o.timestamp.unwrap_or(now),
                state: parse_status(&o.status)?,
            };
            match order.state {
                OrderState::Placed => RiskEvent::OrderPlaced(order),
                OrderState::Filled => RiskEvent::OrderFilled(order),
                OrderState::Cancelled => RiskEvent::OrderCancelled(order),
            }
        }
        "trade_update" => {
            let t: TradePayload =
                serde_json::from_value(frame.data).context("bad trade payload")?;
            let symbol = root_symbol(&t.contract_id)
                .with_context(|| format!("bad contract id {:?}", t.contract_id))?
                .to_string();
            RiskEvent::TradeExecuted(Trade {
                trade_id: t.trade_id,
                account_id: t.account_id,
                symbol,
                size: t.size,
                price: t.price,
                realized_pnl: t.profit_and_loss,
                executed_at: t.timestamp.unwrap_or(now),
            })
        }
        "quote_update" => {
            let q: QuotePayload =
                serde_json::from_value(frame.data).context("bad quote payload")?;
            let symbol = match (&q.symbol, &q.contract_id) {
                (Some(symbol), _) => symbol.clone(),
                (None, Some(contract_id)) => root_symbol(contract_id)
                    .with_context(|| format!("bad contract id {contract_id:?}"))?
                    .to_string(),
                (None, None) => anyhow::bail!("quote without symbol or contract id"),
            };
            RiskEvent::MarketDataUpdated(Quote {
                symbol,
                last_price: q.last,
                ts: q.timestamp.unwrap_or(now),
            })
        }
        "account_update" => {
            let a: AccountPayload =
                serde_json::from_value(frame.data).context("bad account payload")?;
            RiskEvent::AccountUpdated(AccountFlags {
                account_id: a.account_id,
                can_trade: a.can_trade,
                updated_at: a.timestamp.unwrap_or(now),
            })
        }
        // Heartbeats and frame kinds we have no use for.
        _ => return Ok(None),
    };
    Ok(Some(event))
}

/// Run the feed forever: connect, pump frames into the bus, reconnect on
/// any failure.
pub async fn run_feed(
    ws_url: String,
    client: Arc<GatewayClient>,
    bus: Arc<EventBus>,
    audit: Arc<Audit>,
) {
    loop {
        if let Err(e) = pump(&ws_url, &client, &bus, &audit).await {
            error!(error = %e, "feed connection lost; reconnecting in {RECONNECT_DELAY_SECS}s");
        }
        tokio::time::sleep(std::time::Duration::from_secs(RECONNECT_DELAY_SECS)).await;
    }
}

async fn pump(
    ws_url: &str,
    client: &GatewayClient,
    bus: &EventBus,
    audit: &Audit,
) -> Result<()> {
    let token = match client.session_token() {
        Some(token) => token,
        None => client.login().await?,
    };
    let url = format!("{ws_url}?access_token={token}");
    let (stream, _) = connect_async(url.as_str()).await.context("feed connect failed")?;
    info!("feed connected");
    let (_, mut read) = stream.split();

    while let Some(message) = read.next().await {
        let message = message.context("feed read failed")?;
        let text = match message {
            Message::Text(text) => text,
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => anyhow::bail!("feed closed by gateway"),
            _ => continue,
        };

        match parse_frame(&text) {
            Ok(Some(event)) => route(bus, event).await,
            Ok(None) => debug!("ignored frame"),
            Err(e) => {
                warn!(error = %e, "malformed frame dropped");
                // The raw frame is the only state there is for a drop.
                audit.record("-", None, None, KIND_MALFORMED, &e.to_string(), Some(&text), None);
            }
        }
    }
    anyhow::bail!("feed stream ended")
}

async fn route(bus: &EventBus, event: RiskEvent) {
    match event.account_id().map(str::to_string) {
        Some(account) => bus.publish(&account, event).await,
        // Quotes are not account-scoped; every worker sees them.
        None => bus.broadcast(event).await,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn position_frame_parses() {
        let text = r#"{"event":"position_update","data":{
            "accountId":"PRAC-V2-126244","contractId":"CON.F.US.MNQ.U25",
            "size":-2,"averagePrice":"21010.25"}}"#;
        match parse_frame(text).unwrap().unwrap() {
            RiskEvent::PositionUpdated(p) => {
                assert_eq!(p.account_id, "PRAC-V2-126244");
                assert_eq!(p.symbol, "MNQ");
                assert_eq!(p.size, -2);
                assert_eq!(p.average_price, dec!(21010.25));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn trade_frame_keeps_null_pnl() {
        let text = r#"{"event":"trade_update","data":{
            "accountId":"A","tradeId":"t-9","contractId":"CON.F.US.ES.Z25",
            "size":1,"price":"5400.00","profitAndLoss":null}}"#;
        match parse_frame(text).unwrap().unwrap() {
            RiskEvent::TradeExecuted(t) => {
                assert_eq!(t.symbol, "ES");
                assert!(t.realized_pnl.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn trade_frame_with_pnl() {
        let text = r#"{"event":"trade_update","data":{
            "accountId":"A","tradeId":"t-9","contractId":"CON.F.US.ES.Z25",
            "size":1,"price":"5400.00","profitAndLoss":"-200.50"}}"#;
        match parse_frame(text).unwrap().unwrap() {
            RiskEvent::TradeExecuted(t) => assert_eq!(t.realized_pnl, Some(dec!(-200.50))),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn order_frame_maps_status_to_variant() {
        let text = r#"{"event":"order_update","data":{
            "accountId":"A","orderId":"o-1","contractId":"CON.F.US.MNQ.U25",
            "type":"stop","side":"sell","size":2,"price":"20990","status":"working"}}"#;
        match parse_frame(text).unwrap().unwrap() {
            RiskEvent::OrderPlaced(o) => {
                assert_eq!(o.kind, OrderKind::Stop);
                assert_eq!(o.side, Side::Sell);
                assert_eq!(o.state, OrderState::Placed);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn quote_frame_accepts_contract_id() {
        let text = r#"{"event":"quote_update","data":{
            "contractId":"CON.F.US.MNQ.U25","last":"21004.0"}}"#;
        match parse_frame(text).unwrap().unwrap() {
            RiskEvent::MarketDataUpdated(q) => {
                assert_eq!(q.symbol, "MNQ");
                assert_eq!(q.last_price, dec!(21004.0));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn account_frame_parses() {
        let text = r#"{"event":"account_update","data":{"accountId":"A","canTrade":false}}"#;
        match parse_frame(text).unwrap().unwrap() {
            RiskEvent::AccountUpdated(f) => assert!(!f.can_trade),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_required_field_is_malformed() {
        let text = r#"{"event":"position_update","data":{"accountId":"A","size":1}}"#;
        assert!(parse_frame(text).is_err());
    }

    #[test]
    fn bad_contract_id_is_malformed() {
        let text = r#"{"event":"position_update","data":{
            "accountId":"A","contractId":"MNQ","size":1,"averagePrice":"1"}}"#;
        assert!(parse_frame(text).is_err());
    }

    #[test]
    fn unknown_frame_kinds_are_ignored() {
        assert!(parse_frame(r#"{"event":"heartbeat","data":{}}"#).unwrap().is_none());
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let text = r#"{"event":"account_update","data":{
            "accountId":"A","canTrade":true,"balance":"50000","futureField":1}}"#;
        assert!(parse_frame(text).unwrap().is_some());
    }
}
