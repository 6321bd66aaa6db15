// =============================================================================
// Gateway REST Client - outbound enforcement commands
// =============================================================================
//
// SECURITY: the API key is used once to obtain a session token and is never
// logged. All subsequent requests carry the bearer token; a 401 drops the
// cached token so the next call re-authenticates.
// =============================================================================

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::BrokerCommands;
use crate::types::{OrderKind, Side};

/// Per-request timeout for the underlying HTTP client.
const HTTP_TIMEOUT_SECS: u64 = 10;

/// REST client for the prop-firm gateway.
pub struct GatewayClient {
    base_url: String,
    username: String,
    api_key: String,
    token: RwLock<Option<String>>,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandResponse {
    success: bool,
    #[serde(default)]
    error_message: Option<String>,
}

impl GatewayClient {
    /// Create a new client. `base_url` has no trailing slash.
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");
        Self {
            base_url: base_url.into(),
            username: username.into(),
            api_key: api_key.into(),
            token: RwLock::new(None),
            client,
        }
    }

    /// Exchange the API key for a session token.
    pub async fn login(&self) -> Result<String> {
        let url = format!("{}/api/auth/login-key", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "userName": self.username, "apiKey": self.api_key }))
            .send()
            .await
            .context("gateway login request failed")?
            .error_for_status()
            .context("gateway login rejected")?;
        let login: LoginResponse =
            response.json().await.context("gateway login response malformed")?;
        *self.token.write() = Some(login.token.clone());
        debug!("gateway session token refreshed");
        Ok(login.token)
    }

    /// The current session token, if we hold one. The feed task uses it to
    /// authenticate its websocket connection.
    pub fn session_token(&self) -> Option<String> {
        self.token.read().clone()
    }

    async fn ensure_token(&self) -> Result<String> {
        if let Some(token) = self.token.read().clone() {
            return Ok(token);
        }
        self.login().await
    }

    /// POST a command body, re-authenticating once on a 401.
    async fn post_command(&self, path: &str, body: serde_json::Value) -> Result<()> {
        let url = format!("{}{path}", self.base_url);
        for fresh_login in [false, true] {
            let token = if fresh_login { self.login().await? } else { self.ensure_token().await? };
            let response = self
                .client
                .post(&url)
                .bearer_auth(&token)
                .json(&body)
                .send()
                .await
                .with_context(|| format!("gateway request {path} failed"))?;

            if response.status() == reqwest::StatusCode::UNAUTHORIZED && !fresh_login {
                warn!(path, "gateway session expired; re-authenticating");
                *self.token.write() = None;
                continue;
            }

            let response = response
                .error_for_status()
                .with_context(|| format!("gateway rejected {path}"))?;
            let outcome: CommandResponse =
                response.json().await.with_context(|| format!("bad response from {path}"))?;
            if !outcome.success {
                bail!(
                    "gateway refused {path}: {}",
                    outcome.error_message.unwrap_or_else(|| "no detail".into())
                );
            }
            return Ok(());
        }
        unreachable!("second attempt either returns or errors")
    }
}

fn kind_str(kind: OrderKind) -> &'static str {
    match kind {
        OrderKind::Market => "market",
        OrderKind::Limit => "limit",
        OrderKind::Stop => "stop",
        OrderKind::TakeProfit => "take_profit",
    }
}

fn side_str(side: Side) -> &'static str {
    match side {
        Side::Buy => "buy",
        Side::Sell => "sell",
    }
}

#[async_trait]
impl BrokerCommands for GatewayClient {
    async fn close_all_positions(&self, account: &str) -> Result<()> {
        debug!(account, "close_all_positions");
        self.post_command("/api/position/close-all", json!({ "accountId": account })).await
    }

    async fn close_position(&self, account: &str, symbol: &str) -> Result<()> {
        debug!(account, symbol, "close_position");
        self.post_command(
            "/api/position/close",
            json!({ "accountId": account, "symbol": symbol }),
        )
        .await
    }

    async fn partial_close_position(
        &self,
        account: &str,
        symbol: &str,
        target_size: i64,
    ) -> Result<()> {
        debug!(account, symbol, target_size, "partial_close_position");
        self.post_command(
            "/api/position/partial-close",
            json!({ "accountId": account, "symbol": symbol, "targetSize": target_size }),
        )
        .await
    }

    async fn cancel_all_orders(&self, account: &str) -> Result<()> {
        debug!(account, "cancel_all_orders");
        self.post_command("/api/order/cancel-all", json!({ "accountId": account })).await
    }

    async fn cancel_order(&self, account: &str, order_id: &str) -> Result<()> {
        debug!(account, order_id, "cancel_order");
        self.post_command(
            "/api/order/cancel",
            json!({ "accountId": account, "orderId": order_id }),
        )
        .await
    }

    async fn place_order(
        &self,
        account: &str,
        symbol: &str,
        kind: OrderKind,
        side: Side,
        size: i64,
        price: Option<Decimal>,
    ) -> Result<()> {
        debug!(account, symbol, kind = kind_str(kind), side = side_str(side), size, "place_order");
        self.post_command(
            "/api/order/place",
            json!({
                "accountId": account,
                "symbol": symbol,
                "type": kind_str(kind),
                "side": side_str(side),
                "size": size,
                "price": price.map(|p| p.to_string()),
            }),
        )
        .await
    }
}
