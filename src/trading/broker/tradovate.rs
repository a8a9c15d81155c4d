//! Tradovate 适配器（期货）
//!
//! 凭证式鉴权：POST accesstokenrequest 换取带过期时间的 access token，
//! 临期前透明刷新；demo 与 live 走不同 base url。

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::time_util;
use crate::trading::ingest::TradeAction;

use super::{
    BrokerAdapter, BrokerKind, BrokerPosition, ExecutionError, Order, OrderReport, OrderStatus,
    OrderType, PlaceOrderParams, Quote, TradeMode, BROKER_CALL_TIMEOUT_SECS,
};

/// token 提前刷新余量（毫秒）
const TOKEN_REFRESH_MARGIN_MS: i64 = 60_000;

#[derive(Debug, Clone)]
struct TokenState {
    access_token: String,
    expires_at: i64,
}

#[derive(Deserialize)]
struct AccessTokenResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "expirationTime")]
    expiration_time: String,
    #[serde(rename = "errorText")]
    error_text: Option<String>,
}

#[derive(Deserialize)]
struct TradovateOrderResponse {
    #[serde(rename = "orderId")]
    order_id: Option<i64>,
    #[serde(rename = "failureReason")]
    failure_reason: Option<String>,
    #[serde(rename = "failureText")]
    failure_text: Option<String>,
}

/// Tradovate 适配器
pub struct TradovateAdapter {
    client: Client,
    base_url: String,
    username: String,
    password: String,
    app_id: String,
    cid: String,
    sec: String,
    /// 是否 demo 环境（模拟通道）
    demo: bool,
    /// 本地符号 -> 券商合约代码（如 "ES" -> "ESZ5"）
    symbol_map: HashMap<String, String>,
    token: RwLock<Option<TokenState>>,
}

impl TradovateAdapter {
    pub fn new(demo: bool) -> anyhow::Result<Self> {
        let base_url = if demo {
            env::var("TRADOVATE_DEMO_URL")
                .unwrap_or_else(|_| "https://demo.tradovateapi.com/v1".to_string())
        } else {
            env::var("TRADOVATE_LIVE_URL")
                .unwrap_or_else(|_| "https://live.tradovateapi.com/v1".to_string())
        };
        Ok(Self {
            client: Client::builder()
                .timeout(Duration::from_secs(BROKER_CALL_TIMEOUT_SECS))
                .build()?,
            base_url,
            username: env::var("TRADOVATE_USERNAME").unwrap_or_default(),
            password: env::var("TRADOVATE_PASSWORD").unwrap_or_default(),
            app_id: env::var("TRADOVATE_APP_ID").unwrap_or_else(|_| "signal_trader".to_string()),
            cid: env::var("TRADOVATE_CID").unwrap_or_default(),
            sec: env::var("TRADOVATE_SECRET").unwrap_or_default(),
            demo,
            symbol_map: Self::load_symbol_map(),
            token: RwLock::new(None),
        })
    }

    /// 符号映射：TRADOVATE_SYMBOL_MAP 为 JSON 对象，未配置时恒等映射
    fn load_symbol_map() -> HashMap<String, String> {
        env::var("TRADOVATE_SYMBOL_MAP")
            .ok()
            .and_then(|raw| serde_json::from_str::<HashMap<String, String>>(&raw).ok())
            .unwrap_or_default()
    }

    fn map_symbol(&self, symbol: &str) -> String {
        self.symbol_map
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| symbol.to_string())
    }

    /// 确保持有未临期的 token；force 时无条件重新鉴权
    async fn ensure_token(&self, force: bool) -> Result<String, ExecutionError> {
        if !force {
            let guard = self.token.read().await;
            if let Some(state) = guard.as_ref() {
                if state.expires_at - TOKEN_REFRESH_MARGIN_MS > time_util::now_timestamp_mills() {
                    return Ok(state.access_token.clone());
                }
            }
        }

        let url = format!("{}/auth/accesstokenrequest", self.base_url);
        let body = json!({
            "name": self.username,
            "password": self.password,
            "appId": self.app_id,
            "appVersion": "1.0",
            "cid": self.cid,
            "sec": self.sec,
        });
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(ExecutionError::from)?;
        let status = resp.status();
        let text = resp.text().await.map_err(ExecutionError::from)?;
        if !status.is_success() {
            return Err(ExecutionError::AuthenticationFailed(format!(
                "tradovate auth http {}: {}",
                status, text
            )));
        }
        let parsed: AccessTokenResponse = serde_json::from_str(&text)
            .map_err(|e| ExecutionError::AuthenticationFailed(e.to_string()))?;
        if let Some(err) = parsed.error_text {
            return Err(ExecutionError::AuthenticationFailed(err));
        }
        let expires_at = chrono::DateTime::parse_from_rfc3339(&parsed.expiration_time)
            .map(|t| t.timestamp_millis())
            .unwrap_or_else(|_| time_util::now_timestamp_mills() + 60 * 60 * 1000);

        let mut guard = self.token.write().await;
        *guard = Some(TokenState {
            access_token: parsed.access_token.clone(),
            expires_at,
        });
        info!(demo = self.demo, "tradovate token refreshed");
        Ok(parsed.access_token)
    }

    /// 带鉴权的请求：401 时强制刷新 token 重试一次，仍失败即上报
    async fn send_authed(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<(StatusCode, String), ExecutionError> {
        let mut token = self.ensure_token(false).await?;
        for attempt in 0..2 {
            let url = format!("{}{}", self.base_url, path);
            let mut builder = self
                .client
                .request(method.clone(), &url)
                .bearer_auth(&token)
                .header("Content-Type", "application/json");
            if let Some(ref b) = body {
                builder = builder.json(b);
            }
            let resp = builder.send().await.map_err(ExecutionError::from)?;
            let status = resp.status();
            let text = resp.text().await.map_err(ExecutionError::from)?;
            debug!("tradovate {} {} -> {}", method, path, status);

            if status == StatusCode::UNAUTHORIZED && attempt == 0 {
                warn!("tradovate 401, re-authenticating once");
                token = self.ensure_token(true).await?;
                continue;
            }
            if status == StatusCode::UNAUTHORIZED {
                return Err(ExecutionError::AuthenticationFailed(text));
            }
            return Ok((status, text));
        }
        unreachable!("auth retry loop exits via return")
    }

    fn map_status(state: &str) -> OrderStatus {
        match state {
            "Pending" | "PendingNew" => OrderStatus::Pending,
            "Working" | "Accepted" => OrderStatus::Working,
            "Filled" | "Completed" => OrderStatus::Filled,
            "Rejected" => OrderStatus::Rejected,
            "Canceled" | "Cancelled" | "Expired" => OrderStatus::Cancelled,
            _ => OrderStatus::Unknown,
        }
    }
}

#[async_trait]
impl BrokerAdapter for TradovateAdapter {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Tradovate
    }

    async fn authenticate(&self) -> Result<(), ExecutionError> {
        self.ensure_token(true).await.map(|_| ())
    }

    async fn get_quote(&self, symbol: &str) -> Result<Quote, ExecutionError> {
        let native = self.map_symbol(symbol);
        let path = format!("/md/getQuote?symbol={}", native);
        let (status, text) = self.send_authed(Method::GET, &path, None).await?;
        if !status.is_success() {
            return Err(ExecutionError::Transport(format!(
                "tradovate quote http {}: {}",
                status, text
            )));
        }
        let v: Value = serde_json::from_str(&text)
            .map_err(|e| ExecutionError::Transport(e.to_string()))?;
        let entries = &v["entries"];
        let bid = entries["Bid"]["price"].as_f64().unwrap_or(0.0);
        let ask = entries["Offer"]["price"].as_f64().unwrap_or(0.0);
        let last = entries["Trade"]["price"].as_f64().unwrap_or((bid + ask) / 2.0);
        Ok(Quote {
            symbol: symbol.to_string(),
            bid,
            ask,
            last,
            timestamp: time_util::now_timestamp_mills(),
        })
    }

    async fn place_order(&self, params: PlaceOrderParams) -> Result<Order, ExecutionError> {
        let native = self.map_symbol(&params.symbol);
        let action = match params.side {
            TradeAction::Buy => "Buy",
            // close 在路由层已换算为反向动作，这里只认买卖
            TradeAction::Sell | TradeAction::Close => "Sell",
        };
        let body = json!({
            "accountSpec": self.username,
            "accountId": params.account_id,
            "action": action,
            "symbol": native,
            "orderQty": params.quantity,
            "orderType": match params.order_type {
                OrderType::Market => "Market",
                OrderType::Limit => "Limit",
            },
            "price": params.price,
            "isAutomated": true,
            "clOrdId": params.client_order_id,
        });
        let (status, text) = self
            .send_authed(Method::POST, "/order/placeorder", Some(body))
            .await?;
        if !status.is_success() {
            return Err(ExecutionError::OrderRejected(format!(
                "http {}: {}",
                status, text
            )));
        }
        let parsed: TradovateOrderResponse = serde_json::from_str(&text)
            .map_err(|e| ExecutionError::Transport(e.to_string()))?;
        if let Some(reason) = parsed.failure_reason {
            let detail = parsed.failure_text.unwrap_or_default();
            return Err(ExecutionError::OrderRejected(format!(
                "{}: {}",
                reason, detail
            )));
        }
        let order_id = parsed
            .order_id
            .ok_or_else(|| ExecutionError::Transport("missing orderId".to_string()))?;

        Ok(Order {
            order_id: order_id.to_string(),
            client_order_id: params.client_order_id,
            account_id: params.account_id,
            symbol: params.symbol,
            action: params.side,
            quantity: params.quantity,
            order_type: params.order_type,
            status: OrderStatus::Working,
            fill_price: None,
            commission: None,
            mode: if self.demo {
                TradeMode::Paper
            } else {
                TradeMode::Live
            },
            created_at: time_util::now_timestamp_mills(),
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), ExecutionError> {
        let body = json!({ "orderId": order_id.parse::<i64>().unwrap_or_default() });
        let (status, text) = self
            .send_authed(Method::POST, "/order/cancelorder", Some(body))
            .await?;
        if !status.is_success() {
            return Err(ExecutionError::OrderRejected(format!(
                "cancel http {}: {}",
                status, text
            )));
        }
        Ok(())
    }

    async fn get_balance(&self, account_id: &str) -> Result<f64, ExecutionError> {
        let path = format!("/cashBalance/getcashbalancesnapshot?accountId={}", account_id);
        let (status, text) = self.send_authed(Method::GET, &path, None).await?;
        if !status.is_success() {
            return Err(ExecutionError::Transport(format!(
                "balance http {}: {}",
                status, text
            )));
        }
        let v: Value = serde_json::from_str(&text)
            .map_err(|e| ExecutionError::Transport(e.to_string()))?;
        Ok(v["totalCashValue"].as_f64().unwrap_or(0.0))
    }

    async fn get_positions(
        &self,
        account_id: &str,
    ) -> Result<Vec<BrokerPosition>, ExecutionError> {
        let (status, text) = self
            .send_authed(Method::GET, "/position/list", None)
            .await?;
        if !status.is_success() {
            return Err(ExecutionError::Transport(format!(
                "positions http {}: {}",
                status, text
            )));
        }
        let v: Vec<Value> = serde_json::from_str(&text)
            .map_err(|e| ExecutionError::Transport(e.to_string()))?;
        Ok(v.into_iter()
            .filter(|p| p["accountId"].as_str() == Some(account_id)
                || p["accountId"].as_i64().map(|i| i.to_string()).as_deref() == Some(account_id))
            .map(|p| BrokerPosition {
                symbol: p["contractName"].as_str().unwrap_or_default().to_string(),
                quantity: p["netPos"].as_f64().unwrap_or(0.0),
                avg_price: p["netPrice"].as_f64().unwrap_or(0.0),
            })
            .collect())
    }

    async fn get_order_report(&self, order_id: &str) -> Result<OrderReport, ExecutionError> {
        let path = format!("/order/item?id={}", order_id);
        let (status, text) = self.send_authed(Method::GET, &path, None).await?;
        if !status.is_success() {
            return Err(ExecutionError::Transport(format!(
                "order status http {}: {}",
                status, text
            )));
        }
        let v: Value = serde_json::from_str(&text)
            .map_err(|e| ExecutionError::Transport(e.to_string()))?;
        let order_status = Self::map_status(v["ordStatus"].as_str().unwrap_or(""));
        let terminal = order_status == OrderStatus::Filled;
        Ok(OrderReport {
            order_id: order_id.to_string(),
            status: order_status,
            fill_price: terminal.then(|| v["avgPx"].as_f64()).flatten(),
            filled_quantity: terminal.then(|| v["cumQty"].as_f64()).flatten(),
        })
    }
}
