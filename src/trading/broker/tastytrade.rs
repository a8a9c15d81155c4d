//! Tastytrade 适配器（期权）
//!
//! 会话式鉴权：POST /sessions 换取 session-token，放在 Authorization
//! 头；sandbox 与 live 走不同 base url。

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::time_util;
use crate::trading::ingest::TradeAction;

use super::{
    BrokerAdapter, BrokerKind, BrokerPosition, ExecutionError, Order, OrderReport, OrderStatus,
    OrderType, PlaceOrderParams, Quote, TradeMode, BROKER_CALL_TIMEOUT_SECS,
};

/// 会话有效期按 24h 计，提前 5 分钟重建
const SESSION_TTL_MS: i64 = 24 * 60 * 60 * 1000;
const SESSION_REFRESH_MARGIN_MS: i64 = 5 * 60 * 1000;

struct SessionState {
    token: String,
    expires_at: i64,
}

/// Tastytrade 适配器
pub struct TastytradeAdapter {
    client: Client,
    base_url: String,
    login: String,
    password: String,
    sandbox: bool,
    symbol_map: HashMap<String, String>,
    session: RwLock<Option<SessionState>>,
}

impl TastytradeAdapter {
    pub fn new(sandbox: bool) -> anyhow::Result<Self> {
        let base_url = if sandbox {
            env::var("TASTYTRADE_SANDBOX_URL")
                .unwrap_or_else(|_| "https://api.cert.tastyworks.com".to_string())
        } else {
            env::var("TASTYTRADE_LIVE_URL")
                .unwrap_or_else(|_| "https://api.tastyworks.com".to_string())
        };
        Ok(Self {
            client: Client::builder()
                .timeout(Duration::from_secs(BROKER_CALL_TIMEOUT_SECS))
                .build()?,
            base_url,
            login: env::var("TASTYTRADE_LOGIN").unwrap_or_default(),
            password: env::var("TASTYTRADE_PASSWORD").unwrap_or_default(),
            sandbox,
            symbol_map: env::var("TASTYTRADE_SYMBOL_MAP")
                .ok()
                .and_then(|raw| serde_json::from_str(&raw).ok())
                .unwrap_or_default(),
            session: RwLock::new(None),
        })
    }

    fn map_symbol(&self, symbol: &str) -> String {
        self.symbol_map
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| symbol.to_string())
    }

    async fn ensure_session(&self, force: bool) -> Result<String, ExecutionError> {
        if !force {
            let guard = self.session.read().await;
            if let Some(s) = guard.as_ref() {
                if s.expires_at - SESSION_REFRESH_MARGIN_MS > time_util::now_timestamp_mills() {
                    return Ok(s.token.clone());
                }
            }
        }

        let url = format!("{}/sessions", self.base_url);
        let body = json!({
            "login": self.login,
            "password": self.password,
            "remember-me": true,
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
                "tastytrade session http {}: {}",
                status, text
            )));
        }
        let v: Value = serde_json::from_str(&text)
            .map_err(|e| ExecutionError::AuthenticationFailed(e.to_string()))?;
        let token = v["data"]["session-token"]
            .as_str()
            .ok_or_else(|| {
                ExecutionError::AuthenticationFailed("missing session-token".to_string())
            })?
            .to_string();

        let mut guard = self.session.write().await;
        *guard = Some(SessionState {
            token: token.clone(),
            expires_at: time_util::now_timestamp_mills() + SESSION_TTL_MS,
        });
        info!(sandbox = self.sandbox, "tastytrade session established");
        Ok(token)
    }

    async fn send_authed(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<(StatusCode, String), ExecutionError> {
        let mut token = self.ensure_session(false).await?;
        for attempt in 0..2 {
            let url = format!("{}{}", self.base_url, path);
            let mut builder = self
                .client
                .request(method.clone(), &url)
                .header("Authorization", &token)
                .header("Content-Type", "application/json");
            if let Some(ref b) = body {
                builder = builder.json(b);
            }
            let resp = builder.send().await.map_err(ExecutionError::from)?;
            let status = resp.status();
            let text = resp.text().await.map_err(ExecutionError::from)?;
            debug!("tastytrade {} {} -> {}", method, path, status);

            if status == StatusCode::UNAUTHORIZED && attempt == 0 {
                warn!("tastytrade 401, rebuilding session once");
                token = self.ensure_session(true).await?;
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
            "Received" | "Routed" => OrderStatus::Pending,
            "Live" | "In Flight" => OrderStatus::Working,
            "Filled" => OrderStatus::Filled,
            "Rejected" => OrderStatus::Rejected,
            "Cancelled" | "Canceled" | "Expired" => OrderStatus::Cancelled,
            _ => OrderStatus::Unknown,
        }
    }
}

#[async_trait]
impl BrokerAdapter for TastytradeAdapter {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Tastytrade
    }

    async fn authenticate(&self) -> Result<(), ExecutionError> {
        self.ensure_session(true).await.map(|_| ())
    }

    async fn get_quote(&self, symbol: &str) -> Result<Quote, ExecutionError> {
        let native = self.map_symbol(symbol);
        let path = format!("/market-data/{}", native);
        let (status, text) = self.send_authed(Method::GET, &path, None).await?;
        if !status.is_success() {
            return Err(ExecutionError::Transport(format!(
                "tastytrade quote http {}: {}",
                status, text
            )));
        }
        let v: Value = serde_json::from_str(&text)
            .map_err(|e| ExecutionError::Transport(e.to_string()))?;
        let data = &v["data"];
        let parse = |key: &str| {
            data[key]
                .as_str()
                .and_then(|s| s.parse::<f64>().ok())
                .or_else(|| data[key].as_f64())
                .unwrap_or(0.0)
        };
        let bid = parse("bid");
        let ask = parse("ask");
        let last = parse("last");
        Ok(Quote {
            symbol: symbol.to_string(),
            bid,
            ask,
            last: if last > 0.0 { last } else { (bid + ask) / 2.0 },
            timestamp: time_util::now_timestamp_mills(),
        })
    }

    async fn place_order(&self, params: PlaceOrderParams) -> Result<Order, ExecutionError> {
        let native = self.map_symbol(&params.symbol);
        let action = match params.side {
            TradeAction::Buy => "Buy to Open",
            TradeAction::Sell => "Sell to Open",
            TradeAction::Close => "Sell to Close",
        };
        let body = json!({
            "order-type": match params.order_type {
                OrderType::Market => "Market",
                OrderType::Limit => "Limit",
            },
            "time-in-force": "Day",
            "price": params.price,
            "legs": [{
                "instrument-type": "Equity Option",
                "symbol": native,
                "quantity": params.quantity,
                "action": action,
            }],
        });
        let path = format!("/accounts/{}/orders", params.account_id);
        let (status, text) = self.send_authed(Method::POST, &path, Some(body)).await?;
        if !status.is_success() {
            // tastytrade 把拒单原因放在 error.message
            let v: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
            let reason = v["error"]["message"]
                .as_str()
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("http {}: {}", status, text));
            return Err(ExecutionError::OrderRejected(reason));
        }
        let v: Value = serde_json::from_str(&text)
            .map_err(|e| ExecutionError::Transport(e.to_string()))?;
        let order_id = v["data"]["order"]["id"]
            .as_i64()
            .map(|i| i.to_string())
            .or_else(|| v["data"]["order"]["id"].as_str().map(|s| s.to_string()))
            .ok_or_else(|| ExecutionError::Transport("missing order id".to_string()))?;

        Ok(Order {
            order_id,
            client_order_id: params.client_order_id,
            account_id: params.account_id,
            symbol: params.symbol,
            action: params.side,
            quantity: params.quantity,
            order_type: params.order_type,
            status: Self::map_status(
                v["data"]["order"]["status"].as_str().unwrap_or("Received"),
            ),
            fill_price: None,
            commission: None,
            mode: if self.sandbox {
                TradeMode::Paper
            } else {
                TradeMode::Live
            },
            created_at: time_util::now_timestamp_mills(),
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), ExecutionError> {
        let account = env::var("TASTYTRADE_ACCOUNT").unwrap_or_default();
        let path = format!("/accounts/{}/orders/{}", account, order_id);
        let (status, text) = self.send_authed(Method::DELETE, &path, None).await?;
        if !status.is_success() {
            return Err(ExecutionError::OrderRejected(format!(
                "cancel http {}: {}",
                status, text
            )));
        }
        Ok(())
    }

    async fn get_balance(&self, account_id: &str) -> Result<f64, ExecutionError> {
        let path = format!("/accounts/{}/balances", account_id);
        let (status, text) = self.send_authed(Method::GET, &path, None).await?;
        if !status.is_success() {
            return Err(ExecutionError::Transport(format!(
                "balance http {}: {}",
                status, text
            )));
        }
        let v: Value = serde_json::from_str(&text)
            .map_err(|e| ExecutionError::Transport(e.to_string()))?;
        Ok(v["data"]["cash-balance"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .or_else(|| v["data"]["cash-balance"].as_f64())
            .unwrap_or(0.0))
    }

    async fn get_positions(
        &self,
        account_id: &str,
    ) -> Result<Vec<BrokerPosition>, ExecutionError> {
        let path = format!("/accounts/{}/positions", account_id);
        let (status, text) = self.send_authed(Method::GET, &path, None).await?;
        if !status.is_success() {
            return Err(ExecutionError::Transport(format!(
                "positions http {}: {}",
                status, text
            )));
        }
        let v: Value = serde_json::from_str(&text)
            .map_err(|e| ExecutionError::Transport(e.to_string()))?;
        let items = v["data"]["items"].as_array().cloned().unwrap_or_default();
        Ok(items
            .into_iter()
            .map(|p| BrokerPosition {
                symbol: p["symbol"].as_str().unwrap_or_default().to_string(),
                quantity: p["quantity"]
                    .as_str()
                    .and_then(|s| s.parse::<f64>().ok())
                    .or_else(|| p["quantity"].as_f64())
                    .unwrap_or(0.0),
                avg_price: p["average-open-price"]
                    .as_str()
                    .and_then(|s| s.parse::<f64>().ok())
                    .or_else(|| p["average-open-price"].as_f64())
                    .unwrap_or(0.0),
            })
            .collect())
    }

    async fn get_order_report(&self, order_id: &str) -> Result<OrderReport, ExecutionError> {
        let account = env::var("TASTYTRADE_ACCOUNT").unwrap_or_default();
        let path = format!("/accounts/{}/orders/{}", account, order_id);
        let (status, text) = self.send_authed(Method::GET, &path, None).await?;
        if !status.is_success() {
            return Err(ExecutionError::Transport(format!(
                "order status http {}: {}",
                status, text
            )));
        }
        let v: Value = serde_json::from_str(&text)
            .map_err(|e| ExecutionError::Transport(e.to_string()))?;
        let data = &v["data"];
        // 数值字段可能以字符串返回
        let parse = |key: &str| {
            data[key]
                .as_str()
                .and_then(|s| s.parse::<f64>().ok())
                .or_else(|| data[key].as_f64())
        };
        let order_status = Self::map_status(data["status"].as_str().unwrap_or(""));
        let terminal = order_status == OrderStatus::Filled;
        Ok(OrderReport {
            order_id: order_id.to_string(),
            status: order_status,
            fill_price: terminal.then(|| parse("average-fill-price")).flatten(),
            filled_quantity: terminal.then(|| parse("filled-quantity")).flatten(),
        })
    }
}
