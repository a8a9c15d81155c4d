//! Alpaca 适配器（股票）
//!
//! 静态 key/secret 头部鉴权，无 token 生命周期；paper 与 live
//! 通过 base url 区分，行情走独立的 data 域名。

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};
use tracing::debug;

use crate::time_util;
use crate::trading::ingest::TradeAction;

use super::{
    BrokerAdapter, BrokerKind, BrokerPosition, ExecutionError, Order, OrderReport, OrderStatus,
    OrderType, PlaceOrderParams, Quote, TradeMode, BROKER_CALL_TIMEOUT_SECS,
};

/// Alpaca 适配器
pub struct AlpacaAdapter {
    client: Client,
    base_url: String,
    data_url: String,
    api_key: String,
    api_secret: String,
    paper: bool,
    symbol_map: HashMap<String, String>,
}

impl AlpacaAdapter {
    pub fn new(paper: bool) -> anyhow::Result<Self> {
        let base_url = if paper {
            env::var("ALPACA_PAPER_URL")
                .unwrap_or_else(|_| "https://paper-api.alpaca.markets".to_string())
        } else {
            env::var("ALPACA_LIVE_URL").unwrap_or_else(|_| "https://api.alpaca.markets".to_string())
        };
        Ok(Self {
            client: Client::builder()
                .timeout(Duration::from_secs(BROKER_CALL_TIMEOUT_SECS))
                .build()?,
            base_url,
            data_url: env::var("ALPACA_DATA_URL")
                .unwrap_or_else(|_| "https://data.alpaca.markets".to_string()),
            api_key: env::var("ALPACA_API_KEY").unwrap_or_default(),
            api_secret: env::var("ALPACA_API_SECRET").unwrap_or_default(),
            paper,
            symbol_map: env::var("ALPACA_SYMBOL_MAP")
                .ok()
                .and_then(|raw| serde_json::from_str(&raw).ok())
                .unwrap_or_default(),
        })
    }

    fn map_symbol(&self, symbol: &str) -> String {
        self.symbol_map
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| symbol.to_string())
    }

    /// key/secret 是静态凭证，没有刷新语义；401 直接判鉴权失败
    async fn send(
        &self,
        method: Method,
        url: String,
        body: Option<Value>,
    ) -> Result<(StatusCode, String), ExecutionError> {
        let mut builder = self
            .client
            .request(method.clone(), &url)
            .header("APCA-API-KEY-ID", &self.api_key)
            .header("APCA-API-SECRET-KEY", &self.api_secret);
        if let Some(ref b) = body {
            builder = builder.json(b);
        }
        let resp = builder.send().await.map_err(ExecutionError::from)?;
        let status = resp.status();
        let text = resp.text().await.map_err(ExecutionError::from)?;
        debug!("alpaca {} {} -> {}", method, url, status);
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ExecutionError::AuthenticationFailed(text));
        }
        Ok((status, text))
    }

    fn map_status(state: &str) -> OrderStatus {
        match state {
            "new" | "accepted" | "pending_new" => OrderStatus::Working,
            "filled" => OrderStatus::Filled,
            "rejected" => OrderStatus::Rejected,
            "canceled" | "expired" => OrderStatus::Cancelled,
            "partially_filled" => OrderStatus::Working,
            _ => OrderStatus::Unknown,
        }
    }
}

#[async_trait]
impl BrokerAdapter for AlpacaAdapter {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Alpaca
    }

    async fn authenticate(&self) -> Result<(), ExecutionError> {
        let url = format!("{}/v2/account", self.base_url);
        let (status, text) = self.send(Method::GET, url, None).await?;
        if !status.is_success() {
            return Err(ExecutionError::AuthenticationFailed(format!(
                "http {}: {}",
                status, text
            )));
        }
        Ok(())
    }

    async fn get_quote(&self, symbol: &str) -> Result<Quote, ExecutionError> {
        let native = self.map_symbol(symbol);
        let url = format!("{}/v2/stocks/{}/quotes/latest", self.data_url, native);
        let (status, text) = self.send(Method::GET, url, None).await?;
        if !status.is_success() {
            return Err(ExecutionError::Transport(format!(
                "alpaca quote http {}: {}",
                status, text
            )));
        }
        let v: Value = serde_json::from_str(&text)
            .map_err(|e| ExecutionError::Transport(e.to_string()))?;
        let q = &v["quote"];
        let bid = q["bp"].as_f64().unwrap_or(0.0);
        let ask = q["ap"].as_f64().unwrap_or(0.0);
        Ok(Quote {
            symbol: symbol.to_string(),
            bid,
            ask,
            last: (bid + ask) / 2.0,
            timestamp: time_util::now_timestamp_mills(),
        })
    }

    async fn place_order(&self, params: PlaceOrderParams) -> Result<Order, ExecutionError> {
        let native = self.map_symbol(&params.symbol);
        let side = match params.side {
            TradeAction::Buy => "buy",
            TradeAction::Sell | TradeAction::Close => "sell",
        };
        let body = json!({
            "symbol": native,
            "qty": params.quantity.to_string(),
            "side": side,
            "type": match params.order_type {
                OrderType::Market => "market",
                OrderType::Limit => "limit",
            },
            "limit_price": params.price.map(|p| p.to_string()),
            "time_in_force": "day",
            "client_order_id": params.client_order_id,
        });
        let url = format!("{}/v2/orders", self.base_url);
        let (status, text) = self.send(Method::POST, url, Some(body)).await?;
        if !status.is_success() {
            let v: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
            let reason = v["message"]
                .as_str()
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("http {}: {}", status, text));
            return Err(ExecutionError::OrderRejected(reason));
        }
        let v: Value = serde_json::from_str(&text)
            .map_err(|e| ExecutionError::Transport(e.to_string()))?;
        let order_id = v["id"]
            .as_str()
            .ok_or_else(|| ExecutionError::Transport("missing order id".to_string()))?
            .to_string();

        Ok(Order {
            order_id,
            client_order_id: params.client_order_id,
            account_id: params.account_id,
            symbol: params.symbol,
            action: params.side,
            quantity: params.quantity,
            order_type: params.order_type,
            status: Self::map_status(v["status"].as_str().unwrap_or("new")),
            fill_price: v["filled_avg_price"]
                .as_str()
                .and_then(|s| s.parse::<f64>().ok()),
            commission: None,
            mode: if self.paper {
                TradeMode::Paper
            } else {
                TradeMode::Live
            },
            created_at: time_util::now_timestamp_mills(),
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), ExecutionError> {
        let url = format!("{}/v2/orders/{}", self.base_url, order_id);
        let (status, text) = self.send(Method::DELETE, url, None).await?;
        if !status.is_success() {
            return Err(ExecutionError::OrderRejected(format!(
                "cancel http {}: {}",
                status, text
            )));
        }
        Ok(())
    }

    async fn get_balance(&self, _account_id: &str) -> Result<f64, ExecutionError> {
        let url = format!("{}/v2/account", self.base_url);
        let (status, text) = self.send(Method::GET, url, None).await?;
        if !status.is_success() {
            return Err(ExecutionError::Transport(format!(
                "balance http {}: {}",
                status, text
            )));
        }
        let v: Value = serde_json::from_str(&text)
            .map_err(|e| ExecutionError::Transport(e.to_string()))?;
        Ok(v["cash"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0))
    }

    async fn get_positions(
        &self,
        _account_id: &str,
    ) -> Result<Vec<BrokerPosition>, ExecutionError> {
        let url = format!("{}/v2/positions", self.base_url);
        let (status, text) = self.send(Method::GET, url, None).await?;
        if !status.is_success() {
            return Err(ExecutionError::Transport(format!(
                "positions http {}: {}",
                status, text
            )));
        }
        let v: Vec<Value> = serde_json::from_str(&text)
            .map_err(|e| ExecutionError::Transport(e.to_string()))?;
        Ok(v.into_iter()
            .map(|p| BrokerPosition {
                symbol: p["symbol"].as_str().unwrap_or_default().to_string(),
                quantity: p["qty"]
                    .as_str()
                    .and_then(|s| s.parse::<f64>().ok())
                    .unwrap_or(0.0),
                avg_price: p["avg_entry_price"]
                    .as_str()
                    .and_then(|s| s.parse::<f64>().ok())
                    .unwrap_or(0.0),
            })
            .collect())
    }

    async fn get_order_report(&self, order_id: &str) -> Result<OrderReport, ExecutionError> {
        let url = format!("{}/v2/orders/{}", self.base_url, order_id);
        let (status, text) = self.send(Method::GET, url, None).await?;
        if !status.is_success() {
            return Err(ExecutionError::Transport(format!(
                "order status http {}: {}",
                status, text
            )));
        }
        let v: Value = serde_json::from_str(&text)
            .map_err(|e| ExecutionError::Transport(e.to_string()))?;
        // filled_avg_price / filled_qty 以字符串返回
        let parse = |key: &str| v[key].as_str().and_then(|s| s.parse::<f64>().ok());
        let order_status = Self::map_status(v["status"].as_str().unwrap_or(""));
        let terminal = order_status == OrderStatus::Filled;
        Ok(OrderReport {
            order_id: order_id.to_string(),
            status: order_status,
            fill_price: terminal.then(|| parse("filled_avg_price")).flatten(),
            filled_quantity: terminal.then(|| parse("filled_qty")).flatten(),
        })
    }
}
