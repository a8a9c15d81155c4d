//! 券商适配层
//!
//! 统一能力契约 {authenticate, get_quote, place_order, cancel_order,
//! get_balance, get_positions}，每个券商一个具体适配器。适配器之间
//! 用闭合枚举分发（一个变体对应一个券商），不做运行时反射。
//!
//! 公共约束：
//! - 凭证临期在调用前透明刷新；鉴权失败重试一次后即上报
//! - 券商侧拒单以 OrderRejected(reason) 暴露，不漏原始传输错误
//! - 每次调用有界超时，超时不等于失败，订单留在 pending 等对账

pub mod alpaca;
pub mod tastytrade;
pub mod tradovate;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::trading::ingest::TradeAction;

pub use alpaca::AlpacaAdapter;
pub use tastytrade::TastytradeAdapter;
pub use tradovate::TradovateAdapter;

/// 券商调用默认超时（秒）
pub const BROKER_CALL_TIMEOUT_SECS: u64 = 10;

/// 支持的券商
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// 期货
    Tradovate,
    /// 期权
    Tastytrade,
    /// 股票
    Alpaca,
}

impl std::fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerKind::Tradovate => write!(f, "tradovate"),
            BrokerKind::Tastytrade => write!(f, "tastytrade"),
            BrokerKind::Alpaca => write!(f, "alpaca"),
        }
    }
}

/// 执行错误
#[derive(Error, Debug)]
pub enum ExecutionError {
    /// 券商拒单（带券商侧原因）
    #[error("券商拒单: {0}")]
    OrderRejected(String),

    /// 鉴权失败（已重试一次）
    #[error("券商鉴权失败: {0}")]
    AuthenticationFailed(String),

    /// 调用超时：订单可能已被接受，交给对账流程，绝不当作失败
    #[error("券商调用超时（{0}s）")]
    BrokerTimeout(u64),

    /// 传输层错误
    #[error("传输错误: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for ExecutionError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ExecutionError::BrokerTimeout(BROKER_CALL_TIMEOUT_SECS)
        } else {
            ExecutionError::Transport(err.to_string())
        }
    }
}

/// 成交通道
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeMode {
    Live,
    Paper,
}

impl std::fmt::Display for TradeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeMode::Live => write!(f, "live"),
            TradeMode::Paper => write!(f, "paper"),
        }
    }
}

/// 订单类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

/// 订单生命周期状态
///
/// filled / rejected / cancelled 为终态；unknown 是对账耗尽重试后的
/// 人工审查标记，系统不得自行裁定成败
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Working,
    Filled,
    Rejected,
    Cancelled,
    Unknown,
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Working => "working",
            OrderStatus::Filled => "filled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// 订单
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub client_order_id: String,
    pub account_id: String,
    pub symbol: String,
    pub action: TradeAction,
    pub quantity: f64,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub fill_price: Option<f64>,
    pub commission: Option<f64>,
    pub mode: TradeMode,
    pub created_at: i64,
}

/// 成交回报
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: String,
    pub account_id: String,
    pub symbol: String,
    pub side: TradeAction,
    pub quantity: f64,
    pub fill_price: f64,
    pub commission: f64,
    /// 已实现盈亏（开仓单为 0，平仓单按开仓均价结算）
    pub realized_pnl: f64,
    pub mode: TradeMode,
    pub timestamp: i64,
}

/// 报价
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub timestamp: i64,
}

/// 券商侧持仓
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub quantity: f64,
    pub avg_price: f64,
}

/// 对账查询的回执：状态 + 终态成交要素
///
/// 券商确认成交后，fill_price / filled_quantity 用于事后结算，
/// 非终态时二者为 None
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderReport {
    pub order_id: String,
    pub status: OrderStatus,
    pub fill_price: Option<f64>,
    pub filled_quantity: Option<f64>,
}

/// 下单参数
#[derive(Debug, Clone)]
pub struct PlaceOrderParams {
    pub account_id: String,
    pub symbol: String,
    pub side: TradeAction,
    pub quantity: f64,
    pub order_type: OrderType,
    pub price: Option<f64>,
    pub client_order_id: String,
}

/// 券商能力契约
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    fn kind(&self) -> BrokerKind;

    /// 建立/刷新会话凭证
    async fn authenticate(&self) -> Result<(), ExecutionError>;

    async fn get_quote(&self, symbol: &str) -> Result<Quote, ExecutionError>;

    async fn place_order(&self, params: PlaceOrderParams) -> Result<Order, ExecutionError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), ExecutionError>;

    async fn get_balance(&self, account_id: &str) -> Result<f64, ExecutionError>;

    async fn get_positions(&self, account_id: &str)
        -> Result<Vec<BrokerPosition>, ExecutionError>;

    /// 查询订单回执（对账轮询用，终态带成交价/量）
    async fn get_order_report(&self, order_id: &str) -> Result<OrderReport, ExecutionError>;
}

/// 闭合的券商集合：一个变体一个券商，静态分发
pub enum Broker {
    Tradovate(TradovateAdapter),
    Tastytrade(TastytradeAdapter),
    Alpaca(AlpacaAdapter),
}

#[async_trait]
impl BrokerAdapter for Broker {
    fn kind(&self) -> BrokerKind {
        match self {
            Broker::Tradovate(a) => a.kind(),
            Broker::Tastytrade(a) => a.kind(),
            Broker::Alpaca(a) => a.kind(),
        }
    }

    async fn authenticate(&self) -> Result<(), ExecutionError> {
        match self {
            Broker::Tradovate(a) => a.authenticate().await,
            Broker::Tastytrade(a) => a.authenticate().await,
            Broker::Alpaca(a) => a.authenticate().await,
        }
    }

    async fn get_quote(&self, symbol: &str) -> Result<Quote, ExecutionError> {
        match self {
            Broker::Tradovate(a) => a.get_quote(symbol).await,
            Broker::Tastytrade(a) => a.get_quote(symbol).await,
            Broker::Alpaca(a) => a.get_quote(symbol).await,
        }
    }

    async fn place_order(&self, params: PlaceOrderParams) -> Result<Order, ExecutionError> {
        match self {
            Broker::Tradovate(a) => a.place_order(params).await,
            Broker::Tastytrade(a) => a.place_order(params).await,
            Broker::Alpaca(a) => a.place_order(params).await,
        }
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), ExecutionError> {
        match self {
            Broker::Tradovate(a) => a.cancel_order(order_id).await,
            Broker::Tastytrade(a) => a.cancel_order(order_id).await,
            Broker::Alpaca(a) => a.cancel_order(order_id).await,
        }
    }

    async fn get_balance(&self, account_id: &str) -> Result<f64, ExecutionError> {
        match self {
            Broker::Tradovate(a) => a.get_balance(account_id).await,
            Broker::Tastytrade(a) => a.get_balance(account_id).await,
            Broker::Alpaca(a) => a.get_balance(account_id).await,
        }
    }

    async fn get_positions(
        &self,
        account_id: &str,
    ) -> Result<Vec<BrokerPosition>, ExecutionError> {
        match self {
            Broker::Tradovate(a) => a.get_positions(account_id).await,
            Broker::Tastytrade(a) => a.get_positions(account_id).await,
            Broker::Alpaca(a) => a.get_positions(account_id).await,
        }
    }

    async fn get_order_report(&self, order_id: &str) -> Result<OrderReport, ExecutionError> {
        match self {
            Broker::Tradovate(a) => a.get_order_report(order_id).await,
            Broker::Tastytrade(a) => a.get_order_report(order_id).await,
            Broker::Alpaca(a) => a.get_order_report(order_id).await,
        }
    }
}
