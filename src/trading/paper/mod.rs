//! 内部模拟撮合器
//!
//! 模拟路由的兜底执行端：取参考行情价，套用确定性滑点模型
//! （基础滑点 + 规模冲击，有上界）与按品种类别的佣金表。
//! 模拟成交统一打 mode=paper 标，对绩效追踪与台账完全等价于实盘成交。

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::time_util;
use crate::trading::broker::{Fill, TradeMode};
use crate::trading::ingest::{OrderIntent, TradeAction};
use crate::trading::risk::contract_multiplier;
use crate::trading::router::SymbolClass;

/// 模拟器错误
#[derive(Error, Debug)]
pub enum PaperError {
    /// 模拟资金不足
    #[error("模拟资金不足: 需要 {required:.2}，可用 {available:.2}")]
    InsufficientSimulatedCapital { required: f64, available: f64 },

    /// 行情源不可用
    #[error("行情获取失败: {0}")]
    MarketData(String),

    /// 无持仓可平
    #[error("无持仓可平: {0}")]
    NoPositionToClose(String),
}

/// 行情源：任何能给出最新价的实现都可以接入
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn last_price(&self, symbol: &str) -> anyhow::Result<f64>;
}

/// 静态报价表（测试与离线环境）
pub struct StaticQuoteSource {
    prices: DashMap<String, f64>,
}

impl StaticQuoteSource {
    pub fn new() -> Self {
        Self {
            prices: DashMap::new(),
        }
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.prices.insert(symbol.to_string(), price);
    }
}

#[async_trait]
impl MarketDataSource for StaticQuoteSource {
    async fn last_price(&self, symbol: &str) -> anyhow::Result<f64> {
        self.prices
            .get(symbol)
            .map(|e| *e.value())
            .ok_or_else(|| anyhow::anyhow!("no quote for {}", symbol))
    }
}

/// 确定性滑点模型（基点）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlippageModel {
    /// 基础滑点
    pub base_bps: f64,
    /// 每张合约的规模冲击
    pub impact_bps_per_contract: f64,
    /// 滑点上界
    pub max_bps: f64,
}

impl Default for SlippageModel {
    fn default() -> Self {
        Self {
            base_bps: 1.0,
            impact_bps_per_contract: 0.25,
            max_bps: 10.0,
        }
    }
}

impl SlippageModel {
    /// 成交价：买单向上偏移，卖单向下偏移
    pub fn apply(&self, reference: f64, quantity: f64, is_buy: bool) -> f64 {
        let bps = (self.base_bps + self.impact_bps_per_contract * quantity).min(self.max_bps);
        let offset = reference * bps / 10_000.0;
        if is_buy {
            reference + offset
        } else {
            reference - offset
        }
    }
}

/// 佣金表（按品种类别）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommissionSchedule {
    /// 期货每张合约
    pub futures_per_contract: f64,
    /// 期权每张合约
    pub options_per_contract: f64,
    /// 股票每笔固定
    pub equities_flat: f64,
}

impl Default for CommissionSchedule {
    fn default() -> Self {
        Self {
            futures_per_contract: 2.25,
            options_per_contract: 1.0,
            equities_flat: 0.0,
        }
    }
}

impl CommissionSchedule {
    pub fn commission(&self, class: SymbolClass, quantity: f64) -> f64 {
        match class {
            SymbolClass::Futures => self.futures_per_contract * quantity,
            SymbolClass::Options => self.options_per_contract * quantity,
            SymbolClass::Equities => self.equities_flat,
            SymbolClass::Crypto => 0.0,
        }
    }
}

/// 模拟持仓
#[derive(Debug, Clone)]
struct SimPosition {
    quantity: f64,
    avg_price: f64,
    side: TradeAction,
}

/// 内部模拟撮合器
pub struct PaperTradingSimulator {
    balance: RwLock<f64>,
    positions: DashMap<String, SimPosition>,
    slippage: SlippageModel,
    commissions: CommissionSchedule,
    data: Arc<dyn MarketDataSource>,
}

impl PaperTradingSimulator {
    pub fn new(initial_balance: f64, data: Arc<dyn MarketDataSource>) -> Self {
        Self {
            balance: RwLock::new(initial_balance),
            positions: DashMap::new(),
            slippage: SlippageModel::default(),
            commissions: CommissionSchedule::default(),
            data,
        }
    }

    pub fn with_models(mut self, slippage: SlippageModel, commissions: CommissionSchedule) -> Self {
        self.slippage = slippage;
        self.commissions = commissions;
        self
    }

    pub async fn balance(&self) -> f64 {
        *self.balance.read().await
    }

    fn position_key(intent: &OrderIntent) -> String {
        format!("{}:{}", intent.strategy_id, intent.symbol)
    }

    /// 执行一笔模拟成交
    pub async fn execute(&self, intent: &OrderIntent) -> Result<Fill, PaperError> {
        let reference = match intent.requested_price {
            Some(px) => px,
            None => self
                .data
                .last_price(&intent.symbol)
                .await
                .map_err(|e| PaperError::MarketData(e.to_string()))?,
        };
        let class = SymbolClass::classify(&intent.symbol);
        let multiplier = contract_multiplier(class);
        let is_buy = intent.action == TradeAction::Buy;
        let fill_price = self.slippage.apply(reference, intent.quantity, is_buy);
        let commission = self.commissions.commission(class, intent.quantity);

        let mut balance = self.balance.write().await;
        let mut realized_pnl = 0.0;

        match intent.action {
            TradeAction::Buy | TradeAction::Sell => {
                let required = fill_price * intent.quantity * multiplier;
                // 只有买入占用新资金
                if is_buy && required > *balance {
                    return Err(PaperError::InsufficientSimulatedCapital {
                        required,
                        available: *balance,
                    });
                }
                let key = Self::position_key(intent);
                match self.positions.entry(key) {
                    dashmap::mapref::entry::Entry::Occupied(mut e) => {
                        let pos = e.get_mut();
                        let total = pos.quantity + intent.quantity;
                        pos.avg_price =
                            (pos.avg_price * pos.quantity + fill_price * intent.quantity) / total;
                        pos.quantity = total;
                    }
                    dashmap::mapref::entry::Entry::Vacant(v) => {
                        v.insert(SimPosition {
                            quantity: intent.quantity,
                            avg_price: fill_price,
                            side: intent.action,
                        });
                    }
                }
            }
            TradeAction::Close => {
                let key = Self::position_key(intent);
                let (_, pos) = self
                    .positions
                    .remove(&key)
                    .ok_or_else(|| PaperError::NoPositionToClose(intent.symbol.clone()))?;
                let direction = if pos.side == TradeAction::Buy { 1.0 } else { -1.0 };
                realized_pnl = (fill_price - pos.avg_price) * pos.quantity * multiplier * direction;
            }
        }

        *balance += realized_pnl - commission;

        let fill = Fill {
            order_id: Uuid::new_v4().to_string(),
            account_id: format!("SIM-{}", intent.account_group),
            symbol: intent.symbol.clone(),
            side: intent.action,
            quantity: intent.quantity,
            fill_price,
            commission,
            realized_pnl,
            mode: TradeMode::Paper,
            timestamp: time_util::now_timestamp_mills(),
        };
        info!(
            symbol = %fill.symbol,
            side = %fill.side,
            fill_price,
            commission,
            realized_pnl,
            "模拟成交"
        );
        Ok(fill)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent(action: TradeAction, symbol: &str, qty: f64, price: Option<f64>) -> OrderIntent {
        OrderIntent {
            alert_id: "a1".to_string(),
            symbol: symbol.to_string(),
            action,
            quantity: qty,
            strategy_id: "S1".to_string(),
            account_group: "paper_test".to_string(),
            requested_price: price,
            received_at: 0,
        }
    }

    fn simulator(balance: f64) -> PaperTradingSimulator {
        let quotes = StaticQuoteSource::new();
        quotes.set_price("AAPL", 200.0);
        quotes.set_price("ES", 5_000.0);
        PaperTradingSimulator::new(balance, Arc::new(quotes))
    }

    #[tokio::test]
    async fn test_slippage_is_deterministic_and_bounded() {
        let model = SlippageModel::default();
        let a = model.apply(100.0, 4.0, true);
        let b = model.apply(100.0, 4.0, true);
        assert_eq!(a, b);
        // base 1 + 0.25×4 = 2 bps
        assert!((a - 100.02).abs() < 1e-9);
        // 超大单量被上界截断
        let capped = model.apply(100.0, 1_000.0, true);
        assert!((capped - 100.10).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_buy_rejected_on_insufficient_capital() {
        let sim = simulator(1_000.0);
        let err = sim
            .execute(&intent(TradeAction::Buy, "AAPL", 100.0, None))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PaperError::InsufficientSimulatedCapital { .. }
        ));
    }

    #[tokio::test]
    async fn test_round_trip_realizes_pnl() {
        let sim = simulator(100_000.0);
        let open = sim
            .execute(&intent(TradeAction::Buy, "AAPL", 10.0, Some(200.0)))
            .await
            .unwrap();
        assert_eq!(open.mode, TradeMode::Paper);
        assert_eq!(open.realized_pnl, 0.0);

        let close = sim
            .execute(&intent(TradeAction::Close, "AAPL", 10.0, Some(210.0)))
            .await
            .unwrap();
        // 买入滑点抬高成本、平仓滑点压低卖价，盈亏略低于 100
        assert!(close.realized_pnl > 90.0 && close.realized_pnl < 100.0);
    }

    #[tokio::test]
    async fn test_close_without_position_rejected() {
        let sim = simulator(100_000.0);
        let err = sim
            .execute(&intent(TradeAction::Close, "AAPL", 1.0, None))
            .await
            .unwrap_err();
        assert!(matches!(err, PaperError::NoPositionToClose(_)));
    }

    #[tokio::test]
    async fn test_futures_commission_per_contract() {
        let schedule = CommissionSchedule::default();
        assert_eq!(schedule.commission(SymbolClass::Futures, 4.0), 9.0);
        assert_eq!(schedule.commission(SymbolClass::Equities, 100.0), 0.0);
    }
}
