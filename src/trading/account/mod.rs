//! 账户注册表与头寸簿
//!
//! 账户注册表是跨请求共享状态之一：按 key（account_id）加锁，
//! 账户只能被资金账户台账在成交确认后修改。

pub mod ledger;

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::time_util;
use crate::trading::ingest::TradeAction;

/// 资助账户规则（不可变的账户级风控配置）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundedAccountRules {
    /// 单日最大亏损（正数）
    pub max_daily_loss: f64,
    /// 最大合约/持仓数量
    pub max_contracts: f64,
    /// 跟踪回撤上限（正数）
    pub trailing_drawdown: f64,
    /// 盈利目标
    pub profit_target: f64,
}

/// 熔断类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreachKind {
    DailyLoss,
    TrailingDrawdown,
}

/// 资助账户运行时指标：规则之外唯一可变的部分，每笔成交事务性更新
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundedAccountMetrics {
    pub current_daily_pnl: f64,
    pub current_drawdown: f64,
    /// 权益峰值（跟踪回撤基准）
    pub peak_equity: f64,
    /// 当前交易日 key，跨日时重置 current_daily_pnl
    pub day_key: String,
    /// 熔断标记：置位后新订单一律拒绝，直到下一交易日或人工重置
    pub breached: Option<BreachKind>,
}

impl FundedAccountMetrics {
    pub fn new(equity: f64) -> Self {
        Self {
            current_daily_pnl: 0.0,
            current_drawdown: 0.0,
            peak_equity: equity,
            day_key: time_util::trading_day_key(chrono::Utc::now()),
            breached: None,
        }
    }
}

/// 交易账户
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub account_id: String,
    /// 所属券商平台（tradovate / tastytrade / alpaca / sim）
    pub platform: String,
    pub balance: f64,
    pub buying_power: f64,
    pub is_funded: bool,
    pub rules: Option<FundedAccountRules>,
    pub metrics: FundedAccountMetrics,
}

impl Account {
    pub fn new(account_id: &str, platform: &str, balance: f64, buying_power: f64) -> Self {
        Self {
            account_id: account_id.to_string(),
            platform: platform.to_string(),
            balance,
            buying_power,
            is_funded: false,
            rules: None,
            metrics: FundedAccountMetrics::new(balance),
        }
    }

    pub fn with_funded_rules(mut self, rules: FundedAccountRules) -> Self {
        self.is_funded = true;
        self.rules = Some(rules);
        self
    }
}

/// 账户注册表：account_id -> 账户（每个账户独立的读写锁）
pub struct AccountRegistry {
    accounts: DashMap<String, Arc<RwLock<Account>>>,
}

impl AccountRegistry {
    pub fn new() -> Self {
        Self {
            accounts: DashMap::new(),
        }
    }

    pub fn register(&self, account: Account) {
        self.accounts
            .insert(account.account_id.clone(), Arc::new(RwLock::new(account)));
    }

    pub fn get(&self, account_id: &str) -> Option<Arc<RwLock<Account>>> {
        self.accounts.get(account_id).map(|e| e.value().clone())
    }

    pub fn account_ids(&self) -> Vec<String> {
        self.accounts.iter().map(|e| e.key().clone()).collect()
    }
}

/// 持仓快照（开仓均价，用于平仓时计算已实现盈亏）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: f64,
    pub avg_price: f64,
    /// 开仓方向
    pub side: TradeAction,
    pub opened_at: i64,
}

/// 头寸簿：(account_id, symbol) -> 持仓
pub struct PositionBook {
    positions: DashMap<String, Position>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self {
            positions: DashMap::new(),
        }
    }

    fn key(account_id: &str, symbol: &str) -> String {
        format!("{}:{}", account_id, symbol)
    }

    pub fn get(&self, account_id: &str, symbol: &str) -> Option<Position> {
        self.positions
            .get(&Self::key(account_id, symbol))
            .map(|e| e.value().clone())
    }

    /// 开仓或加仓，维护加权均价
    pub fn open(&self, account_id: &str, symbol: &str, side: TradeAction, qty: f64, price: f64) {
        let key = Self::key(account_id, symbol);
        match self.positions.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut e) => {
                let pos = e.get_mut();
                let total = pos.quantity + qty;
                pos.avg_price = (pos.avg_price * pos.quantity + price * qty) / total;
                pos.quantity = total;
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(Position {
                    symbol: symbol.to_string(),
                    quantity: qty,
                    avg_price: price,
                    side,
                    opened_at: time_util::now_timestamp_mills(),
                });
            }
        }
    }

    /// 平仓，返回被平掉的持仓（用于结算盈亏）
    pub fn close(&self, account_id: &str, symbol: &str) -> Option<Position> {
        self.positions
            .remove(&Self::key(account_id, symbol))
            .map(|(_, pos)| pos)
    }

    /// 当前各品种敞口（名义价值），供集中度检查使用
    pub fn exposure_by_symbol(&self, account_id: &str) -> std::collections::HashMap<String, f64> {
        let prefix = format!("{}:", account_id);
        self.positions
            .iter()
            .filter(|e| e.key().starts_with(&prefix))
            .map(|e| {
                let pos = e.value();
                (pos.symbol.clone(), pos.quantity * pos.avg_price)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_book_weighted_avg() {
        let book = PositionBook::new();
        book.open("A1", "ES", TradeAction::Buy, 2.0, 100.0);
        book.open("A1", "ES", TradeAction::Buy, 2.0, 110.0);
        let pos = book.get("A1", "ES").unwrap();
        assert_eq!(pos.quantity, 4.0);
        assert!((pos.avg_price - 105.0).abs() < 1e-9);
    }

    #[test]
    fn test_position_book_close_removes() {
        let book = PositionBook::new();
        book.open("A1", "NQ", TradeAction::Sell, 1.0, 200.0);
        let pos = book.close("A1", "NQ").unwrap();
        assert_eq!(pos.avg_price, 200.0);
        assert!(book.get("A1", "NQ").is_none());
    }
}
