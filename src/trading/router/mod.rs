//! 订单路由
//!
//! 按策略当前模式与账户组选择执行目标。模拟路由允许按品种类别
//! 自动兜底到内部模拟器（"auto" 是显式语义）；实盘路由绝不允许
//! 静默兜底，未知账户组直接报错。

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::trading::broker::BrokerKind;
use crate::trading::ingest::OrderIntent;
use crate::trading::strategy::StrategyMode;

/// 路由错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("未知账户组: {0}")]
    UnknownAccountGroup(String),

    #[error("品种类别无可用券商: {0}")]
    NoBrokerForSymbolClass(String),
}

/// 品种类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolClass {
    Futures,
    Options,
    Equities,
    Crypto,
}

impl std::fmt::Display for SymbolClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SymbolClass::Futures => write!(f, "futures"),
            SymbolClass::Options => write!(f, "options"),
            SymbolClass::Equities => write!(f, "equities"),
            SymbolClass::Crypto => write!(f, "crypto"),
        }
    }
}

/// 常见期货根符号（CME/CBOT/NYMEX/COMEX 主力品种）
const FUTURES_ROOTS: &[&str] = &[
    "ES", "NQ", "YM", "RTY", "MES", "MNQ", "MYM", "M2K", "CL", "MCL", "GC", "MGC", "SI", "NG",
    "ZB", "ZN", "ZF", "ZT", "6E", "6J", "6B",
];

impl SymbolClass {
    /// 符号启发式分类
    ///
    /// - 期货根符号（ES/NQ/CL...）或其带月份代码的合约 → Futures
    /// - OCC 风格期权代码（含到期日与 C/P 行权价段）→ Options
    /// - 带 "-USD"/"USDT" 的交易对 → Crypto
    /// - 其余按普通股票处理
    pub fn classify(symbol: &str) -> SymbolClass {
        let s = symbol.trim().to_ascii_uppercase();
        if s.contains("-USD") || s.ends_with("USDT") {
            return SymbolClass::Crypto;
        }
        if FUTURES_ROOTS.contains(&s.as_str()) {
            return SymbolClass::Futures;
        }
        // 根符号 + 月份代码 + 年份，如 ESZ5 / MNQH25
        if s.len() >= 3 && s.len() <= 7 {
            for root in FUTURES_ROOTS {
                if let Some(rest) = s.strip_prefix(root) {
                    let mut chars = rest.chars();
                    if matches!(chars.next(), Some('F' | 'G' | 'H' | 'J' | 'K' | 'M' | 'N' | 'Q' | 'U' | 'V' | 'X' | 'Z'))
                        && chars.all(|c| c.is_ascii_digit())
                        && !rest.is_empty()
                    {
                        return SymbolClass::Futures;
                    }
                }
            }
        }
        // OCC 期权代码：符号主体 + 6 位日期 + C/P + 8 位行权价
        if s.len() >= 16 && s.chars().rev().take(8).all(|c| c.is_ascii_digit()) {
            let tail = &s[s.len() - 9..];
            if tail.starts_with('C') || tail.starts_with('P') {
                return SymbolClass::Options;
            }
        }
        SymbolClass::Equities
    }
}

/// 模拟执行目标：按品种类别选 demo/sandbox/paper 通道，无对应券商
/// 时兜底内部模拟器
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaperTarget {
    /// 期货 demo 通道
    FuturesDemo,
    /// 期权 sandbox 通道
    OptionsSandbox,
    /// 股票免费模拟通道
    EquitiesPaper,
    /// 内部撮合模拟器
    InternalSimulator,
}

/// 路由结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    /// 实盘：绑定券商与账户
    Live {
        broker: BrokerKind,
        account_id: String,
    },
    /// 模拟执行
    Paper(PaperTarget),
}

/// 账户组与实盘券商的绑定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountGroupBinding {
    pub broker: BrokerKind,
    pub account_id: String,
}

/// 订单路由器
pub struct OrderRouter {
    /// account_group -> 实盘绑定
    bindings: DashMap<String, AccountGroupBinding>,
    /// 显式模拟账户组前缀
    paper_prefixes: Vec<String>,
}

impl OrderRouter {
    pub fn new() -> Self {
        Self {
            bindings: DashMap::new(),
            paper_prefixes: vec!["paper_".to_string(), "sim_".to_string()],
        }
    }

    pub fn bind(&self, account_group: &str, broker: BrokerKind, account_id: &str) {
        info!(account_group, %broker, account_id, "账户组绑定");
        self.bindings.insert(
            account_group.to_string(),
            AccountGroupBinding {
                broker,
                account_id: account_id.to_string(),
            },
        );
    }

    pub fn binding(&self, account_group: &str) -> Option<AccountGroupBinding> {
        self.bindings.get(account_group).map(|e| e.value().clone())
    }

    fn is_paper_group(&self, account_group: &str) -> bool {
        self.paper_prefixes
            .iter()
            .any(|p| account_group.starts_with(p.as_str()))
    }

    /// 选择执行目标
    ///
    /// PAPER 模式的策略无条件走模拟通道，忽略意图原本的账户组
    pub fn route(
        &self,
        intent: &OrderIntent,
        current_mode: StrategyMode,
    ) -> Result<RouteTarget, RoutingError> {
        let paper = current_mode == StrategyMode::Paper || self.is_paper_group(&intent.account_group);
        if paper {
            let target = match SymbolClass::classify(&intent.symbol) {
                SymbolClass::Futures => PaperTarget::FuturesDemo,
                SymbolClass::Options => PaperTarget::OptionsSandbox,
                SymbolClass::Equities => PaperTarget::EquitiesPaper,
                SymbolClass::Crypto => PaperTarget::InternalSimulator,
            };
            debug!(symbol = %intent.symbol, ?target, "路由到模拟通道");
            return Ok(RouteTarget::Paper(target));
        }

        // 实盘：必须有显式绑定
        let binding = self
            .binding(&intent.account_group)
            .ok_or_else(|| RoutingError::UnknownAccountGroup(intent.account_group.clone()))?;
        Ok(RouteTarget::Live {
            broker: binding.broker,
            account_id: binding.account_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading::ingest::TradeAction;

    fn intent(symbol: &str, group: &str) -> OrderIntent {
        OrderIntent {
            alert_id: "a1".to_string(),
            symbol: symbol.to_string(),
            action: TradeAction::Buy,
            quantity: 1.0,
            strategy_id: "S1".to_string(),
            account_group: group.to_string(),
            requested_price: None,
            received_at: 0,
        }
    }

    #[test]
    fn test_symbol_classification() {
        assert_eq!(SymbolClass::classify("ES"), SymbolClass::Futures);
        assert_eq!(SymbolClass::classify("MNQZ5"), SymbolClass::Futures);
        assert_eq!(SymbolClass::classify("AAPL"), SymbolClass::Equities);
        assert_eq!(SymbolClass::classify("BTC-USD"), SymbolClass::Crypto);
        assert_eq!(
            SymbolClass::classify("AAPL240621C00190000"),
            SymbolClass::Options
        );
    }

    #[test]
    fn test_paper_mode_forces_paper_target() {
        let router = OrderRouter::new();
        router.bind("topstep_001", BrokerKind::Tradovate, "T-001");
        // 实盘账户组 + PAPER 模式：仍然路由到模拟
        let target = router
            .route(&intent("ES", "topstep_001"), StrategyMode::Paper)
            .unwrap();
        assert_eq!(target, RouteTarget::Paper(PaperTarget::FuturesDemo));
    }

    #[test]
    fn test_live_routing_uses_binding() {
        let router = OrderRouter::new();
        router.bind("topstep_001", BrokerKind::Tradovate, "T-001");
        let target = router
            .route(&intent("ES", "topstep_001"), StrategyMode::Live)
            .unwrap();
        assert_eq!(
            target,
            RouteTarget::Live {
                broker: BrokerKind::Tradovate,
                account_id: "T-001".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_group_no_silent_default() {
        let router = OrderRouter::new();
        let err = router
            .route(&intent("ES", "nobody"), StrategyMode::Live)
            .unwrap_err();
        assert_eq!(err, RoutingError::UnknownAccountGroup("nobody".to_string()));
    }

    #[test]
    fn test_explicit_paper_prefix_routes_paper() {
        let router = OrderRouter::new();
        let target = router
            .route(&intent("AAPL", "paper_test"), StrategyMode::Live)
            .unwrap();
        assert_eq!(target, RouteTarget::Paper(PaperTarget::EquitiesPaper));
    }

    #[test]
    fn test_crypto_paper_falls_back_to_internal_sim() {
        let router = OrderRouter::new();
        let target = router
            .route(&intent("BTC-USD", "paper_test"), StrategyMode::Live)
            .unwrap();
        assert_eq!(target, RouteTarget::Paper(PaperTarget::InternalSimulator));
    }
}
