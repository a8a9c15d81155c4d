//! 风控策略评估器
//!
//! 纯函数：对同一 (intent, account, portfolio) 重复调用结果一致、
//! 无任何副作用（状态修改只发生在下游成交落账之后）。
//! 六项检查按固定顺序执行，首个失败即短路，每个失败返回
//! 具名的拒绝原因——这组枚举是 UI 层消费的外部契约。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::time_util;
use crate::trading::account::{Account, BreachKind};
use crate::trading::ingest::{OrderIntent, TradeAction};
use crate::trading::router::SymbolClass;

/// 拒绝原因（逐项具名，UI 不允许折叠为"order failed"）
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DenyReason {
    #[error("市场休市或交易暂停")]
    MarketClosed,

    #[error("购买力不足")]
    InsufficientBuyingPower,

    #[error("单品种集中度超限")]
    ConcentrationLimit,

    #[error("日内亏损已达上限")]
    DailyLossLimitBreached,

    #[error("超过最大合约数量")]
    MaxContractsExceeded,

    #[error("跟踪回撤已达上限")]
    TrailingDrawdownBreached,
}

/// 评估结论
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskDecision {
    Allow,
    Deny(DenyReason),
}

impl RiskDecision {
    pub fn is_allow(&self) -> bool {
        matches!(self, RiskDecision::Allow)
    }
}

/// 组合状态快照：由管道在评估前组装，评估期间不被修改
#[derive(Debug, Clone, Default)]
pub struct PortfolioState {
    /// 账户权益（集中度分母）
    pub equity: f64,
    /// 当前各品种名义敞口
    pub symbol_exposure: HashMap<String, f64>,
    /// 参考价（估算名义价值用），无报价的品种不在其中
    pub mark_prices: HashMap<String, f64>,
    /// 外部交易暂停开关（如交易所熔断）
    pub trading_halted: bool,
}

/// 风控配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// 单品种敞口占组合比例上限
    pub max_concentration: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_concentration: 0.25,
        }
    }
}

/// 合约乘数（名义价值 = 价格 × 数量 × 乘数）
pub fn contract_multiplier(class: SymbolClass) -> f64 {
    match class {
        SymbolClass::Futures => 50.0,
        SymbolClass::Options => 100.0,
        SymbolClass::Equities | SymbolClass::Crypto => 1.0,
    }
}

/// 评估一笔订单意图
///
/// 检查顺序（短路）：
/// 1. 交易时段 / 暂停
/// 2. 余额与购买力
/// 3. 单品种集中度
/// 4. 日内亏损限额（含熔断标记）
/// 5. 最大合约数量
/// 6. 跟踪回撤
pub fn evaluate(
    intent: &OrderIntent,
    account: &Account,
    portfolio: &PortfolioState,
    config: &RiskConfig,
    now: DateTime<Utc>,
) -> RiskDecision {
    let class = SymbolClass::classify(&intent.symbol);

    // 1. 交易时段
    if portfolio.trading_halted || !time_util::is_market_open(now, class) {
        return RiskDecision::Deny(DenyReason::MarketClosed);
    }

    // 名义价值估算：优先信号价，其次组合参考价
    let reference_price = intent
        .requested_price
        .or_else(|| portfolio.mark_prices.get(&intent.symbol).copied());
    let notional = reference_price
        .map(|px| px * intent.quantity * contract_multiplier(class))
        .unwrap_or(0.0);

    // 2. 购买力（仅开仓方向需要新资金；平仓放行）
    if intent.action != TradeAction::Close && notional > account.buying_power {
        return RiskDecision::Deny(DenyReason::InsufficientBuyingPower);
    }

    // 3. 集中度：既有敞口加本单名义价值不得超过组合权益的配置比例
    if intent.action != TradeAction::Close {
        let existing = portfolio
            .symbol_exposure
            .get(&intent.symbol)
            .copied()
            .unwrap_or(0.0);
        let equity = portfolio.equity.max(1.0);
        if (existing + notional) / equity > config.max_concentration {
            return RiskDecision::Deny(DenyReason::ConcentrationLimit);
        }
    }

    // 4-6 仅对携带资助规则的账户生效
    if let Some(rules) = &account.rules {
        // 4. 日内亏损：已熔断，或当前日内盈亏已越过 -max_daily_loss
        if account.metrics.breached == Some(BreachKind::DailyLoss)
            || account.metrics.current_daily_pnl <= -rules.max_daily_loss
        {
            return RiskDecision::Deny(DenyReason::DailyLossLimitBreached);
        }

        // 5. 合约数量
        if intent.quantity > rules.max_contracts {
            return RiskDecision::Deny(DenyReason::MaxContractsExceeded);
        }

        // 6. 跟踪回撤
        if account.metrics.breached == Some(BreachKind::TrailingDrawdown)
            || account.metrics.current_drawdown >= rules.trailing_drawdown
        {
            return RiskDecision::Deny(DenyReason::TrailingDrawdownBreached);
        }
    }

    RiskDecision::Allow
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading::account::FundedAccountRules;
    use chrono::TimeZone;

    fn intent(symbol: &str, action: TradeAction, qty: f64, price: Option<f64>) -> OrderIntent {
        OrderIntent {
            alert_id: "a1".to_string(),
            symbol: symbol.to_string(),
            action,
            quantity: qty,
            strategy_id: "S1".to_string(),
            account_group: "topstep_001".to_string(),
            requested_price: price,
            received_at: 0,
        }
    }

    fn funded_account() -> Account {
        Account::new("T-001", "tradovate", 500_000.0, 500_000.0).with_funded_rules(
            FundedAccountRules {
                max_daily_loss: 1_000.0,
                max_contracts: 3.0,
                trailing_drawdown: 2_000.0,
                profit_target: 3_000.0,
            },
        )
    }

    fn portfolio() -> PortfolioState {
        PortfolioState {
            equity: 500_000.0,
            ..Default::default()
        }
    }

    // 周二 15:00 UTC：期货与美股都在盘中
    fn open_hours() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 4, 15, 0, 0).unwrap()
    }

    #[test]
    fn test_allow_within_all_limits() {
        let decision = evaluate(
            &intent("ES", TradeAction::Buy, 2.0, Some(100.0)),
            &funded_account(),
            &portfolio(),
            &RiskConfig::default(),
            open_hours(),
        );
        assert_eq!(decision, RiskDecision::Allow);
    }

    #[test]
    fn test_market_closed_denied() {
        let saturday = Utc.with_ymd_and_hms(2024, 6, 8, 15, 0, 0).unwrap();
        let decision = evaluate(
            &intent("ES", TradeAction::Buy, 1.0, Some(100.0)),
            &funded_account(),
            &portfolio(),
            &RiskConfig::default(),
            saturday,
        );
        assert_eq!(decision, RiskDecision::Deny(DenyReason::MarketClosed));
    }

    #[test]
    fn test_insufficient_buying_power() {
        let mut acc = funded_account();
        acc.buying_power = 1_000.0;
        let decision = evaluate(
            &intent("ES", TradeAction::Buy, 1.0, Some(5_000.0)),
            &acc,
            &portfolio(),
            &RiskConfig::default(),
            open_hours(),
        );
        assert_eq!(
            decision,
            RiskDecision::Deny(DenyReason::InsufficientBuyingPower)
        );
    }

    #[test]
    fn test_concentration_limit() {
        let mut pf = portfolio();
        pf.equity = 100_000.0;
        pf.symbol_exposure.insert("AAPL".to_string(), 24_000.0);
        let decision = evaluate(
            &intent("AAPL", TradeAction::Buy, 100.0, Some(20.0)),
            &funded_account(),
            &pf,
            &RiskConfig::default(),
            open_hours(),
        );
        assert_eq!(decision, RiskDecision::Deny(DenyReason::ConcentrationLimit));
    }

    #[test]
    fn test_max_contracts_exceeded() {
        // §8 场景：max_contracts=3 的账户收到 quantity=50 的 ES 买入
        let decision = evaluate(
            &intent("ES", TradeAction::Buy, 50.0, Some(10.0)),
            &funded_account(),
            &portfolio(),
            &RiskConfig::default(),
            open_hours(),
        );
        assert_eq!(
            decision,
            RiskDecision::Deny(DenyReason::MaxContractsExceeded)
        );
    }

    #[test]
    fn test_daily_loss_limit_checked_before_contracts() {
        let mut acc = funded_account();
        acc.metrics.current_daily_pnl = -1_500.0;
        let decision = evaluate(
            &intent("ES", TradeAction::Buy, 50.0, Some(10.0)),
            &acc,
            &portfolio(),
            &RiskConfig::default(),
            open_hours(),
        );
        // 第 4 项先于第 5 项短路
        assert_eq!(
            decision,
            RiskDecision::Deny(DenyReason::DailyLossLimitBreached)
        );
    }

    #[test]
    fn test_trailing_drawdown_denied() {
        let mut acc = funded_account();
        acc.metrics.current_drawdown = 2_500.0;
        let decision = evaluate(
            &intent("ES", TradeAction::Buy, 1.0, Some(10.0)),
            &acc,
            &portfolio(),
            &RiskConfig::default(),
            open_hours(),
        );
        assert_eq!(
            decision,
            RiskDecision::Deny(DenyReason::TrailingDrawdownBreached)
        );
    }

    #[test]
    fn test_evaluate_is_idempotent() {
        let i = intent("ES", TradeAction::Buy, 2.0, Some(100.0));
        let acc = funded_account();
        let pf = portfolio();
        let cfg = RiskConfig::default();
        let now = open_hours();
        let first = evaluate(&i, &acc, &pf, &cfg, now);
        let second = evaluate(&i, &acc, &pf, &cfg, now);
        assert_eq!(first, second);
    }

    #[test]
    fn test_close_bypasses_buying_power() {
        let mut acc = funded_account();
        acc.buying_power = 0.0;
        let decision = evaluate(
            &intent("ES", TradeAction::Close, 1.0, Some(5_000.0)),
            &acc,
            &portfolio(),
            &RiskConfig::default(),
            open_hours(),
        );
        assert_eq!(decision, RiskDecision::Allow);
    }
}
