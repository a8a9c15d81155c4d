//! 资助账户台账
//!
//! 每笔确认成交后事务性更新日内盈亏与跟踪回撤；规则配置
//! （max_daily_loss / trailing_drawdown）运行期只读，绝不下调。
//! 任一规则被击穿立刻产出 RiskBreach 事件并置位熔断标记，
//! 风控评估器在下一次评估时必须观察到它。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::time_util;
use crate::trading::broker::Fill;

use super::{Account, BreachKind};

/// 风控熔断事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskBreachEvent {
    pub account_id: String,
    pub kind: BreachKind,
    /// 触发时的实际值
    pub value: f64,
    /// 被击穿的限额
    pub limit: f64,
    pub timestamp: i64,
}

/// 资助账户台账（无状态，账户本身携带指标）
pub struct FundedAccountLedger;

impl FundedAccountLedger {
    /// 把一笔成交落账：更新余额、日内盈亏、回撤，检查熔断
    ///
    /// 必须在同一 (strategy_id, account_id) 串行队列内按确认顺序调用
    pub fn apply_fill(account: &mut Account, fill: &Fill) -> Option<RiskBreachEvent> {
        Self::roll_trading_day(account, Utc::now());

        let net = fill.realized_pnl - fill.commission;
        account.balance += net;
        account.buying_power += net;
        account.metrics.current_daily_pnl += net;

        // 跟踪回撤：峰值只升不降
        if account.balance > account.metrics.peak_equity {
            account.metrics.peak_equity = account.balance;
        }
        account.metrics.current_drawdown = account.metrics.peak_equity - account.balance;

        let rules = match &account.rules {
            Some(r) => r,
            None => return None,
        };

        if account.metrics.current_daily_pnl <= -rules.max_daily_loss {
            let event = RiskBreachEvent {
                account_id: account.account_id.clone(),
                kind: BreachKind::DailyLoss,
                value: account.metrics.current_daily_pnl,
                limit: rules.max_daily_loss,
                timestamp: time_util::now_timestamp_mills(),
            };
            account.metrics.breached = Some(BreachKind::DailyLoss);
            error!(
                account_id = %account.account_id,
                daily_pnl = account.metrics.current_daily_pnl,
                "资助账户日内亏损熔断"
            );
            return Some(event);
        }

        if account.metrics.current_drawdown >= rules.trailing_drawdown {
            let event = RiskBreachEvent {
                account_id: account.account_id.clone(),
                kind: BreachKind::TrailingDrawdown,
                value: account.metrics.current_drawdown,
                limit: rules.trailing_drawdown,
                timestamp: time_util::now_timestamp_mills(),
            };
            account.metrics.breached = Some(BreachKind::TrailingDrawdown);
            error!(
                account_id = %account.account_id,
                drawdown = account.metrics.current_drawdown,
                "资助账户跟踪回撤熔断"
            );
            return Some(event);
        }

        None
    }

    /// 跨交易日时重置日内盈亏；日内熔断同时解除（回撤熔断保留）
    pub fn roll_trading_day(account: &mut Account, now: DateTime<Utc>) {
        let today = time_util::trading_day_key(now);
        if account.metrics.day_key != today {
            info!(
                account_id = %account.account_id,
                from = %account.metrics.day_key,
                to = %today,
                "交易日切换，重置日内盈亏"
            );
            account.metrics.day_key = today;
            account.metrics.current_daily_pnl = 0.0;
            if account.metrics.breached == Some(BreachKind::DailyLoss) {
                account.metrics.breached = None;
            }
        }
    }

    /// 人工解除熔断
    pub fn manual_reset(account: &mut Account) {
        if account.metrics.breached.is_some() {
            warn!(account_id = %account.account_id, "人工解除风控熔断");
            account.metrics.breached = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading::account::FundedAccountRules;
    use crate::trading::broker::TradeMode;
    use crate::trading::ingest::TradeAction;

    fn funded_account() -> Account {
        Account::new("T-001", "tradovate", 50_000.0, 50_000.0).with_funded_rules(
            FundedAccountRules {
                max_daily_loss: 1_000.0,
                max_contracts: 3.0,
                trailing_drawdown: 2_000.0,
                profit_target: 3_000.0,
            },
        )
    }

    fn fill_with_pnl(pnl: f64) -> Fill {
        Fill {
            order_id: "o1".to_string(),
            account_id: "T-001".to_string(),
            symbol: "ES".to_string(),
            side: TradeAction::Close,
            quantity: 1.0,
            fill_price: 5000.0,
            commission: 0.0,
            realized_pnl: pnl,
            mode: TradeMode::Live,
            timestamp: 0,
        }
    }

    #[test]
    fn test_apply_fill_updates_daily_pnl() {
        let mut acc = funded_account();
        assert!(FundedAccountLedger::apply_fill(&mut acc, &fill_with_pnl(250.0)).is_none());
        assert_eq!(acc.metrics.current_daily_pnl, 250.0);
        assert_eq!(acc.balance, 50_250.0);
    }

    #[test]
    fn test_daily_loss_breach_emits_event() {
        let mut acc = funded_account();
        let event = FundedAccountLedger::apply_fill(&mut acc, &fill_with_pnl(-1_200.0)).unwrap();
        assert_eq!(event.kind, BreachKind::DailyLoss);
        assert_eq!(acc.metrics.breached, Some(BreachKind::DailyLoss));
    }

    #[test]
    fn test_trailing_drawdown_tracks_peak() {
        let mut acc = funded_account();
        // 先盈利抬高峰值，再回吐触发回撤熔断
        FundedAccountLedger::apply_fill(&mut acc, &fill_with_pnl(900.0));
        assert_eq!(acc.metrics.peak_equity, 50_900.0);
        let event = FundedAccountLedger::apply_fill(&mut acc, &fill_with_pnl(-950.0));
        // 日亏 -50，回撤 950：均未触发
        assert!(event.is_none());
        let event = FundedAccountLedger::apply_fill(&mut acc, &fill_with_pnl(-1_100.0));
        // 日亏 -1150 先于回撤触发
        assert_eq!(event.unwrap().kind, BreachKind::DailyLoss);
    }

    #[test]
    fn test_roll_trading_day_resets_daily_pnl() {
        let mut acc = funded_account();
        FundedAccountLedger::apply_fill(&mut acc, &fill_with_pnl(-1_200.0));
        assert!(acc.metrics.breached.is_some());
        // 强行把 day_key 拨到昨天，再滚动
        acc.metrics.day_key = "2000-01-01".to_string();
        FundedAccountLedger::roll_trading_day(&mut acc, Utc::now());
        assert_eq!(acc.metrics.current_daily_pnl, 0.0);
        assert!(acc.metrics.breached.is_none());
    }
}
