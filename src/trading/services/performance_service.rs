//! 绩效持久化与查询投影
//!
//! 热路径里的封存与迁移先在内存完成，这里负责把结果异步落库，
//! 并为 API 层提供查询投影。DB 未就绪时全部跳过。

use std::collections::{HashMap, HashSet};

use serde_json::{json, Value};
use tracing::{error, info};

use crate::app_config::db;
use crate::time_util;
use crate::trading::broker::{Fill, TradeMode};
use crate::trading::ingest::OrderIntent;
use crate::trading::model::mode_transition::ModeTransitionModel;
use crate::trading::model::order_record::{OrderRecordEntity, OrderRecordModel};
use crate::trading::model::strategy_set::StrategySetModel;
use crate::trading::strategy::performance_tracker::StrategyPerformanceTracker;
use crate::trading::strategy::{ModeTransition, StrategyMode, StrategyPerformance, StrategySet};

pub struct PerformanceService;

impl PerformanceService {
    pub fn new() -> Self {
        Self
    }

    /// 封存集落库（尽力而为，失败只记日志不影响交易流）
    pub async fn persist_sealed_set(&self, sealed: &StrategySet) {
        if !db::is_db_ready() {
            return;
        }
        let model = StrategySetModel::new().await;
        if let Err(e) = model.add_sealed(sealed).await {
            error!(
                strategy_id = %sealed.strategy_id,
                set_number = sealed.set_number,
                "封存集落库失败: {}", e
            );
        }
    }

    /// 迁移记录落库
    pub async fn persist_transition(&self, transition: &ModeTransition) {
        if !db::is_db_ready() {
            return;
        }
        let model = ModeTransitionModel::new().await;
        if let Err(e) = model.add(transition).await {
            error!(
                strategy_id = %transition.strategy_id,
                "迁移记录落库失败: {}", e
            );
        }
    }

    /// 订单+成交记录落库
    pub async fn persist_fill(&self, intent: &OrderIntent, fill: &Fill, status: &str) {
        if !db::is_db_ready() {
            return;
        }
        let now = time_util::now_timestamp_mills();
        let record = OrderRecordEntity {
            order_id: fill.order_id.clone(),
            client_order_id: intent.alert_id.clone(),
            alert_id: intent.alert_id.clone(),
            account_id: fill.account_id.clone(),
            strategy_id: intent.strategy_id.clone(),
            symbol: fill.symbol.clone(),
            side: fill.side.to_string(),
            quantity: fill.quantity,
            status: status.to_string(),
            fill_price: Some(fill.fill_price),
            commission: Some(fill.commission),
            realized_pnl: Some(fill.realized_pnl),
            mode: fill.mode.to_string(),
            needs_review: 0,
            created_at: now,
            updated_at: now,
        };
        let model = OrderRecordModel::new().await;
        if let Err(e) = model.add(&record).await {
            error!(order_id = %record.order_id, "订单记录落库失败: {}", e);
        }
    }

    /// 超时未决订单落库（pending，等待对账）
    pub async fn persist_pending(
        &self,
        intent: &OrderIntent,
        order_id: &str,
        account_id: &str,
        mode: TradeMode,
    ) {
        if !db::is_db_ready() {
            return;
        }
        let now = time_util::now_timestamp_mills();
        let record = OrderRecordEntity {
            order_id: order_id.to_string(),
            client_order_id: intent.alert_id.clone(),
            alert_id: intent.alert_id.clone(),
            account_id: account_id.to_string(),
            strategy_id: intent.strategy_id.clone(),
            symbol: intent.symbol.clone(),
            side: intent.action.to_string(),
            quantity: intent.quantity,
            status: "pending".to_string(),
            fill_price: None,
            commission: None,
            realized_pnl: None,
            mode: mode.to_string(),
            needs_review: 0,
            created_at: now,
            updated_at: now,
        };
        let model = OrderRecordModel::new().await;
        if let Err(e) = model.add(&record).await {
            error!(order_id, "未决订单落库失败: {}", e);
        } else {
            info!(order_id, "券商调用超时，订单置 pending 等待对账");
        }
    }

    /// 启动恢复：把落库的策略模式、封存集还原进追踪器
    ///
    /// 崩溃重启后 PAPER/SUSPENDED 策略不得悄悄回到 LIVE，集编号接着
    /// 最大封存编号续起。返回恢复的策略数。
    pub async fn rehydrate(
        &self,
        tracker: &StrategyPerformanceTracker,
    ) -> anyhow::Result<usize> {
        if !db::is_db_ready() {
            return Ok(0);
        }
        let set_model = StrategySetModel::new().await;
        let transition_model = ModeTransitionModel::new().await;

        let modes: HashMap<String, StrategyMode> = transition_model
            .latest_modes()
            .await?
            .into_iter()
            .filter_map(|row| {
                StrategyMode::from_str_loose(&row.to_mode).map(|m| (row.strategy_id, m))
            })
            .collect();

        let mut strategy_ids: HashSet<String> =
            set_model.list_strategy_ids().await?.into_iter().collect();
        strategy_ids.extend(modes.keys().cloned());

        for strategy_id in &strategy_ids {
            let completed: Vec<StrategySet> = set_model
                .list_by_strategy(strategy_id)
                .await?
                .iter()
                .map(|e| e.to_sealed_set())
                .collect();
            // 从未迁移过的策略保持初始 LIVE
            let mode = modes.get(strategy_id).copied().unwrap_or(StrategyMode::Live);
            tracker.restore(strategy_id, mode, completed);
        }
        if !strategy_ids.is_empty() {
            info!(count = strategy_ids.len(), "策略状态已从库中恢复");
        }
        Ok(strategy_ids.len())
    }

    /// API 投影：单个策略的绩效视图
    pub fn project(perf: &StrategyPerformance) -> Value {
        json!({
            "strategyId": perf.strategy_id,
            "currentMode": perf.current_mode,
            "currentSet": {
                "setNumber": perf.current_set.set_number,
                "mode": perf.current_set.mode,
                "tradeCount": perf.current_set.trades.len(),
            },
            "completedSets": perf.completed_sets.iter().map(|s| json!({
                "setNumber": s.set_number,
                "mode": s.mode,
                "winRate": s.win_rate,
                "totalPnl": s.total_pnl,
                "tradeCount": s.trades.len(),
            })).collect::<Vec<_>>(),
            "modeTransitionHistory": perf.mode_transition_history.iter().map(|t| json!({
                "from": t.from,
                "to": t.to,
                "reason": t.reason,
                "evidenceSets": t.evidence_sets,
                "timestamp": t.timestamp,
            })).collect::<Vec<_>>(),
        })
    }
}
