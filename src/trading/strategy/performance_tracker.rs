//! 策略绩效追踪器
//!
//! 每个 strategy_id 一份 StrategyPerformance，首次引用时以 LIVE 模式
//! 创建，永不销毁。封存与迁移判定持有该策略的互斥锁，并发平仓
//! 不会竞争集的收尾、也不会把同一笔交易记进两个集。

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::time_util;
use crate::trading::ingest::TradeAction;

use super::{ModeTransition, StrategyMode, StrategyPerformance, StrategySet, TradeResult};

/// 追踪器错误
#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("策略未注册: {0}")]
    StrategyNotFound(String),

    #[error("非法模式: {0}")]
    InvalidMode(String),
}

/// 追踪器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// 评估集长度（封存阈值）
    pub evaluation_period: usize,
    /// 胜率阈值（百分比）
    pub min_win_rate: f64,
    /// 连续多少个失败集触发 LIVE → PAPER
    pub consecutive_fails_to_paper: usize,
    /// 连续多少个达标的 PAPER 集触发 PAPER → LIVE
    pub consecutive_wins_to_live: usize,
    /// 人工切换模式时是否丢弃进行中的集（编号不重置）
    pub override_resets_open_set: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            evaluation_period: 20,
            min_win_rate: 55.0,
            consecutive_fails_to_paper: 2,
            consecutive_wins_to_live: 2,
            override_resets_open_set: false,
        }
    }
}

/// 平仓结果入参（盈亏由管道按开仓均价结算后传入）
#[derive(Debug, Clone)]
pub struct TradeOutcome {
    pub trade_id: String,
    pub symbol: String,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub side: TradeAction,
    pub pnl: f64,
    /// 本笔交易的实际成交通道（入场时打标）
    pub mode: StrategyMode,
    pub timestamp: i64,
}

/// 一次平仓记录的产出：交易 + 可能的封存集 + 可能的迁移
#[derive(Debug, Clone)]
pub struct ExitRecord {
    pub trade: TradeResult,
    pub sealed_set: Option<StrategySet>,
    pub transition: Option<ModeTransition>,
}

/// 策略绩效追踪器
pub struct StrategyPerformanceTracker {
    strategies: DashMap<String, Arc<Mutex<StrategyPerformance>>>,
    config: TrackerConfig,
}

impl StrategyPerformanceTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            strategies: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// 取或建策略句柄（首次引用即注册，初始 LIVE）
    fn entry(&self, strategy_id: &str) -> Arc<Mutex<StrategyPerformance>> {
        self.strategies
            .entry(strategy_id.to_string())
            .or_insert_with(|| {
                info!(strategy_id, "注册新策略，初始模式 LIVE");
                Arc::new(Mutex::new(StrategyPerformance {
                    strategy_id: strategy_id.to_string(),
                    current_mode: StrategyMode::Live,
                    current_set: StrategySet::open(
                        1,
                        strategy_id,
                        StrategyMode::Live,
                        time_util::now_timestamp_mills(),
                    ),
                    completed_sets: Vec::new(),
                    mode_transition_history: Vec::new(),
                }))
            })
            .value()
            .clone()
    }

    /// 启动恢复：用落库的模式与封存集重建策略句柄
    ///
    /// 当前集接着最大封存编号续开（进行中的集不落库，崩溃即作废），
    /// 迁移判定所需的近期封存集证据一并还原
    pub fn restore(
        &self,
        strategy_id: &str,
        mode: StrategyMode,
        mut completed_sets: Vec<StrategySet>,
    ) {
        completed_sets.sort_by_key(|s| s.set_number);
        let next_number = completed_sets
            .iter()
            .map(|s| s.set_number)
            .max()
            .unwrap_or(0)
            + 1;
        info!(
            strategy_id,
            %mode,
            completed = completed_sets.len(),
            next_set = next_number,
            "恢复策略状态"
        );
        self.strategies.insert(
            strategy_id.to_string(),
            Arc::new(Mutex::new(StrategyPerformance {
                strategy_id: strategy_id.to_string(),
                current_mode: mode,
                current_set: StrategySet::open(
                    next_number,
                    strategy_id,
                    mode,
                    time_util::now_timestamp_mills(),
                ),
                completed_sets,
                mode_transition_history: Vec::new(),
            })),
        );
    }

    /// 入场：返回策略当前模式（路由据此决定实盘或模拟）
    pub async fn record_entry(&self, strategy_id: &str) -> StrategyMode {
        let handle = self.entry(strategy_id);
        let perf = handle.lock().await;
        perf.current_mode
    }

    /// 查询当前模式（不创建新策略）
    pub async fn current_mode(&self, strategy_id: &str) -> Option<StrategyMode> {
        let handle = self.strategies.get(strategy_id)?.value().clone();
        let perf = handle.lock().await;
        Some(perf.current_mode)
    }

    /// 平仓：追加 TradeResult，必要时封存当前集并判定模式迁移
    pub async fn record_exit(&self, strategy_id: &str, outcome: TradeOutcome) -> ExitRecord {
        let handle = self.entry(strategy_id);
        let mut perf = handle.lock().await;

        let trade = TradeResult {
            strategy_id: strategy_id.to_string(),
            trade_id: outcome.trade_id,
            symbol: outcome.symbol,
            entry_price: outcome.entry_price,
            exit_price: outcome.exit_price,
            quantity: outcome.quantity,
            side: outcome.side,
            pnl: outcome.pnl,
            win: outcome.pnl > 0.0,
            timestamp: outcome.timestamp,
            mode: outcome.mode,
            set_number: perf.current_set.set_number,
            trade_number_in_set: perf.current_set.trades.len() as u32 + 1,
        };
        perf.current_set.trades.push(trade.clone());

        if perf.current_set.trades.len() < self.config.evaluation_period {
            return ExitRecord {
                trade,
                sealed_set: None,
                transition: None,
            };
        }

        // 集满：封存，评估迁移，立即开新集
        let sealed = self.seal_current_set(&mut perf);
        let transition = self.evaluate_transition(&mut perf);

        let next_number = sealed.set_number + 1;
        perf.current_set = StrategySet::open(
            next_number,
            strategy_id,
            perf.current_mode,
            time_util::now_timestamp_mills(),
        );

        ExitRecord {
            trade,
            sealed_set: Some(sealed),
            transition,
        }
    }

    /// 封存当前集：一次性计算 win_rate 与 total_pnl
    fn seal_current_set(&self, perf: &mut StrategyPerformance) -> StrategySet {
        let set = &mut perf.current_set;
        let wins = set.trades.iter().filter(|t| t.win).count();
        let win_rate = wins as f64 / self.config.evaluation_period as f64 * 100.0;
        let total_pnl: f64 = set.trades.iter().map(|t| t.pnl).sum();
        set.win_rate = Some(win_rate);
        set.total_pnl = Some(total_pnl);
        set.end_ts = Some(time_util::now_timestamp_mills());

        let sealed = set.clone();
        info!(
            strategy_id = %perf.strategy_id,
            set_number = sealed.set_number,
            win_rate,
            total_pnl,
            "评估集封存"
        );
        perf.completed_sets.push(sealed.clone());
        sealed
    }

    /// 封存后的迁移判定
    ///
    /// - LIVE → PAPER：最近 consecutive_fails_to_paper 个封存集胜率均 < min_win_rate
    /// - PAPER → LIVE：最近 consecutive_wins_to_live 个 **paper 集** 胜率均 ≥ min_win_rate
    /// - SUSPENDED 只能人工解除，不参与自动迁移
    fn evaluate_transition(&self, perf: &mut StrategyPerformance) -> Option<ModeTransition> {
        let min = self.config.min_win_rate;
        match perf.current_mode {
            StrategyMode::Live => {
                let n = self.config.consecutive_fails_to_paper;
                let sets = &perf.completed_sets;
                if sets.len() < n {
                    return None;
                }
                let recent = &sets[sets.len() - n..];
                if recent.iter().all(|s| s.win_rate.unwrap_or(0.0) < min) {
                    let evidence = recent.iter().map(|s| s.set_number).collect::<Vec<_>>();
                    let reason = format!("连续 {} 个评估集胜率低于 {:.1}%", n, min);
                    return Some(self.apply_transition(perf, StrategyMode::Paper, reason, evidence));
                }
                None
            }
            StrategyMode::Paper => {
                let n = self.config.consecutive_wins_to_live;
                let paper_sets: Vec<&StrategySet> = perf
                    .completed_sets
                    .iter()
                    .filter(|s| s.mode == StrategyMode::Paper)
                    .collect();
                if paper_sets.len() < n {
                    return None;
                }
                let recent = &paper_sets[paper_sets.len() - n..];
                if recent.iter().all(|s| s.win_rate.unwrap_or(0.0) >= min) {
                    let evidence = recent.iter().map(|s| s.set_number).collect::<Vec<_>>();
                    let reason = format!("连续 {} 个模拟评估集胜率不低于 {:.1}%", n, min);
                    return Some(self.apply_transition(perf, StrategyMode::Live, reason, evidence));
                }
                None
            }
            StrategyMode::Suspended => None,
        }
    }

    fn apply_transition(
        &self,
        perf: &mut StrategyPerformance,
        to: StrategyMode,
        reason: String,
        evidence_sets: Vec<u32>,
    ) -> ModeTransition {
        let transition = ModeTransition {
            strategy_id: perf.strategy_id.clone(),
            from: perf.current_mode,
            to,
            timestamp: time_util::now_timestamp_mills(),
            reason,
            evidence_sets,
        };
        warn!(
            strategy_id = %perf.strategy_id,
            from = %transition.from,
            to = %transition.to,
            reason = %transition.reason,
            "策略模式迁移"
        );
        perf.current_mode = to;
        perf.mode_transition_history.push(transition.clone());
        transition
    }

    /// 人工强制切换模式，任何时刻可用；记入审计历史，不重置集编号
    pub async fn force_mode(
        &self,
        strategy_id: &str,
        new_mode: StrategyMode,
    ) -> Result<ModeTransition, TrackerError> {
        let handle = self.entry(strategy_id);
        let mut perf = handle.lock().await;

        let transition = self.apply_transition(
            &mut perf,
            new_mode,
            "Manual override".to_string(),
            Vec::new(),
        );

        if self.config.override_resets_open_set {
            let number = perf.current_set.set_number;
            perf.current_set = StrategySet::open(
                number,
                strategy_id,
                new_mode,
                time_util::now_timestamp_mills(),
            );
        } else {
            // 保留进行中的集，后续交易按新模式打标
            perf.current_set.mode = new_mode;
        }
        Ok(transition)
    }

    /// 全量快照（API 投影用）
    pub async fn snapshots(&self) -> Vec<StrategyPerformance> {
        let handles: Vec<Arc<Mutex<StrategyPerformance>>> = self
            .strategies
            .iter()
            .map(|e| e.value().clone())
            .collect();
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            out.push(handle.lock().await.clone());
        }
        out
    }

    /// 单个策略快照
    pub async fn snapshot(&self, strategy_id: &str) -> Option<StrategyPerformance> {
        let handle = self.strategies.get(strategy_id)?.value().clone();
        let perf = handle.lock().await;
        Some(perf.clone())
    }
}
