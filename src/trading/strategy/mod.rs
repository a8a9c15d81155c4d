//! 策略绩效追踪
//!
//! 按策略维度把平仓结果累积进固定长度（默认 20 笔）的评估集，
//! 集满即封存并判定 LIVE ↔ PAPER 模式迁移。每个 strategy_id 的
//! 封存与迁移判定是唯一的临界区，必须串行。

pub mod performance_tracker;

use serde::{Deserialize, Serialize};

use crate::trading::ingest::TradeAction;

/// 策略执行模式状态机：LIVE / PAPER / SUSPENDED，初始 LIVE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyMode {
    Live,
    Paper,
    Suspended,
}

impl std::fmt::Display for StrategyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyMode::Live => write!(f, "live"),
            StrategyMode::Paper => write!(f, "paper"),
            StrategyMode::Suspended => write!(f, "suspended"),
        }
    }
}

impl StrategyMode {
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "live" => Some(StrategyMode::Live),
            "paper" => Some(StrategyMode::Paper),
            "suspended" => Some(StrategyMode::Suspended),
            _ => None,
        }
    }
}

/// 一笔完整交易的结果，平仓时产生，入集后不可变
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeResult {
    pub strategy_id: String,
    pub trade_id: String,
    pub symbol: String,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub side: TradeAction,
    pub pnl: f64,
    pub win: bool,
    pub timestamp: i64,
    /// 成交通道（实盘 / 模拟），入场时按策略当时的模式打标
    pub mode: StrategyMode,
    pub set_number: u32,
    pub trade_number_in_set: u32,
}

/// 评估集：开放期接收追加，满 evaluation_period 笔即封存
///
/// 不变式：封存集恰好包含 evaluation_period 笔交易，
/// win_rate / total_pnl 只在封存时计算一次，之后不再重算
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySet {
    pub set_number: u32,
    pub strategy_id: String,
    pub trades: Vec<TradeResult>,
    /// 封存时计算：win 数 / evaluation_period × 100
    pub win_rate: Option<f64>,
    /// 封存时计算：Σ pnl
    pub total_pnl: Option<f64>,
    /// 开集（或人工切换）时的策略模式
    pub mode: StrategyMode,
    pub start_ts: i64,
    pub end_ts: Option<i64>,
}

impl StrategySet {
    pub fn open(set_number: u32, strategy_id: &str, mode: StrategyMode, now: i64) -> Self {
        Self {
            set_number,
            strategy_id: strategy_id.to_string(),
            trades: Vec::new(),
            win_rate: None,
            total_pnl: None,
            mode,
            start_ts: now,
            end_ts: None,
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.win_rate.is_some()
    }
}

/// 模式迁移记录：追加后永不修改或裁剪（资金分配决策的审计轨迹）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeTransition {
    pub strategy_id: String,
    pub from: StrategyMode,
    pub to: StrategyMode,
    pub timestamp: i64,
    pub reason: String,
    /// 触发迁移的证据集编号
    pub evidence_sets: Vec<u32>,
}

/// 单个策略的全部绩效状态，由追踪器独占持有，只增不删
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyPerformance {
    pub strategy_id: String,
    pub current_mode: StrategyMode,
    pub current_set: StrategySet,
    pub completed_sets: Vec<StrategySet>,
    pub mode_transition_history: Vec<ModeTransition>,
}
