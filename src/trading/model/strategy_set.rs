extern crate rbatis;

use rbatis::rbdc::db::ExecResult;
use rbatis::{crud, RBatis};
use rbs::value;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::app_config::db;
use crate::trading::strategy::{StrategyMode, StrategySet};

/// table：封存后的评估集（win_rate/total_pnl 封存时一次写入，之后只读）
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "snake_case")]
pub struct StrategySetEntity {
    pub strategy_id: String,
    pub set_number: i32,
    pub mode: String,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub trade_count: i32,
    /// 该集全部 TradeResult 的 JSON 快照
    pub trades_json: String,
    pub start_ts: i64,
    pub end_ts: i64,
}

crud!(StrategySetEntity {}, "strategy_sets");

impl StrategySetEntity {
    /// 还原成追踪器内存中的封存集
    pub fn to_sealed_set(&self) -> StrategySet {
        StrategySet {
            set_number: self.set_number.max(0) as u32,
            strategy_id: self.strategy_id.clone(),
            trades: serde_json::from_str(&self.trades_json).unwrap_or_default(),
            win_rate: Some(self.win_rate),
            total_pnl: Some(self.total_pnl),
            mode: StrategyMode::from_str_loose(&self.mode).unwrap_or(StrategyMode::Live),
            start_ts: self.start_ts,
            end_ts: Some(self.end_ts),
        }
    }
}

pub struct StrategySetModel {
    db: &'static RBatis,
}

impl StrategySetModel {
    pub async fn new() -> Self {
        Self {
            db: db::get_db_client(),
        }
    }

    pub async fn add_sealed(&self, sealed: &StrategySet) -> anyhow::Result<ExecResult> {
        let entity = StrategySetEntity {
            strategy_id: sealed.strategy_id.clone(),
            set_number: sealed.set_number as i32,
            mode: sealed.mode.to_string(),
            win_rate: sealed.win_rate.unwrap_or(0.0),
            total_pnl: sealed.total_pnl.unwrap_or(0.0),
            trade_count: sealed.trades.len() as i32,
            trades_json: serde_json::to_string(&sealed.trades)?,
            start_ts: sealed.start_ts,
            end_ts: sealed.end_ts.unwrap_or(0),
        };
        let data = StrategySetEntity::insert(self.db, &entity).await?;
        debug!(
            strategy_id = %entity.strategy_id,
            set_number = entity.set_number,
            "封存集落库"
        );
        Ok(data)
    }

    pub async fn list_by_strategy(&self, strategy_id: &str) -> anyhow::Result<Vec<StrategySetEntity>> {
        let data =
            StrategySetEntity::select_by_map(self.db, value! {"strategy_id": strategy_id}).await?;
        Ok(data)
    }

    /// 启动恢复用：有封存集记录的全部策略 id
    pub async fn list_strategy_ids(&self) -> anyhow::Result<Vec<String>> {
        let data: Vec<String> = self
            .db
            .query_decode(
                "select distinct strategy_id from strategy_sets",
                vec![],
            )
            .await?;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_util;

    #[test]
    fn test_entity_round_trips_to_sealed_set() {
        let mut set = StrategySet::open(3, "S1", StrategyMode::Paper, time_util::now_timestamp_mills());
        set.win_rate = Some(60.0);
        set.total_pnl = Some(120.0);
        set.end_ts = Some(set.start_ts + 1);

        let entity = StrategySetEntity {
            strategy_id: set.strategy_id.clone(),
            set_number: set.set_number as i32,
            mode: set.mode.to_string(),
            win_rate: set.win_rate.unwrap(),
            total_pnl: set.total_pnl.unwrap(),
            trade_count: 0,
            trades_json: "[]".to_string(),
            start_ts: set.start_ts,
            end_ts: set.end_ts.unwrap(),
        };
        let restored = entity.to_sealed_set();
        assert_eq!(restored.set_number, 3);
        assert_eq!(restored.mode, StrategyMode::Paper);
        assert_eq!(restored.win_rate, Some(60.0));
        assert!(restored.trades.is_empty());
    }
}
