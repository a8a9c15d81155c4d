extern crate rbatis;

use rbatis::rbdc::db::ExecResult;
use rbatis::{crud, RBatis};
use rbs::value;
use serde::{Deserialize, Serialize};

use crate::app_config::db;
use crate::trading::strategy::ModeTransition;

/// table：模式迁移审计（只追加）
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "snake_case")]
pub struct ModeTransitionEntity {
    pub strategy_id: String,
    pub from_mode: String,
    pub to_mode: String,
    pub reason: String,
    /// 证据集编号的 JSON 数组（人工切换为空数组）
    pub evidence_sets: String,
    pub timestamp: i64,
}

crud!(ModeTransitionEntity {}, "mode_transitions");

/// 启动恢复用：每个策略最近一次迁移后的模式
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LatestModeRow {
    pub strategy_id: String,
    pub to_mode: String,
}

pub struct ModeTransitionModel {
    db: &'static RBatis,
}

impl ModeTransitionModel {
    pub async fn new() -> Self {
        Self {
            db: db::get_db_client(),
        }
    }

    pub async fn add(&self, transition: &ModeTransition) -> anyhow::Result<ExecResult> {
        let entity = ModeTransitionEntity {
            strategy_id: transition.strategy_id.clone(),
            from_mode: transition.from.to_string(),
            to_mode: transition.to.to_string(),
            reason: transition.reason.clone(),
            evidence_sets: serde_json::to_string(&transition.evidence_sets)?,
            timestamp: transition.timestamp,
        };
        let data = ModeTransitionEntity::insert(self.db, &entity).await?;
        Ok(data)
    }

    pub async fn list_by_strategy(
        &self,
        strategy_id: &str,
    ) -> anyhow::Result<Vec<ModeTransitionEntity>> {
        let data =
            ModeTransitionEntity::select_by_map(self.db, value! {"strategy_id": strategy_id})
                .await?;
        Ok(data)
    }

    /// 每个策略按时间取最后一条迁移的目标模式
    pub async fn latest_modes(&self) -> anyhow::Result<Vec<LatestModeRow>> {
        let sql = r#"
            select t.strategy_id, t.to_mode
            from mode_transitions t
            inner join (
                select strategy_id, max(timestamp) as ts
                from mode_transitions
                group by strategy_id
            ) last on t.strategy_id = last.strategy_id and t.timestamp = last.ts
        "#;
        let data: Vec<LatestModeRow> = self.db.query_decode(sql, vec![]).await?;
        Ok(data)
    }
}
