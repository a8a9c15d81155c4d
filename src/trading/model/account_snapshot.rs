extern crate rbatis;

use rbatis::rbdc::db::ExecResult;
use rbatis::{crud, RBatis};
use serde::{Deserialize, Serialize};

use crate::app_config::db;
use crate::time_util;
use crate::trading::account::Account;

/// table：账户日终/熔断时点快照
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "snake_case")]
pub struct AccountSnapshotEntity {
    pub account_id: String,
    pub platform: String,
    pub balance: f64,
    pub buying_power: f64,
    pub daily_pnl: f64,
    pub drawdown: f64,
    pub peak_equity: f64,
    pub day_key: String,
    pub breached: Option<String>,
    pub created_at: i64,
}

crud!(AccountSnapshotEntity {}, "account_snapshots");

pub struct AccountSnapshotModel {
    db: &'static RBatis,
}

impl AccountSnapshotModel {
    pub async fn new() -> Self {
        Self {
            db: db::get_db_client(),
        }
    }

    pub async fn add(&self, account: &Account) -> anyhow::Result<ExecResult> {
        let entity = AccountSnapshotEntity {
            account_id: account.account_id.clone(),
            platform: account.platform.clone(),
            balance: account.balance,
            buying_power: account.buying_power,
            daily_pnl: account.metrics.current_daily_pnl,
            drawdown: account.metrics.current_drawdown,
            peak_equity: account.metrics.peak_equity,
            day_key: account.metrics.day_key.clone(),
            breached: account.metrics.breached.map(|k| format!("{:?}", k)),
            created_at: time_util::now_timestamp_mills(),
        };
        let data = AccountSnapshotEntity::insert(self.db, &entity).await?;
        Ok(data)
    }
}
