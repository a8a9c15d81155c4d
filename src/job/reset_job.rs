//! 交易日切换任务
//!
//! 22:00 UTC 对全部账户滚动交易日：重置日内盈亏并解除日内熔断
//! （跟踪回撤熔断跨日保留）。DB 就绪时顺带写一份账户快照。

use chrono::Utc;
use tracing::info;

use crate::app_config::db;
use crate::trading::account::ledger::FundedAccountLedger;
use crate::trading::account::AccountRegistry;
use crate::trading::model::account_snapshot::AccountSnapshotModel;

pub async fn run_daily_reset(accounts: &AccountRegistry) {
    let ids = accounts.account_ids();
    info!(count = ids.len(), "开始交易日切换");
    for id in ids {
        let Some(handle) = accounts.get(&id) else { continue };
        let snapshot = {
            let mut acc = handle.write().await;
            FundedAccountLedger::roll_trading_day(&mut acc, Utc::now());
            acc.clone()
        };
        if db::is_db_ready() {
            let model = AccountSnapshotModel::new().await;
            if let Err(e) = model.add(&snapshot).await {
                tracing::error!(account_id = %id, "账户快照落库失败: {}", e);
            }
        }
    }
}
