//! 定时任务
//!
//! 两个 cron 任务：交易日切换时重置日内盈亏，以及未决订单对账轮询。
//! 调度器操作与业务解耦，任务内部只拿 Arc 句柄。

pub mod reset_job;

use std::sync::Arc;

use anyhow::Result;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::trading::account::AccountRegistry;
use crate::trading::services::ReconciliationService;

/// 交易日切换 cron（22:00 UTC，对应 CME 17:00 ET 收盘）
pub const DAILY_RESET_CRON: &str = "0 0 22 * * *";

/// 对账轮询 cron（每分钟）
pub const RECONCILE_CRON: &str = "0 * * * * *";

/// 装配并启动调度器
pub async fn start_scheduler(
    accounts: Arc<AccountRegistry>,
    reconciliation: Arc<ReconciliationService>,
) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    {
        let accounts = Arc::clone(&accounts);
        let job = Job::new_async(DAILY_RESET_CRON, move |_uuid, _lock| {
            let accounts = Arc::clone(&accounts);
            Box::pin(async move {
                reset_job::run_daily_reset(&accounts).await;
            })
        })?;
        scheduler.add(job).await?;
    }

    {
        let reconciliation = Arc::clone(&reconciliation);
        let job = Job::new_async(RECONCILE_CRON, move |_uuid, _lock| {
            let reconciliation = Arc::clone(&reconciliation);
            Box::pin(async move {
                if let Err(e) = reconciliation.run_once().await {
                    error!("对账任务失败: {}", e);
                }
            })
        })?;
        scheduler.add(job).await?;
    }

    scheduler.start().await?;
    info!("调度器已启动: 日内重置 + 订单对账");
    Ok(scheduler)
}
