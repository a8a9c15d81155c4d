//! 订单对账
//!
//! 券商调用超时不等于失败：订单可能已被接受。对账服务按指数退避
//! 轮询券商侧订单回执，最多三次；确认成交的订单走与实时路径相同的
//! 结算（落账 + 绩效），全部失败时把记录标成 unknown 并通知人工
//! 审查，绝不自行裁定成败。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_retry::strategy::ExponentialBackoff;
use tracing::{info, warn};

use crate::app_config::db;
use crate::error::app_error::AppError;
use crate::time_util;
use crate::trading::broker::{Broker, BrokerAdapter, BrokerKind, OrderReport, OrderStatus};
use crate::trading::model::order_record::OrderRecordModel;
use crate::trading::pipeline::SignalPipeline;
use crate::trading::services::NotificationService;

/// 对账重试次数
pub const RECONCILE_MAX_ATTEMPTS: usize = 3;

pub struct ReconciliationService {
    brokers: HashMap<BrokerKind, Arc<Broker>>,
    notifier: Arc<NotificationService>,
    pipeline: Arc<SignalPipeline>,
}

impl ReconciliationService {
    pub fn new(
        brokers: HashMap<BrokerKind, Arc<Broker>>,
        notifier: Arc<NotificationService>,
        pipeline: Arc<SignalPipeline>,
    ) -> Self {
        Self {
            brokers,
            notifier,
            pipeline,
        }
    }

    /// 对账单笔订单：3 次指数退避轮询，成功返回券商侧回执
    ///
    /// 返回 None 表示重试耗尽仍联系不上券商，状态未知
    pub async fn reconcile_order(
        &self,
        kind: BrokerKind,
        order_id: &str,
    ) -> Option<OrderReport> {
        let broker = self.brokers.get(&kind)?.clone();
        let mut delays = ExponentialBackoff::from_millis(2)
            .factor(250)
            .max_delay(Duration::from_secs(10))
            .take(RECONCILE_MAX_ATTEMPTS - 1);

        loop {
            match broker.get_order_report(order_id).await {
                Ok(report) => {
                    info!(order_id, status = %report.status, "对账取得券商侧回执");
                    return Some(report);
                }
                Err(e) => match delays.next() {
                    Some(delay) => {
                        warn!(order_id, "对账轮询失败，{}ms 后重试: {}", delay.as_millis(), e);
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        warn!(order_id, "对账重试耗尽，状态未知: {}", e);
                        return None;
                    }
                },
            }
        }
    }

    /// 对账一轮：扫描所有未决订单
    pub async fn run_once(&self) -> Result<(), AppError> {
        if !db::is_db_ready() {
            return Ok(());
        }
        let model = OrderRecordModel::new().await;
        let unsettled = model.list_unsettled().await?;
        if unsettled.is_empty() {
            return Ok(());
        }
        info!(count = unsettled.len(), "开始未决订单对账");

        for record in unsettled {
            let kind = match record.mode.as_str() {
                "paper" => continue, // 模拟成交即时终态，不会滞留 pending
                _ => match broker_kind_of(&record.account_id) {
                    Some(k) => k,
                    None => continue,
                },
            };
            match self.reconcile_order(kind, &record.order_id).await {
                Some(report) => match report.status {
                    OrderStatus::Filled => {
                        // 确认成交：先走实时路径同款结算，再更新记录
                        let fill = self.pipeline.settle_confirmed_fill(&record, &report).await;
                        model
                            .update_status(
                                &record.order_id,
                                &report.status.to_string(),
                                report.fill_price,
                                fill.map(|f| f.realized_pnl),
                                time_util::now_timestamp_mills(),
                            )
                            .await?;
                    }
                    OrderStatus::Unknown => {
                        // 券商侧回执无法解读，与联系不上同等对待
                        self.mark_unresolved(&model, &record.order_id, kind).await?;
                    }
                    status => {
                        model
                            .update_status(
                                &record.order_id,
                                &status.to_string(),
                                None,
                                None,
                                time_util::now_timestamp_mills(),
                            )
                            .await?;
                    }
                },
                None => {
                    self.mark_unresolved(&model, &record.order_id, kind).await?;
                }
            }
        }
        Ok(())
    }

    async fn mark_unresolved(
        &self,
        model: &OrderRecordModel,
        order_id: &str,
        kind: BrokerKind,
    ) -> Result<(), AppError> {
        model
            .mark_needs_review(order_id, time_util::now_timestamp_mills())
            .await?;
        self.notifier
            .notify_order_needs_review(order_id, &kind.to_string())
            .await;
        Ok(())
    }
}

/// 按账户 id 前缀推断券商（注册账户时约定的前缀）
fn broker_kind_of(account_id: &str) -> Option<BrokerKind> {
    if account_id.starts_with("T-") {
        Some(BrokerKind::Tradovate)
    } else if account_id.starts_with("TT-") {
        Some(BrokerKind::Tastytrade)
    } else if account_id.starts_with("A-") {
        Some(BrokerKind::Alpaca)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading::account::AccountRegistry;
    use crate::trading::broker::AlpacaAdapter;
    use crate::trading::ingest::dedup::DedupStore;
    use crate::trading::ingest::AlertIngestor;
    use crate::trading::paper::{PaperTradingSimulator, StaticQuoteSource};
    use crate::trading::router::OrderRouter;
    use crate::trading::strategy::performance_tracker::{
        StrategyPerformanceTracker, TrackerConfig,
    };

    fn minimal_pipeline() -> Arc<SignalPipeline> {
        let ingestor = AlertIngestor::new("secret".to_string(), DedupStore::memory(), 60);
        let tracker = Arc::new(StrategyPerformanceTracker::new(TrackerConfig::default()));
        let router = Arc::new(OrderRouter::new());
        let accounts = Arc::new(AccountRegistry::new());
        let simulator = Arc::new(PaperTradingSimulator::new(
            100_000.0,
            Arc::new(StaticQuoteSource::new()),
        ));
        Arc::new(SignalPipeline::new(
            ingestor, tracker, router, simulator, accounts,
        ))
    }

    #[tokio::test]
    async fn test_reconcile_exhausts_retries_and_stays_unresolved() {
        // 联系不上的券商端点：三次轮询全部失败后必须返回 None，
        // 绝不凭空裁定成败
        std::env::set_var("ALPACA_LIVE_URL", "http://127.0.0.1:59999");
        let adapter = AlpacaAdapter::new(false).unwrap();
        let mut brokers: HashMap<BrokerKind, Arc<Broker>> = HashMap::new();
        brokers.insert(BrokerKind::Alpaca, Arc::new(Broker::Alpaca(adapter)));

        let service = ReconciliationService::new(
            brokers,
            Arc::new(NotificationService::new()),
            minimal_pipeline(),
        );

        let started = std::time::Instant::now();
        let report = service.reconcile_order(BrokerKind::Alpaca, "ord-1").await;
        assert!(report.is_none(), "重试耗尽后不得返回任何状态");
        // 两次退避间隔（500ms + 1000ms）都应真实发生
        assert!(started.elapsed() >= Duration::from_millis(1400));
    }

    #[tokio::test]
    async fn test_reconcile_unknown_broker_kind_returns_none() {
        let service = ReconciliationService::new(
            HashMap::new(),
            Arc::new(NotificationService::new()),
            minimal_pipeline(),
        );
        assert!(service
            .reconcile_order(BrokerKind::Tradovate, "ord-1")
            .await
            .is_none());
    }

    #[test]
    fn test_broker_kind_inferred_from_account_prefix() {
        assert_eq!(broker_kind_of("T-001"), Some(BrokerKind::Tradovate));
        assert_eq!(broker_kind_of("TT-001"), Some(BrokerKind::Tastytrade));
        assert_eq!(broker_kind_of("A-001"), Some(BrokerKind::Alpaca));
        assert_eq!(broker_kind_of("SIM-group"), None);
    }
}
