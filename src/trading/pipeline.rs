//! 信号处理管道
//!
//! 每条告警走一条显式的顺序流水线：
//! 接入 → 策略模式判定 → 风控评估 → 路由 → 执行 → 落账 → 绩效记录。
//! 同一 (strategy_id, account_id) 的意图持键级互斥锁串行处理，
//! 不同键之间并发互不阻塞。
//!
//! 风控评估前先拍组合快照，评估期间快照不变；所有状态修改都
//! 发生在成交确认之后。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::trading::account::ledger::FundedAccountLedger;
use crate::trading::account::{Account, AccountRegistry, PositionBook};
use crate::time_util;
use crate::trading::broker::{
    Broker, BrokerAdapter, BrokerKind, ExecutionError, Fill, Order, OrderReport, OrderStatus,
    OrderType, PlaceOrderParams, TradeMode,
};
use crate::trading::ingest::{AlertIngestor, IngestError, OrderIntent, TradeAction};
use crate::trading::model::order_record::OrderRecordEntity;
use crate::trading::paper::{PaperError, PaperTradingSimulator};
use crate::trading::risk::{self, contract_multiplier, DenyReason, PortfolioState, RiskConfig, RiskDecision};
use crate::trading::router::{OrderRouter, PaperTarget, RouteTarget, RoutingError, SymbolClass};
use crate::trading::services::{NotificationService, PerformanceService};
use crate::trading::strategy::performance_tracker::{StrategyPerformanceTracker, TradeOutcome};
use crate::trading::strategy::StrategyMode;

/// 模拟通道账户的初始资金
const PAPER_ACCOUNT_BALANCE: f64 = 100_000.0;

/// 管道错误：每一层失败都具名上抛，API 层据此映射状态码
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error("风控拒绝: {0}")]
    Denied(DenyReason),

    #[error("策略已暂停: {0}")]
    StrategySuspended(String),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Paper(#[from] PaperError),
}

/// 一条告警处理成功的产出
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub alert_id: String,
    pub order_id: String,
    pub status: String,
    pub mode: TradeMode,
    /// 执行通道描述（券商名或模拟目标）
    pub route: String,
    pub fill_price: Option<f64>,
    pub realized_pnl: Option<f64>,
}

/// 信号处理管道
pub struct SignalPipeline {
    ingestor: AlertIngestor,
    tracker: Arc<StrategyPerformanceTracker>,
    router: Arc<OrderRouter>,
    live_brokers: HashMap<BrokerKind, Arc<Broker>>,
    /// demo/sandbox/paper 通道的真实券商适配器，缺失时兜底内部模拟器
    paper_brokers: HashMap<PaperTarget, Arc<Broker>>,
    simulator: Arc<PaperTradingSimulator>,
    accounts: Arc<AccountRegistry>,
    positions: Arc<PositionBook>,
    risk_config: RiskConfig,
    performance: Arc<PerformanceService>,
    notifier: Arc<NotificationService>,
    /// (strategy_id, account_id) 串行锁
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SignalPipeline {
    pub fn new(
        ingestor: AlertIngestor,
        tracker: Arc<StrategyPerformanceTracker>,
        router: Arc<OrderRouter>,
        simulator: Arc<PaperTradingSimulator>,
        accounts: Arc<AccountRegistry>,
    ) -> Self {
        Self {
            ingestor,
            tracker,
            router,
            live_brokers: HashMap::new(),
            paper_brokers: HashMap::new(),
            simulator,
            accounts,
            positions: Arc::new(PositionBook::new()),
            risk_config: RiskConfig::default(),
            performance: Arc::new(PerformanceService::new()),
            notifier: Arc::new(NotificationService::new()),
            locks: DashMap::new(),
        }
    }

    pub fn with_risk_config(mut self, config: RiskConfig) -> Self {
        self.risk_config = config;
        self
    }

    pub fn add_live_broker(&mut self, kind: BrokerKind, broker: Arc<Broker>) {
        self.live_brokers.insert(kind, broker);
    }

    pub fn add_paper_broker(&mut self, target: PaperTarget, broker: Arc<Broker>) {
        self.paper_brokers.insert(target, broker);
    }

    pub fn tracker(&self) -> &Arc<StrategyPerformanceTracker> {
        &self.tracker
    }

    pub fn accounts(&self) -> &Arc<AccountRegistry> {
        &self.accounts
    }

    fn serial_lock(&self, strategy_id: &str, account_id: &str) -> Arc<Mutex<()>> {
        let key = format!("{}:{}", strategy_id, account_id);
        self.locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// 模拟通道账户按账户组惰性注册
    fn paper_account(&self, account_group: &str) -> Arc<tokio::sync::RwLock<Account>> {
        let account_id = format!("SIM-{}", account_group);
        if let Some(acc) = self.accounts.get(&account_id) {
            return acc;
        }
        self.accounts.register(Account::new(
            &account_id,
            "sim",
            PAPER_ACCOUNT_BALANCE,
            PAPER_ACCOUNT_BALANCE,
        ));
        self.accounts.get(&account_id).expect("just registered")
    }

    /// 处理一条原始告警（完整流水线）
    pub async fn process(
        &self,
        raw_body: &[u8],
        signature: &str,
    ) -> Result<PipelineOutcome, PipelineError> {
        // 1. 接入：签名 → 解析 → 去重
        let intent = self.ingestor.ingest(raw_body, signature).await?;

        // 2. 策略当前模式（首次引用即注册为 LIVE）
        let mode = self.tracker.record_entry(&intent.strategy_id).await;
        if mode == StrategyMode::Suspended {
            warn!(strategy_id = %intent.strategy_id, "策略已暂停，信号丢弃");
            return Err(PipelineError::StrategySuspended(intent.strategy_id));
        }

        // 3. 路由（PAPER 模式无条件走模拟通道）
        let target = self.router.route(&intent, mode)?;
        let account_handle = match &target {
            RouteTarget::Live { account_id, .. } => {
                self.accounts.get(account_id).ok_or_else(|| {
                    RoutingError::UnknownAccountGroup(intent.account_group.clone())
                })?
            }
            RouteTarget::Paper(_) => self.paper_account(&intent.account_group),
        };

        // 同一 (strategy, account) 串行
        let account_id = account_handle.read().await.account_id.clone();
        let lock = self.serial_lock(&intent.strategy_id, &account_id);
        let _guard = lock.lock().await;

        // 4. 风控评估：对快照做纯函数判定
        let account_snapshot = {
            let mut acc = account_handle.write().await;
            FundedAccountLedger::roll_trading_day(&mut acc, Utc::now());
            acc.clone()
        };
        let portfolio = PortfolioState {
            equity: account_snapshot.balance,
            symbol_exposure: self.positions.exposure_by_symbol(&account_id),
            mark_prices: HashMap::new(),
            trading_halted: false,
        };
        match risk::evaluate(
            &intent,
            &account_snapshot,
            &portfolio,
            &self.risk_config,
            Utc::now(),
        ) {
            RiskDecision::Allow => {}
            RiskDecision::Deny(reason) => {
                warn!(
                    alert_id = %intent.alert_id,
                    strategy_id = %intent.strategy_id,
                    %reason,
                    "风控拒绝"
                );
                return Err(PipelineError::Denied(reason));
            }
        }

        // 5. 执行
        let (fill, route_desc, status) = self.execute(&intent, &target, &account_id).await?;

        // 6-7 只在成交确认后发生；working/pending 订单等券商回报或对账
        if status == OrderStatus::Filled {
            // 6. 落账：资助账户规则在成交确认后事务性更新
            {
                let mut acc = account_handle.write().await;
                if let Some(event) = FundedAccountLedger::apply_fill(&mut acc, &fill) {
                    self.notifier.notify_risk_breach(&event).await;
                }
            }

            // 7. 绩效：平仓计入当前评估集，可能触发封存与模式迁移
            if intent.action == TradeAction::Close {
                self.record_close(&intent.strategy_id, &fill).await;
            }
        }

        self.performance
            .persist_fill(&intent, &fill, &status.to_string())
            .await;

        info!(
            alert_id = %intent.alert_id,
            order_id = %fill.order_id,
            route = %route_desc,
            mode = %fill.mode,
            "信号处理完成"
        );
        Ok(PipelineOutcome {
            alert_id: intent.alert_id,
            order_id: fill.order_id,
            status: status.to_string(),
            mode: fill.mode,
            route: route_desc,
            fill_price: (status == OrderStatus::Filled).then_some(fill.fill_price),
            realized_pnl: (status == OrderStatus::Filled).then_some(fill.realized_pnl),
        })
    }

    /// 按路由目标执行：实盘/模拟券商通道或内部模拟器
    async fn execute(
        &self,
        intent: &OrderIntent,
        target: &RouteTarget,
        account_id: &str,
    ) -> Result<(Fill, String, OrderStatus), PipelineError> {
        match target {
            RouteTarget::Live { broker, account_id } => {
                let adapter = self.live_brokers.get(broker).ok_or_else(|| {
                    RoutingError::NoBrokerForSymbolClass(
                        SymbolClass::classify(&intent.symbol).to_string(),
                    )
                })?;
                let (fill, status) = self
                    .place_with_broker(adapter, intent, account_id, TradeMode::Live)
                    .await?;
                Ok((fill, broker.to_string(), status))
            }
            RouteTarget::Paper(paper_target) => {
                if let Some(adapter) = self.paper_brokers.get(paper_target) {
                    let (fill, status) = self
                        .place_with_broker(adapter, intent, account_id, TradeMode::Paper)
                        .await?;
                    Ok((fill, format!("{:?}", paper_target), status))
                } else {
                    // 无对应 demo/sandbox 通道时兜底内部模拟器，成交即时确认
                    let fill = self.simulator.execute(intent).await?;
                    Ok((fill, "InternalSimulator".to_string(), OrderStatus::Filled))
                }
            }
        }
    }

    async fn place_with_broker(
        &self,
        adapter: &Arc<Broker>,
        intent: &OrderIntent,
        account_id: &str,
        mode: TradeMode,
    ) -> Result<(Fill, OrderStatus), PipelineError> {
        let params = PlaceOrderParams {
            account_id: account_id.to_string(),
            symbol: intent.symbol.clone(),
            side: intent.action,
            quantity: intent.quantity,
            order_type: if intent.requested_price.is_some() {
                OrderType::Limit
            } else {
                OrderType::Market
            },
            price: intent.requested_price,
            client_order_id: intent.alert_id.clone(),
        };

        let order = match adapter.place_order(params).await {
            Ok(order) => order,
            Err(ExecutionError::BrokerTimeout(secs)) => {
                // 超时不等于失败：记 pending 等对账，不得重复下单
                self.performance
                    .persist_pending(intent, &intent.alert_id, account_id, mode)
                    .await;
                return Err(ExecutionError::BrokerTimeout(secs).into());
            }
            Err(e) => return Err(e.into()),
        };

        let status = order.status;
        Ok((self.fill_from_order(intent, &order, account_id, mode), status))
    }

    /// 从券商回执构造成交回报，并维护头寸簿 / 结算平仓盈亏
    fn fill_from_order(
        &self,
        intent: &OrderIntent,
        order: &Order,
        account_id: &str,
        mode: TradeMode,
    ) -> Fill {
        let fill_price = order
            .fill_price
            .or(intent.requested_price)
            .unwrap_or(0.0);
        let commission = order.commission.unwrap_or(0.0);
        let multiplier = contract_multiplier(SymbolClass::classify(&intent.symbol));

        let realized_pnl = match intent.action {
            TradeAction::Buy | TradeAction::Sell => {
                if order.status == OrderStatus::Filled {
                    self.positions.open(
                        account_id,
                        &intent.symbol,
                        intent.action,
                        intent.quantity,
                        fill_price,
                    );
                }
                0.0
            }
            // 头寸只随确认成交变动：working/pending 的平仓单留待对账结算
            TradeAction::Close => {
                if order.status == OrderStatus::Filled {
                    match self.positions.close(account_id, &intent.symbol) {
                        Some(pos) => {
                            let direction =
                                if pos.side == TradeAction::Buy { 1.0 } else { -1.0 };
                            (fill_price - pos.avg_price) * pos.quantity * multiplier * direction
                        }
                        None => 0.0,
                    }
                } else {
                    0.0
                }
            }
        };

        Fill {
            order_id: order.order_id.clone(),
            account_id: account_id.to_string(),
            symbol: intent.symbol.clone(),
            side: intent.action,
            quantity: intent.quantity,
            fill_price,
            commission,
            realized_pnl,
            mode,
            timestamp: order.created_at,
        }
    }

    /// 事后结算：对账确认成交的订单补走落账与绩效（券商同步回执
    /// 非终态时，成交要等 get_order_report 确认才到达这里）
    ///
    /// 与实时路径共用 (strategy, account) 串行锁，按对账确认顺序入账
    pub async fn settle_confirmed_fill(
        &self,
        record: &OrderRecordEntity,
        report: &OrderReport,
    ) -> Option<Fill> {
        if report.status != OrderStatus::Filled {
            return None;
        }
        let action = match record.side.as_str() {
            "buy" => TradeAction::Buy,
            "sell" => TradeAction::Sell,
            "close" => TradeAction::Close,
            other => {
                warn!(order_id = %record.order_id, side = other, "无法识别的订单方向，跳过结算");
                return None;
            }
        };
        let mode = if record.mode == "paper" {
            TradeMode::Paper
        } else {
            TradeMode::Live
        };

        let lock = self.serial_lock(&record.strategy_id, &record.account_id);
        let _guard = lock.lock().await;

        let fill_price = report
            .fill_price
            .or(record.fill_price)
            .unwrap_or(0.0);
        let quantity = report.filled_quantity.unwrap_or(record.quantity);
        let multiplier = contract_multiplier(SymbolClass::classify(&record.symbol));
        let realized_pnl = match action {
            TradeAction::Buy | TradeAction::Sell => {
                self.positions.open(
                    &record.account_id,
                    &record.symbol,
                    action,
                    quantity,
                    fill_price,
                );
                0.0
            }
            TradeAction::Close => match self.positions.close(&record.account_id, &record.symbol) {
                Some(pos) => {
                    let direction = if pos.side == TradeAction::Buy { 1.0 } else { -1.0 };
                    (fill_price - pos.avg_price) * pos.quantity * multiplier * direction
                }
                None => 0.0,
            },
        };

        let fill = Fill {
            order_id: record.order_id.clone(),
            account_id: record.account_id.clone(),
            symbol: record.symbol.clone(),
            side: action,
            quantity,
            fill_price,
            commission: record.commission.unwrap_or(0.0),
            realized_pnl,
            mode,
            timestamp: time_util::now_timestamp_mills(),
        };

        if let Some(handle) = self.accounts.get(&record.account_id) {
            let mut acc = handle.write().await;
            if let Some(event) = FundedAccountLedger::apply_fill(&mut acc, &fill) {
                self.notifier.notify_risk_breach(&event).await;
            }
        }
        if action == TradeAction::Close {
            self.record_close(&record.strategy_id, &fill).await;
        }
        info!(
            order_id = %fill.order_id,
            account_id = %fill.account_id,
            fill_price,
            realized_pnl,
            "对账确认成交已结算"
        );
        Some(fill)
    }

    /// 人工切换策略模式：迁移同样落库并公告
    pub async fn force_strategy_mode(
        &self,
        strategy_id: &str,
        mode: StrategyMode,
    ) -> Result<crate::trading::strategy::ModeTransition, crate::trading::strategy::performance_tracker::TrackerError>
    {
        let transition = self.tracker.force_mode(strategy_id, mode).await?;
        self.performance.persist_transition(&transition).await;
        self.notifier.notify_mode_transition(&transition).await;
        Ok(transition)
    }

    /// 平仓后的绩效记录：封存集与模式迁移都在这里落库并公告
    async fn record_close(&self, strategy_id: &str, fill: &Fill) {
        let trade_mode = match fill.mode {
            TradeMode::Live => StrategyMode::Live,
            TradeMode::Paper => StrategyMode::Paper,
        };
        let multiplier = contract_multiplier(SymbolClass::classify(&fill.symbol));
        let outcome = TradeOutcome {
            trade_id: fill.order_id.clone(),
            symbol: fill.symbol.clone(),
            entry_price: fill.fill_price
                - fill.realized_pnl / (fill.quantity.max(1e-9) * multiplier),
            exit_price: fill.fill_price,
            quantity: fill.quantity,
            side: fill.side,
            pnl: fill.realized_pnl,
            mode: trade_mode,
            timestamp: fill.timestamp,
        };
        let record = self.tracker.record_exit(strategy_id, outcome).await;

        if let Some(sealed) = &record.sealed_set {
            self.performance.persist_sealed_set(sealed).await;
        }
        if let Some(transition) = &record.transition {
            self.performance.persist_transition(transition).await;
            self.notifier.notify_mode_transition(transition).await;
        }
    }
}
