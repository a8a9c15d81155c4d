//! 端到端管道测试：内存去重 + 内部模拟器，不触网络。
//! 统一用加密货币交易对，任何时刻都在交易时段内。

use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use signal_trader::trading::account::{Account, AccountRegistry, FundedAccountRules};
use signal_trader::trading::broker::{BrokerKind, TradeMode};
use signal_trader::trading::ingest::dedup::DedupStore;
use signal_trader::trading::ingest::{AlertIngestor, IngestError};
use signal_trader::trading::paper::{PaperTradingSimulator, StaticQuoteSource};
use signal_trader::trading::pipeline::{PipelineError, SignalPipeline};
use signal_trader::trading::risk::DenyReason;
use signal_trader::trading::router::OrderRouter;
use signal_trader::trading::strategy::performance_tracker::{
    StrategyPerformanceTracker, TrackerConfig,
};
use signal_trader::trading::strategy::StrategyMode;

const SECRET: &str = "it-secret";

fn sign(body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).unwrap();
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

fn alert(action: &str, qty: f64, price: f64, strategy: &str, group: &str, nonce: &str) -> Vec<u8> {
    format!(
        r#"{{"symbol":"BTC-USD","action":"{}","quantity":{},"price":{},"strategy":"{}","account_group":"{}","nonce":"{}"}}"#,
        action, qty, price, strategy, group, nonce
    )
    .into_bytes()
}

fn build_pipeline() -> SignalPipeline {
    let ingestor = AlertIngestor::new(SECRET.to_string(), DedupStore::memory(), 60);
    let tracker = Arc::new(StrategyPerformanceTracker::new(TrackerConfig::default()));
    let router = Arc::new(OrderRouter::new());
    router.bind("topstep_001", BrokerKind::Tradovate, "T-001");

    let accounts = Arc::new(AccountRegistry::new());
    accounts.register(
        Account::new("T-001", "tradovate", 500_000.0, 500_000.0).with_funded_rules(
            FundedAccountRules {
                max_daily_loss: 1_000.0,
                max_contracts: 3.0,
                trailing_drawdown: 2_000.0,
                profit_target: 3_000.0,
            },
        ),
    );

    let quotes = StaticQuoteSource::new();
    quotes.set_price("BTC-USD", 100.0);
    let simulator = Arc::new(PaperTradingSimulator::new(1_000_000.0, Arc::new(quotes)));

    SignalPipeline::new(ingestor, tracker, router, simulator, accounts)
}

async fn process(
    pipeline: &SignalPipeline,
    body: &[u8],
) -> Result<signal_trader::trading::pipeline::PipelineOutcome, PipelineError> {
    pipeline.process(body, &sign(body)).await
}

#[tokio::test]
async fn test_paper_group_alert_fills_via_simulator() {
    let pipeline = build_pipeline();
    let body = alert("buy", 2.0, 100.0, "S1", "paper_main", "n-1");
    let outcome = process(&pipeline, &body).await.unwrap();
    assert_eq!(outcome.mode, TradeMode::Paper);
    assert_eq!(outcome.route, "InternalSimulator");
    assert_eq!(outcome.status, "filled");
    assert!(outcome.fill_price.unwrap() > 0.0);
}

#[tokio::test]
async fn test_duplicate_alert_rejected_within_window() {
    let pipeline = build_pipeline();
    let body = alert("buy", 1.0, 100.0, "S1", "paper_main", "n-dup");
    process(&pipeline, &body).await.unwrap();
    let err = process(&pipeline, &body).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Ingest(IngestError::DuplicateAlert(_))
    ));
}

#[tokio::test]
async fn test_bad_signature_rejected_before_anything_else() {
    let pipeline = build_pipeline();
    let body = alert("buy", 1.0, 100.0, "S1", "paper_main", "n-sig");
    let err = pipeline.process(&body, "deadbeef").await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Ingest(IngestError::InvalidSignature)
    ));
}

#[tokio::test]
async fn test_max_contracts_denied_no_order_placed() {
    // 资助账户 max_contracts=3，收到 quantity=50 的买入信号：
    // 拒绝原因必须具名，且不产生任何订单
    let pipeline = build_pipeline();
    let body = alert("buy", 50.0, 10.0, "S1", "topstep_001", "n-mc");
    let err = process(&pipeline, &body).await.unwrap_err();
    match err {
        PipelineError::Denied(reason) => {
            assert_eq!(reason, DenyReason::MaxContractsExceeded)
        }
        other => panic!("期望风控拒绝，实际 {:?}", other),
    }
    // 账户未被触碰
    let acc = pipeline.accounts().get("T-001").unwrap();
    assert_eq!(acc.read().await.balance, 500_000.0);
}

#[tokio::test]
async fn test_paper_mode_strategy_routes_paper_despite_live_group() {
    let pipeline = build_pipeline();
    pipeline
        .force_strategy_mode("S-paper", StrategyMode::Paper)
        .await
        .unwrap();

    // 实盘账户组 + PAPER 策略：必须走模拟通道
    let body = alert("buy", 1.0, 100.0, "S-paper", "topstep_001", "n-pm");
    let outcome = process(&pipeline, &body).await.unwrap();
    assert_eq!(outcome.mode, TradeMode::Paper);
    assert_eq!(outcome.route, "InternalSimulator");
}

#[tokio::test]
async fn test_suspended_strategy_drops_signal() {
    let pipeline = build_pipeline();
    pipeline
        .force_strategy_mode("S-stop", StrategyMode::Suspended)
        .await
        .unwrap();
    let body = alert("buy", 1.0, 100.0, "S-stop", "paper_main", "n-sus");
    let err = process(&pipeline, &body).await.unwrap_err();
    assert!(matches!(err, PipelineError::StrategySuspended(_)));
}

#[tokio::test]
async fn test_round_trip_realizes_pnl_and_counts_toward_set() {
    let pipeline = build_pipeline();
    let open = alert("buy", 1.0, 100.0, "S2", "paper_main", "n-open");
    process(&pipeline, &open).await.unwrap();

    let close = alert("close", 1.0, 110.0, "S2", "paper_main", "n-close");
    let outcome = process(&pipeline, &close).await.unwrap();
    assert!(outcome.realized_pnl.unwrap() > 0.0);

    // 平仓计入当前评估集
    let snap = pipeline.tracker().snapshot("S2").await.unwrap();
    assert_eq!(snap.current_set.trades.len(), 1);
    assert!(snap.current_set.trades[0].win);
}

#[tokio::test]
async fn test_twenty_closes_seal_a_set_through_the_pipeline() {
    let pipeline = build_pipeline();
    for i in 0..20 {
        let open = alert("buy", 1.0, 100.0, "S3", "paper_main", &format!("o-{}", i));
        process(&pipeline, &open).await.unwrap();
        let close = alert("close", 1.0, 90.0, "S3", "paper_main", &format!("c-{}", i));
        process(&pipeline, &close).await.unwrap();
    }
    let snap = pipeline.tracker().snapshot("S3").await.unwrap();
    assert_eq!(snap.completed_sets.len(), 1);
    let sealed = &snap.completed_sets[0];
    assert_eq!(sealed.trades.len(), 20);
    assert_eq!(sealed.win_rate, Some(0.0));
    assert_eq!(snap.current_set.set_number, 2);
}
