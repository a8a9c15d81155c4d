//! 对账结算测试：券商同步回执非终态（working）时，成交要等对账
//! 确认后补走落账与绩效。用本地桩端点扮演 Tradovate REST 接口。
//! 统一用加密货币交易对，任何时刻都在交易时段内。

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use signal_trader::time_util;
use signal_trader::trading::account::{Account, AccountRegistry, FundedAccountRules};
use signal_trader::trading::broker::{
    Broker, BrokerKind, OrderStatus, TradovateAdapter,
};
use signal_trader::trading::ingest::dedup::DedupStore;
use signal_trader::trading::ingest::AlertIngestor;
use signal_trader::trading::model::order_record::OrderRecordEntity;
use signal_trader::trading::paper::{PaperTradingSimulator, StaticQuoteSource};
use signal_trader::trading::pipeline::SignalPipeline;
use signal_trader::trading::router::OrderRouter;
use signal_trader::trading::services::{NotificationService, ReconciliationService};
use signal_trader::trading::strategy::performance_tracker::{
    StrategyPerformanceTracker, TrackerConfig,
};

const SECRET: &str = "it-secret";

fn sign(body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).unwrap();
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

fn alert(action: &str, qty: f64, price: f64, nonce: &str) -> Vec<u8> {
    format!(
        r#"{{"symbol":"BTC-USD","action":"{}","quantity":{},"price":{},"strategy":"strat_alpha","account_group":"topstep_001","nonce":"{}"}}"#,
        action, qty, price, nonce
    )
    .into_bytes()
}

/// 极简 HTTP 桩：鉴权、下单（orderId 递增）、订单回执（id=1 @100、id=2 @110）
async fn spawn_broker_stub() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let next_order_id = Arc::new(AtomicI64::new(1));

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let counter = Arc::clone(&next_order_id);
            tokio::spawn(async move {
                loop {
                    let head = match read_request(&mut socket).await {
                        Some(h) => h,
                        None => break,
                    };
                    let body = if head.contains("accesstokenrequest") {
                        r#"{"accessToken":"stub-token","expirationTime":"2030-01-01T00:00:00Z"}"#
                            .to_string()
                    } else if head.contains("placeorder") {
                        let id = counter.fetch_add(1, Ordering::SeqCst);
                        format!(r#"{{"orderId":{}}}"#, id)
                    } else if head.contains("/order/item?id=1") {
                        r#"{"ordStatus":"Filled","avgPx":100.0,"cumQty":2.0}"#.to_string()
                    } else if head.contains("/order/item?id=2") {
                        r#"{"ordStatus":"Filled","avgPx":110.0,"cumQty":2.0}"#.to_string()
                    } else {
                        r#"{}"#.to_string()
                    };
                    let resp = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    if socket.write_all(resp.as_bytes()).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

/// 读完一个请求（头 + Content-Length 指定的体），返回请求头文本
async fn read_request(socket: &mut tokio::net::TcpStream) -> Option<String> {
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..pos]).to_string();
            let content_length = head
                .lines()
                .find(|l| l.to_ascii_lowercase().starts_with("content-length:"))
                .and_then(|l| l.split(':').nth(1))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            let mut have = buf.len() - (pos + 4);
            while have < content_length {
                let n = socket.read(&mut chunk).await.ok()?;
                if n == 0 {
                    return None;
                }
                have += n;
            }
            return Some(head);
        }
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn build_pipeline() -> Arc<SignalPipeline> {
    let ingestor = AlertIngestor::new(SECRET.to_string(), DedupStore::memory(), 60);
    let tracker = Arc::new(StrategyPerformanceTracker::new(TrackerConfig::default()));
    let router = Arc::new(OrderRouter::new());
    router.bind("topstep_001", BrokerKind::Tradovate, "T-001");

    let accounts = Arc::new(AccountRegistry::new());
    accounts.register(
        Account::new("T-001", "tradovate", 50_000.0, 50_000.0).with_funded_rules(
            FundedAccountRules {
                max_daily_loss: 1_000.0,
                max_contracts: 3.0,
                trailing_drawdown: 2_000.0,
                profit_target: 3_000.0,
            },
        ),
    );

    let simulator = Arc::new(PaperTradingSimulator::new(
        100_000.0,
        Arc::new(StaticQuoteSource::new()),
    ));
    Arc::new(SignalPipeline::new(
        ingestor, tracker, router, simulator, accounts,
    ))
}

fn record_for(
    order_id: &str,
    side: &str,
    quantity: f64,
    status: &str,
) -> OrderRecordEntity {
    let now = time_util::now_timestamp_mills();
    OrderRecordEntity {
        order_id: order_id.to_string(),
        client_order_id: format!("alert-{}", order_id),
        alert_id: format!("alert-{}", order_id),
        account_id: "T-001".to_string(),
        strategy_id: "strat_alpha".to_string(),
        symbol: "BTC-USD".to_string(),
        side: side.to_string(),
        quantity,
        status: status.to_string(),
        fill_price: None,
        commission: None,
        realized_pnl: None,
        mode: "live".to_string(),
        needs_review: 0,
        created_at: now,
        updated_at: now,
    }
}

#[tokio::test]
async fn test_broker_confirmed_fill_reaches_ledger_and_tracker() {
    let addr = spawn_broker_stub().await;
    std::env::set_var("TRADOVATE_LIVE_URL", format!("http://{}", addr));

    let mut pipeline_inner = build_pipeline();
    let adapter = Arc::new(Broker::Tradovate(TradovateAdapter::new(false).unwrap()));
    Arc::get_mut(&mut pipeline_inner)
        .unwrap()
        .add_live_broker(BrokerKind::Tradovate, Arc::clone(&adapter));
    let pipeline = pipeline_inner;

    // 同步回执是 working：落账与绩效此时都不得变动
    let body = alert("buy", 2.0, 100.0, "n-1");
    let outcome = pipeline.process(&body, &sign(&body)).await.unwrap();
    assert_eq!(outcome.status, "working");
    assert!(outcome.fill_price.is_none());

    let body = alert("close", 2.0, 110.0, "n-2");
    let outcome_close = pipeline.process(&body, &sign(&body)).await.unwrap();
    assert_eq!(outcome_close.status, "working");

    {
        let handle = pipeline.accounts().get("T-001").unwrap();
        let acc = handle.read().await;
        assert_eq!(acc.metrics.current_daily_pnl, 0.0);
        assert_eq!(acc.balance, 50_000.0);
    }
    assert!(pipeline
        .tracker()
        .snapshot("strat_alpha")
        .await
        .unwrap()
        .current_set
        .trades
        .is_empty());

    // 对账确认：按确认顺序补结算，开仓 @100、平仓 @110
    let mut brokers: HashMap<BrokerKind, Arc<Broker>> = HashMap::new();
    brokers.insert(BrokerKind::Tradovate, adapter);
    let service = ReconciliationService::new(
        brokers,
        Arc::new(NotificationService::new()),
        Arc::clone(&pipeline),
    );

    let buy_record = record_for(&outcome.order_id, "buy", 2.0, "working");
    let report = service
        .reconcile_order(BrokerKind::Tradovate, &outcome.order_id)
        .await
        .expect("桩端点应返回回执");
    assert_eq!(report.status, OrderStatus::Filled);
    assert_eq!(report.fill_price, Some(100.0));
    let fill = pipeline
        .settle_confirmed_fill(&buy_record, &report)
        .await
        .expect("确认成交应结算");
    assert_eq!(fill.realized_pnl, 0.0);

    let close_record = record_for(&outcome_close.order_id, "close", 2.0, "working");
    let report = service
        .reconcile_order(BrokerKind::Tradovate, &outcome_close.order_id)
        .await
        .unwrap();
    let fill = pipeline
        .settle_confirmed_fill(&close_record, &report)
        .await
        .unwrap();
    assert!((fill.realized_pnl - 20.0).abs() < 1e-9);

    // 落账：日内盈亏与余额随确认成交更新
    {
        let handle = pipeline.accounts().get("T-001").unwrap();
        let acc = handle.read().await;
        assert!((acc.metrics.current_daily_pnl - 20.0).abs() < 1e-9);
        assert!((acc.balance - 50_020.0).abs() < 1e-9);
    }
    // 绩效：平仓计入当前评估集
    let snap = pipeline.tracker().snapshot("strat_alpha").await.unwrap();
    assert_eq!(snap.current_set.trades.len(), 1);
    assert!((snap.current_set.trades[0].pnl - 20.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_settle_ignores_non_terminal_report() {
    let pipeline = build_pipeline();
    let record = record_for("77", "buy", 1.0, "working");
    let report = signal_trader::trading::broker::OrderReport {
        order_id: "77".to_string(),
        status: OrderStatus::Working,
        fill_price: None,
        filled_quantity: None,
    };
    assert!(pipeline.settle_confirmed_fill(&record, &report).await.is_none());
}
