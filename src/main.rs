use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use anyhow::Context;
use dotenv::dotenv;
use serde::Deserialize;
use tracing::{info, warn};

use signal_trader::app_config::{self, db, env::env_parse_or};
use signal_trader::job;
use signal_trader::trading::account::{Account, AccountRegistry, FundedAccountRules};
use signal_trader::trading::broker::{
    AlpacaAdapter, Broker, BrokerKind, TastytradeAdapter, TradovateAdapter,
};
use signal_trader::trading::ingest::dedup::DedupStore;
use signal_trader::trading::ingest::AlertIngestor;
use signal_trader::trading::paper::{PaperTradingSimulator, StaticQuoteSource};
use signal_trader::trading::pipeline::SignalPipeline;
use signal_trader::trading::router::{OrderRouter, PaperTarget};
use signal_trader::trading::services::{
    NotificationService, PerformanceService, ReconciliationService,
};
use signal_trader::trading::strategy::performance_tracker::{
    StrategyPerformanceTracker, TrackerConfig,
};
use signal_trader::api::{create_router, AppState};

/// 账户组 → 实盘绑定（ACCOUNT_GROUP_BINDINGS 环境变量，JSON）
#[derive(Debug, Deserialize)]
struct BindingConfig {
    broker: BrokerKind,
    account_id: String,
}

/// 资助账户配置（FUNDED_ACCOUNTS 环境变量，JSON 数组）
#[derive(Debug, Deserialize)]
struct FundedAccountConfig {
    account_id: String,
    platform: String,
    balance: f64,
    buying_power: f64,
    max_daily_loss: f64,
    max_contracts: f64,
    trailing_drawdown: f64,
    profit_target: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    app_config::log::setup_logging().await?;

    // 持久化按需启用：未配置 DB_HOST 时引擎以纯内存方式运行
    if env::var("DB_HOST").is_ok() {
        db::init_db().await?;
        info!("数据库已连接");
    } else {
        warn!("未配置 DB_HOST，审计记录不落库");
    }

    let secret = env::var("WEBHOOK_SECRET").context("WEBHOOK_SECRET config is none")?;
    let dedup = match app_config::redis::get_redis_connection().await {
        Ok(conn) => {
            info!("redis 去重存储就绪");
            DedupStore::redis(conn)
        }
        Err(e) => {
            warn!("redis 不可用（{}），退化为进程内去重", e);
            DedupStore::memory()
        }
    };
    let ingestor = AlertIngestor::new(secret, dedup, app_config::redis::dedup_window_secs());

    let tracker_config = TrackerConfig {
        evaluation_period: env_parse_or("EVALUATION_PERIOD", 20usize),
        min_win_rate: env_parse_or("MIN_WIN_RATE", 55.0f64),
        consecutive_fails_to_paper: env_parse_or("CONSECUTIVE_FAILS_TO_PAPER", 2usize),
        consecutive_wins_to_live: env_parse_or("CONSECUTIVE_WINS_TO_LIVE", 2usize),
        override_resets_open_set: app_config::env::env_is_true("OVERRIDE_RESETS_OPEN_SET", false),
    };
    let tracker = Arc::new(StrategyPerformanceTracker::new(tracker_config));

    // 崩溃重启后先还原策略模式与集编号，再接收任何信号
    if db::is_db_ready() {
        let restored = PerformanceService::new().rehydrate(&tracker).await?;
        if restored > 0 {
            info!(count = restored, "策略状态恢复完成");
        }
    }

    // 账户组绑定与资助账户注册
    let router = Arc::new(OrderRouter::new());
    if let Ok(raw) = env::var("ACCOUNT_GROUP_BINDINGS") {
        let bindings: HashMap<String, BindingConfig> =
            serde_json::from_str(&raw).context("ACCOUNT_GROUP_BINDINGS 解析失败")?;
        for (group, cfg) in bindings {
            router.bind(&group, cfg.broker, &cfg.account_id);
        }
    }
    let accounts = Arc::new(AccountRegistry::new());
    if let Ok(raw) = env::var("FUNDED_ACCOUNTS") {
        let configs: Vec<FundedAccountConfig> =
            serde_json::from_str(&raw).context("FUNDED_ACCOUNTS 解析失败")?;
        for cfg in configs {
            let account =
                Account::new(&cfg.account_id, &cfg.platform, cfg.balance, cfg.buying_power)
                    .with_funded_rules(FundedAccountRules {
                        max_daily_loss: cfg.max_daily_loss,
                        max_contracts: cfg.max_contracts,
                        trailing_drawdown: cfg.trailing_drawdown,
                        profit_target: cfg.profit_target,
                    });
            info!(account_id = %account.account_id, "注册资助账户");
            accounts.register(account);
        }
    }

    // 内部模拟器（PAPER_QUOTES 可预置参考价）
    let quotes = StaticQuoteSource::new();
    if let Ok(raw) = env::var("PAPER_QUOTES") {
        let prices: HashMap<String, f64> =
            serde_json::from_str(&raw).context("PAPER_QUOTES 解析失败")?;
        for (symbol, price) in prices {
            quotes.set_price(&symbol, price);
        }
    }
    let simulator = Arc::new(PaperTradingSimulator::new(
        env_parse_or("PAPER_INITIAL_BALANCE", 100_000.0f64),
        Arc::new(quotes),
    ));

    let mut pipeline = SignalPipeline::new(
        ingestor,
        Arc::clone(&tracker),
        Arc::clone(&router),
        simulator,
        Arc::clone(&accounts),
    );

    // 券商适配器按凭证可用性逐个启用
    let mut live_brokers: HashMap<BrokerKind, Arc<Broker>> = HashMap::new();
    if env::var("TRADOVATE_USERNAME").is_ok() {
        let live = Arc::new(Broker::Tradovate(TradovateAdapter::new(false)?));
        let demo = Arc::new(Broker::Tradovate(TradovateAdapter::new(true)?));
        pipeline.add_live_broker(BrokerKind::Tradovate, Arc::clone(&live));
        pipeline.add_paper_broker(PaperTarget::FuturesDemo, demo);
        live_brokers.insert(BrokerKind::Tradovate, live);
        info!("Tradovate 适配器已启用");
    }
    if env::var("TASTYTRADE_LOGIN").is_ok() {
        let live = Arc::new(Broker::Tastytrade(TastytradeAdapter::new(false)?));
        let sandbox = Arc::new(Broker::Tastytrade(TastytradeAdapter::new(true)?));
        pipeline.add_live_broker(BrokerKind::Tastytrade, Arc::clone(&live));
        pipeline.add_paper_broker(PaperTarget::OptionsSandbox, sandbox);
        live_brokers.insert(BrokerKind::Tastytrade, live);
        info!("Tastytrade 适配器已启用");
    }
    if env::var("ALPACA_API_KEY").is_ok() {
        let live = Arc::new(Broker::Alpaca(AlpacaAdapter::new(false)?));
        let paper = Arc::new(Broker::Alpaca(AlpacaAdapter::new(true)?));
        pipeline.add_live_broker(BrokerKind::Alpaca, Arc::clone(&live));
        pipeline.add_paper_broker(PaperTarget::EquitiesPaper, paper);
        live_brokers.insert(BrokerKind::Alpaca, live);
        info!("Alpaca 适配器已启用");
    }

    let pipeline = Arc::new(pipeline);

    // 调度器：交易日切换 + 未决订单对账
    let notifier = Arc::new(NotificationService::new());
    let reconciliation = Arc::new(ReconciliationService::new(
        live_brokers,
        notifier,
        Arc::clone(&pipeline),
    ));
    let _scheduler = job::start_scheduler(Arc::clone(&accounts), reconciliation).await?;

    // HTTP 服务
    let state = AppState::new(pipeline);
    let app = create_router(state);
    let addr = format!(
        "0.0.0.0:{}",
        app_config::env::env_or_default("HTTP_PORT", "8080")
    );
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("webhook 服务监听 {}", addr);

    tokio::select! {
        result = axum::serve(listener, app) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("收到 Ctrl+C，退出");
        }
    }

    Ok(())
}
