use std::env;

use anyhow::Result;
use redis::aio::MultiplexedConnection;
use redis::Client;

/// Get a Redis multiplexed async connection using REDIS_HOST from env
pub async fn get_redis_connection() -> Result<MultiplexedConnection> {
    let url = env::var("REDIS_HOST").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
    let client = Client::open(url)?;
    let conn = client.get_multiplexed_async_connection().await?;
    Ok(conn)
}

/// 告警去重 key
pub fn alert_dedup_key(idempotency_key: &str) -> String {
    format!("alert_dedup:{}", idempotency_key)
}

/// 去重窗口时长（秒），默认 60
pub fn dedup_window_secs() -> u64 {
    env::var("DEDUP_WINDOW_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(60u64)
}
