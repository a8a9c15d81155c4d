//! 信号接入管道
//!
//! 接收外部图表/告警系统推送的原始信号，完成三件事：
//! 1. HMAC-SHA256 签名校验（对原始 body，十六进制编码）
//! 2. 载荷字段校验并归一化为内部 OrderIntent
//! 3. 幂等去重：同一幂等 key 在窗口期内重复投递返回 DuplicateAlert，
//!    调用方必须能区分"重复被拒"与"已接收"

pub mod dedup;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::time_util;
use dedup::DedupStore;

/// 信号接入错误
#[derive(Error, Debug)]
pub enum IngestError {
    /// 签名校验失败
    #[error("签名校验失败")]
    InvalidSignature,

    /// 载荷格式错误（缺字段或类型不对）
    #[error("载荷格式错误: {0}")]
    MalformedPayload(String),

    /// 窗口期内重复告警
    #[error("重复告警: {0}")]
    DuplicateAlert(String),

    /// 去重存储不可用
    #[error("去重存储错误: {0}")]
    DedupStore(String),
}

/// 交易动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeAction {
    Buy,
    Sell,
    Close,
}

impl std::fmt::Display for TradeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeAction::Buy => write!(f, "buy"),
            TradeAction::Sell => write!(f, "sell"),
            TradeAction::Close => write!(f, "close"),
        }
    }
}

/// 外部告警的原始载荷（webhook JSON body）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertPayload {
    pub symbol: String,
    pub action: TradeAction,
    pub quantity: f64,
    pub strategy: String,
    pub account_group: String,
    pub price: Option<f64>,
    pub comment: Option<String>,
    /// 信号产生时间（毫秒时间戳），缺省时以接收时间参与幂等 key
    pub timestamp: Option<i64>,
    /// 发送方防重放随机串，缺省时退化为 body 摘要
    pub nonce: Option<String>,
}

/// 订单意图：校验通过后的内部归一化表示，不可变，只被风控消费一次
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub alert_id: String,
    pub symbol: String,
    pub action: TradeAction,
    pub quantity: f64,
    pub strategy_id: String,
    pub account_group: String,
    pub requested_price: Option<f64>,
    pub received_at: i64,
}

/// 信号接入器
pub struct AlertIngestor {
    /// 预共享密钥（HMAC）
    secret: String,
    dedup: DedupStore,
    /// 去重窗口（秒）
    window_secs: u64,
}

impl AlertIngestor {
    pub fn new(secret: String, dedup: DedupStore, window_secs: u64) -> Self {
        Self {
            secret,
            dedup,
            window_secs,
        }
    }

    /// 校验签名头（对原始 body 做 HMAC-SHA256，hex 编码）
    pub fn verify_signature(&self, raw_body: &[u8], signature_hex: &str) -> Result<(), IngestError> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret.as_bytes())
            .map_err(|_| IngestError::InvalidSignature)?;
        mac.update(raw_body);
        let expected = hex::encode(mac.finalize().into_bytes());
        // 常数时间比较交给 hmac::verify 不可行（签名是 hex 字符串），这里统一小写后比较
        if expected.eq_ignore_ascii_case(signature_hex.trim()) {
            Ok(())
        } else {
            warn!("webhook signature mismatch");
            Err(IngestError::InvalidSignature)
        }
    }

    /// 解析并校验载荷字段
    pub fn parse_payload(&self, raw_body: &[u8]) -> Result<AlertPayload, IngestError> {
        let payload: AlertPayload = serde_json::from_slice(raw_body)
            .map_err(|e| IngestError::MalformedPayload(e.to_string()))?;
        if payload.symbol.trim().is_empty() {
            return Err(IngestError::MalformedPayload("symbol 为空".to_string()));
        }
        if payload.strategy.trim().is_empty() {
            return Err(IngestError::MalformedPayload("strategy 为空".to_string()));
        }
        if payload.account_group.trim().is_empty() {
            return Err(IngestError::MalformedPayload(
                "account_group 为空".to_string(),
            ));
        }
        if !payload.quantity.is_finite() || payload.quantity <= 0.0 {
            return Err(IngestError::MalformedPayload(format!(
                "quantity 非法: {}",
                payload.quantity
            )));
        }
        if let Some(px) = payload.price {
            if !px.is_finite() || px <= 0.0 {
                return Err(IngestError::MalformedPayload(format!("price 非法: {}", px)));
            }
        }
        Ok(payload)
    }

    /// 计算幂等 key：(strategy, symbol, timestamp, nonce) 的 SHA256
    ///
    /// timestamp/nonce 缺省时用 body 摘要兜底，保证同一 body 的重放必然命中
    pub fn idempotency_key(&self, payload: &AlertPayload, raw_body: &[u8]) -> String {
        let body_digest = hex::encode(Sha256::digest(raw_body));
        let ts = payload
            .timestamp
            .map(|v| v.to_string())
            .unwrap_or_else(|| body_digest.clone());
        let nonce = payload.nonce.clone().unwrap_or(body_digest);
        let input = format!("{}:{}:{}:{}", payload.strategy, payload.symbol, ts, nonce);
        hex::encode(Sha256::digest(input.as_bytes()))
    }

    /// 完整接入流程：签名 → 解析 → 去重 → 产出恰好一个 OrderIntent
    pub async fn ingest(
        &self,
        raw_body: &[u8],
        signature_hex: &str,
    ) -> Result<OrderIntent, IngestError> {
        self.verify_signature(raw_body, signature_hex)?;
        let payload = self.parse_payload(raw_body)?;

        let key = self.idempotency_key(&payload, raw_body);
        let claimed = self
            .dedup
            .try_claim(&key, self.window_secs)
            .await
            .map_err(|e| IngestError::DedupStore(e.to_string()))?;
        if !claimed {
            info!(
                strategy = %payload.strategy,
                symbol = %payload.symbol,
                "窗口期内重复告警，已拒绝"
            );
            return Err(IngestError::DuplicateAlert(key));
        }

        let intent = OrderIntent {
            alert_id: Uuid::new_v4().to_string(),
            symbol: payload.symbol,
            action: payload.action,
            quantity: payload.quantity,
            strategy_id: payload.strategy,
            account_group: payload.account_group,
            requested_price: payload.price,
            received_at: time_util::now_timestamp_mills(),
        };
        debug!("alert accepted: {:?}", intent);
        Ok(intent)
    }
}
