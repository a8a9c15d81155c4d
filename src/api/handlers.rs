//! 请求处理器
//!
//! 错误到状态码的映射是外部契约：签名错 401、格式错 400、重复 409、
//! 风控拒绝与路由失败 422（带具名原因）、券商侧故障 502。

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;

use crate::api::state::AppState;
use crate::trading::ingest::IngestError;
use crate::trading::pipeline::PipelineError;
use crate::trading::router::RoutingError;
use crate::trading::services::PerformanceService;
use crate::trading::strategy::StrategyMode;

/// 签名头
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

pub async fn health() -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

/// POST /webhook/signal
pub async fn webhook_signal(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    match state.pipeline.process(&body, signature).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({
                "status": "received",
                "alert_id": outcome.alert_id,
                "order_id": outcome.order_id,
                "mode": outcome.mode,
                "route": outcome.route,
                "fill_price": outcome.fill_price,
            })),
        ),
        Err(e) => map_pipeline_error(e),
    }
}

fn map_pipeline_error(e: PipelineError) -> (StatusCode, Json<Value>) {
    let (code, reason) = match &e {
        PipelineError::Ingest(IngestError::InvalidSignature) => {
            (StatusCode::UNAUTHORIZED, "InvalidSignature".to_string())
        }
        PipelineError::Ingest(IngestError::MalformedPayload(_)) => {
            (StatusCode::BAD_REQUEST, "MalformedPayload".to_string())
        }
        PipelineError::Ingest(IngestError::DuplicateAlert(_)) => {
            (StatusCode::CONFLICT, "DuplicateAlert".to_string())
        }
        PipelineError::Ingest(IngestError::DedupStore(_)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "DedupStoreUnavailable".to_string(),
        ),
        // 拒绝原因逐项具名，UI 不允许折叠为 "order failed"
        PipelineError::Denied(reason) => {
            (StatusCode::UNPROCESSABLE_ENTITY, format!("{:?}", reason))
        }
        PipelineError::StrategySuspended(_) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            "StrategySuspended".to_string(),
        ),
        // 路由失败同样逐项具名
        PipelineError::Routing(RoutingError::UnknownAccountGroup(_)) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            "UnknownAccountGroup".to_string(),
        ),
        PipelineError::Routing(RoutingError::NoBrokerForSymbolClass(_)) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            "NoBrokerForSymbolClass".to_string(),
        ),
        PipelineError::Execution(_) | PipelineError::Paper(_) => {
            error!("execution error: {}", e);
            (StatusCode::BAD_GATEWAY, "ExecutionFailed".to_string())
        }
    };
    (
        code,
        Json(json!({
            "status": "rejected",
            "reason": reason,
            "detail": e.to_string(),
        })),
    )
}

/// GET /api/strategies/performance
pub async fn strategies_performance(
    State(state): State<AppState>,
) -> (StatusCode, Json<Value>) {
    let snapshots = state.tracker.snapshots().await;
    let projections: Vec<Value> = snapshots.iter().map(PerformanceService::project).collect();
    (
        StatusCode::OK,
        Json(json!({ "strategies": projections })),
    )
}

#[derive(Debug, Deserialize)]
pub struct SetModeRequest {
    pub mode: String,
}

/// POST /api/strategies/:strategy_id/mode — 人工切换，任何时刻可用
pub async fn set_strategy_mode(
    State(state): State<AppState>,
    Path(strategy_id): Path<String>,
    Json(req): Json<SetModeRequest>,
) -> (StatusCode, Json<Value>) {
    let new_mode = match StrategyMode::from_str_loose(&req.mode) {
        Some(m) => m,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "status": "rejected",
                    "reason": format!("非法模式: {}", req.mode),
                })),
            )
        }
    };

    match state.pipeline.force_strategy_mode(&strategy_id, new_mode).await {
        Ok(transition) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "strategyId": strategy_id,
                "oldMode": transition.from,
                "newMode": transition.to,
            })),
        ),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "status": "rejected", "reason": e.to_string() })),
        ),
    }
}
