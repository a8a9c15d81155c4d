use thiserror::Error;

use crate::trading::broker::ExecutionError;
use crate::trading::ingest::IngestError;
use crate::trading::paper::PaperError;
use crate::trading::risk::DenyReason;
use crate::trading::router::RoutingError;

/// 应用错误
///
/// 各模块的具体错误（签名校验、风控拒绝、路由、执行）在模块内定义，
/// 这里只做应用层的汇聚，供 API 层与任务层统一处理。
#[derive(Error, Debug)]
pub enum AppError {
    /// 信号接入错误
    #[error("信号接入错误: {0}")]
    Ingest(#[from] IngestError),

    /// 风控拒绝
    #[error("风控拒绝: {0}")]
    RiskDenied(#[from] DenyReason),

    /// 订单路由错误
    #[error("订单路由错误: {0}")]
    Routing(#[from] RoutingError),

    /// 券商执行错误
    #[error("券商执行错误: {0}")]
    Execution(#[from] ExecutionError),

    /// 模拟盘错误
    #[error("模拟盘错误: {0}")]
    Paper(#[from] PaperError),

    /// 数据库错误
    #[error("数据库错误: {0}")]
    DbError(String),

    /// 未知错误
    #[error("未知错误: {0}")]
    Unknown(String),
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Unknown(err.to_string())
    }
}

impl From<rbatis::rbdc::Error> for AppError {
    fn from(err: rbatis::rbdc::Error) -> Self {
        AppError::DbError(err.to_string())
    }
}
