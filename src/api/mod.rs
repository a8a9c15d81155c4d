//! HTTP 接入层
//!
//! 入站 webhook 与策略管理端点。处理器只做参数提取与状态码映射，
//! 业务全部委托给管道与追踪器。

pub mod handlers;
pub mod routes;
pub mod state;

pub use routes::create_router;
pub use state::AppState;
