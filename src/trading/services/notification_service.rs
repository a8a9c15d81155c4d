//! 通知服务
//!
//! 模式迁移与风控熔断必须"被看见"：结构化日志之外再发一封
//! 邮件。SMTP 未配置时静默降级为只记日志。

use tracing::{error, warn};

use crate::app_config::email;
use crate::trading::account::ledger::RiskBreachEvent;
use crate::trading::strategy::ModeTransition;

pub struct NotificationService;

impl NotificationService {
    pub fn new() -> Self {
        Self
    }

    /// 模式迁移公告
    pub async fn notify_mode_transition(&self, transition: &ModeTransition) {
        warn!(
            strategy_id = %transition.strategy_id,
            from = %transition.from,
            to = %transition.to,
            reason = %transition.reason,
            evidence_sets = ?transition.evidence_sets,
            "策略模式迁移公告"
        );
        let title = format!(
            "策略模式迁移: {} {} -> {}",
            transition.strategy_id, transition.from, transition.to
        );
        let body = format!(
            "策略 {} 由 {} 切换为 {}\n原因: {}\n证据集: {:?}\n时间戳: {}",
            transition.strategy_id,
            transition.from,
            transition.to,
            transition.reason,
            transition.evidence_sets,
            transition.timestamp
        );
        email::send_email(&title, body).await;
    }

    /// 资助账户熔断告警
    pub async fn notify_risk_breach(&self, event: &RiskBreachEvent) {
        error!(
            account_id = %event.account_id,
            kind = ?event.kind,
            value = event.value,
            limit = event.limit,
            "资助账户风控熔断告警"
        );
        let title = format!("资助账户熔断: {} {:?}", event.account_id, event.kind);
        let body = format!(
            "账户 {} 触发 {:?}\n当前值: {:.2}，限额: {:.2}\n该账户新订单已全部拒绝，等待交易日重置或人工处理",
            event.account_id, event.kind, event.value, event.limit
        );
        email::send_email(&title, body).await;
    }

    /// 对账耗尽，订单进入人工审查
    pub async fn notify_order_needs_review(&self, order_id: &str, broker: &str) {
        error!(order_id, broker, "订单状态对账耗尽，标记人工审查");
        let title = format!("订单待人工审查: {}", order_id);
        let body = format!(
            "订单 {}（券商 {}）超时后连续对账失败，状态置为 unknown。\n请人工核对券商侧终态。",
            order_id, broker
        );
        email::send_email(&title, body).await;
    }
}
