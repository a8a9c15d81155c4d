extern crate rbatis;

use rbatis::rbdc::db::ExecResult;
use rbatis::{crud, RBatis};
use rbs::Value;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::app_config::db;

/// table
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "snake_case")]
pub struct OrderRecordEntity {
    pub order_id: String,
    pub client_order_id: String,
    pub alert_id: String,
    pub account_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub side: String,
    pub quantity: f64,
    pub status: String,
    pub fill_price: Option<f64>,
    pub commission: Option<f64>,
    pub realized_pnl: Option<f64>,
    pub mode: String,
    /// 对账重试耗尽后置 1，等待人工审查
    pub needs_review: i32,
    pub created_at: i64,
    pub updated_at: i64,
}

crud!(OrderRecordEntity {}, "order_records");

/// Option<f64> 绑定：None 必须落成 SQL NULL，COALESCE 才能保住旧值
fn bind_opt_f64(v: Option<f64>) -> Value {
    v.map(Value::F64).unwrap_or(Value::Null)
}

pub struct OrderRecordModel {
    db: &'static RBatis,
}

impl OrderRecordModel {
    pub async fn new() -> Self {
        Self {
            db: db::get_db_client(),
        }
    }

    pub async fn add(&self, record: &OrderRecordEntity) -> anyhow::Result<ExecResult> {
        let data = OrderRecordEntity::insert(self.db, record).await?;
        debug!(order_id = %record.order_id, "订单记录落库");
        Ok(data)
    }

    /// 状态流转（pending → working/filled/rejected/cancelled/unknown）
    pub async fn update_status(
        &self,
        order_id: &str,
        status: &str,
        fill_price: Option<f64>,
        realized_pnl: Option<f64>,
        updated_at: i64,
    ) -> anyhow::Result<u64> {
        let sql = r#"
            UPDATE order_records
            SET status = ?,
                fill_price = COALESCE(?, fill_price),
                realized_pnl = COALESCE(?, realized_pnl),
                updated_at = ?
            WHERE order_id = ?
        "#;
        let params = vec![
            Value::String(status.to_string()),
            bind_opt_f64(fill_price),
            bind_opt_f64(realized_pnl),
            Value::I64(updated_at),
            Value::String(order_id.to_string()),
        ];
        let result = self.db.exec(sql, params).await?;
        Ok(result.rows_affected)
    }

    /// 对账耗尽：终态 unknown + 人工审查标记
    pub async fn mark_needs_review(&self, order_id: &str, updated_at: i64) -> anyhow::Result<u64> {
        let sql = r#"
            UPDATE order_records
            SET status = 'unknown', needs_review = 1, updated_at = ?
            WHERE order_id = ?
        "#;
        let params = vec![
            Value::I64(updated_at),
            Value::String(order_id.to_string()),
        ];
        let result = self.db.exec(sql, params).await?;
        Ok(result.rows_affected)
    }

    /// 未决订单（对账轮询的输入）
    pub async fn list_unsettled(&self) -> anyhow::Result<Vec<OrderRecordEntity>> {
        let data: Vec<OrderRecordEntity> = self
            .db
            .query_decode(
                "select * from order_records where status in ('pending', 'working')",
                vec![],
            )
            .await?;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_fill_price_binds_sql_null() {
        // COALESCE(?, fill_price) 只有在参数为 NULL 时才保留旧值；
        // 空字符串会把已落库的成交价冲掉
        assert_eq!(bind_opt_f64(None), Value::Null);
        assert_eq!(bind_opt_f64(Some(101.25)), Value::F64(101.25));
    }
}
