//! 持久化实体
//!
//! 订单与成交、封存的评估集、模式迁移历史、账户快照。
//! 数据库是审计账本，不参与热路径决策；未配置 DB_HOST 时
//! 引擎以纯内存方式运行，所有写入静默跳过。

pub mod account_snapshot;
pub mod mode_transition;
pub mod order_record;
pub mod strategy_set;
