use std::env;

use once_cell::sync::OnceCell;
use rbatis::RBatis;
use rbdc_mysql::MysqlDriver;

static DB_CLIENT: OnceCell<RBatis> = OnceCell::new();

/// 初始化数据库连接（进程内单例）
pub async fn init_db() -> anyhow::Result<()> {
    let rb = RBatis::new();
    let url = env::var("DB_HOST").map_err(|_| anyhow::anyhow!("DB_HOST config is none"))?;
    rb.link(MysqlDriver {}, &url).await?;
    DB_CLIENT
        .set(rb)
        .map_err(|_| anyhow::anyhow!("db client already initialized"))?;
    Ok(())
}

/// 获取数据库连接单例
///
/// 必须先调用 init_db，否则 panic（与调度器启动顺序强绑定）
pub fn get_db_client() -> &'static RBatis {
    DB_CLIENT.get().expect("db client not initialized")
}

/// 数据库是否已初始化（测试及无持久化模式下为 false）
pub fn is_db_ready() -> bool {
    DB_CLIENT.get().is_some()
}
