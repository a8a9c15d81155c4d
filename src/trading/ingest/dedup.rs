//! 幂等去重存储
//!
//! 生产环境用 Redis SET NX EX（窗口期自动过期），测试与无 Redis 环境
//! 用进程内存实现。at-least-once 投递下的重放由这里挡住。

use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;
use tracing::debug;

use crate::app_config;
use crate::time_util;

/// 去重存储（闭合变体，不做运行时反射）
pub enum DedupStore {
    Redis(Mutex<MultiplexedConnection>),
    Memory(MemoryDedup),
}

impl DedupStore {
    /// 用已建立的 Redis 连接构造
    pub fn redis(conn: MultiplexedConnection) -> Self {
        DedupStore::Redis(Mutex::new(conn))
    }

    /// 进程内存实现（单实例部署或测试）
    pub fn memory() -> Self {
        DedupStore::Memory(MemoryDedup::new())
    }

    /// 尝试占据幂等 key
    ///
    /// 返回 true 表示首次出现（占据成功），false 表示窗口内重复
    pub async fn try_claim(&self, key: &str, ttl_secs: u64) -> anyhow::Result<bool> {
        match self {
            DedupStore::Redis(conn) => {
                let mut conn = conn.lock().await;
                let redis_key = app_config::redis::alert_dedup_key(key);
                // SET key 1 NX EX ttl
                let res: Option<String> = redis::cmd("SET")
                    .arg(&redis_key)
                    .arg(1)
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl_secs)
                    .query_async(&mut *conn)
                    .await?;
                Ok(res.is_some())
            }
            DedupStore::Memory(mem) => Ok(mem.try_claim(key, ttl_secs)),
        }
    }
}

/// 进程内去重表，懒惰清理过期项
pub struct MemoryDedup {
    /// key -> 过期毫秒时间戳
    entries: DashMap<String, i64>,
}

impl MemoryDedup {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn try_claim(&self, key: &str, ttl_secs: u64) -> bool {
        let now = time_util::now_timestamp_mills();
        // 顺手清掉已过期的 key，避免无上限增长
        self.entries.retain(|_, expire_at| *expire_at > now);

        let expire_at = now + (ttl_secs as i64) * 1000;
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(expire_at);
                debug!("dedup key claimed: {}", key);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_claim_then_duplicate() {
        let mem = MemoryDedup::new();
        assert!(mem.try_claim("k1", 60));
        assert!(!mem.try_claim("k1", 60));
        assert!(mem.try_claim("k2", 60));
    }

    #[test]
    fn test_memory_expired_key_reclaimable() {
        let mem = MemoryDedup::new();
        // ttl 为 0：立即过期
        assert!(mem.try_claim("k1", 0));
        assert!(mem.try_claim("k1", 60));
    }
}
