//! 上下文配置
//!
//! 均带默认值，可从 JSON 加载（缺省字段取默认值）。
//!
use eip_core::endpoint::DEFAULT_PRODUCER_CACHE_SIZE;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 路由上下文配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextConfig {
    pub name: String,
    /// 动态路由的生产者缓存容量：负数禁用，0 取默认值
    pub producer_cache_size: i32,
    /// 生产者模板是否复用交换对象
    pub exchange_pooling: bool,
    pub exchange_pool_capacity: usize,
    /// 默认工作池大小（threads、并行扇出）
    pub worker_pool_size: usize,
    pub shutdown: ShutdownConfig,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            name: "eip-context".to_string(),
            producer_cache_size: DEFAULT_PRODUCER_CACHE_SIZE as i32,
            exchange_pooling: false,
            exchange_pool_capacity: 100,
            worker_pool_size: 10,
            shutdown: ShutdownConfig::default(),
        }
    }
}

impl ContextConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// 关闭策略配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShutdownConfig {
    /// 优雅关闭的总超时（毫秒）
    pub timeout_ms: u64,
    /// 按启动顺序的逆序关闭
    pub shutdown_routes_in_reverse_order: bool,
    /// 超时后强制关闭剩余路由并打断等待中的延迟与重投
    pub shutdown_now_on_timeout: bool,
    /// 等待在途交换时的轮询间隔（毫秒）
    pub poll_interval_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 45_000,
            shutdown_routes_in_reverse_order: true,
            shutdown_now_on_timeout: true,
            poll_interval_ms: 100,
        }
    }
}

impl ShutdownConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let cfg = ContextConfig::from_json(
            r#"{"name":"orders","producerCacheSize":-1,"shutdown":{"timeoutMs":500}}"#,
        )
        .unwrap();
        assert_eq!(cfg.name, "orders");
        assert_eq!(cfg.producer_cache_size, -1);
        assert_eq!(cfg.worker_pool_size, 10);
        assert_eq!(cfg.shutdown.timeout(), Duration::from_millis(500));
        assert!(cfg.shutdown.shutdown_routes_in_reverse_order);
        assert!(cfg.shutdown.shutdown_now_on_timeout);
    }

    #[test]
    fn defaults() {
        let cfg = ContextConfig::default();
        assert_eq!(cfg.producer_cache_size, 1000);
        assert_eq!(cfg.shutdown.timeout(), Duration::from_secs(45));
        assert!(!cfg.exchange_pooling);
    }
}
