//! 组件：按 URI scheme 创建端点
//!
//! 内置进程内组件：
//! - `direct`：同步交接，生产者在调用方任务上直接运行消费路由；
//! - `seda`：有界队列 + 并发消费者，支持请求-应答；
//! - `mock`：记录收到的交换，支持期望断言与注入行为（测试用）。
//!
use crate::error::{RuntimeError, RuntimeResult};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use eip_core::endpoint::{EndpointResolver, EndpointUri, SharedEndpoint};
use eip_core::error::{EipError, EipResult};
use std::sync::Arc;

mod direct;
mod mock;
mod seda;

pub use direct::DirectComponent;
pub use mock::{MockComponent, MockEndpoint};
pub use seda::{SedaComponent, SedaConfig, WaitForTaskToComplete};

pub trait Component: Send + Sync {
    fn create_endpoint(&self, uri: &EndpointUri) -> EipResult<SharedEndpoint>;
}

pub type SharedComponent = Arc<dyn Component>;

/// 组件与端点注册表；作为上下文的 `EndpointResolver`
#[derive(Default)]
pub struct ComponentRegistry {
    components: DashMap<String, SharedComponent>,
    endpoints: DashMap<String, SharedEndpoint>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, scheme: impl Into<String>, component: SharedComponent) -> RuntimeResult<()> {
        let scheme = scheme.into().to_ascii_lowercase();
        match self.components.entry(scheme) {
            Entry::Occupied(entry) => {
                Err(RuntimeError::DuplicateComponent(entry.key().clone()))
            }
            Entry::Vacant(entry) => {
                entry.insert(component);
                Ok(())
            }
        }
    }

    pub fn component(&self, scheme: &str) -> Option<SharedComponent> {
        self.components.get(scheme).map(|c| c.value().clone())
    }

    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.components.iter().map(|e| e.key().clone()).collect();
        schemes.sort();
        schemes
    }

    /// 已创建的端点数
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }
}

impl EndpointResolver for ComponentRegistry {
    fn resolve(&self, uri: &str) -> EipResult<SharedEndpoint> {
        let parsed = EndpointUri::parse(uri)?;
        let key = parsed.to_string();
        if let Some(endpoint) = self.endpoints.get(&key) {
            return Ok(endpoint.value().clone());
        }
        let component = self
            .component(parsed.scheme())
            .ok_or_else(|| EipError::NoSuchEndpoint {
                uri: uri.to_string(),
            })?;
        let endpoint = self
            .endpoints
            .entry(key)
            .or_try_insert_with(|| component.create_endpoint(&parsed))?
            .value()
            .clone();
        Ok(endpoint)
    }
}
