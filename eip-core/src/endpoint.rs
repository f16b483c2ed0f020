//! 端点（Endpoint）契约
//!
//! 端点按 URI 寻址（`scheme:path?k=v&...`），可创建：
//! - 生产者（Producer）：把交换送往端点；
//! - 消费者（Consumer）：从端点接收交换并交给路由处理器。
//!
//! 具体组件（direct/seda/mock 等）在运行时 crate 中实现，核心只依赖 `EndpointResolver`。
//!
use crate::error::{EipError, EipResult};
use crate::exchange::Exchange;
use crate::processor::SharedProcessor;
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[async_trait]
pub trait Producer: Send + Sync {
    fn endpoint_uri(&self) -> &str;

    async fn send(&self, exchange: &mut Exchange) -> anyhow::Result<()>;
}

pub type SharedProducer = Arc<dyn Producer>;

#[async_trait]
pub trait Consumer: Send + Sync {
    fn endpoint_uri(&self) -> &str;

    async fn start(&self) -> EipResult<()>;

    async fn stop(&self) -> EipResult<()>;

    /// 已接收但尚未交给处理器的交换数（队列型端点关闭时等待）
    fn pending(&self) -> usize {
        0
    }
}

#[async_trait]
pub trait Endpoint: Send + Sync {
    fn uri(&self) -> &str;

    async fn create_producer(&self) -> EipResult<SharedProducer>;

    async fn create_consumer(&self, processor: SharedProcessor) -> EipResult<Box<dyn Consumer>>;
}

pub type SharedEndpoint = Arc<dyn Endpoint>;

/// 按 URI 解析（必要时创建）端点
pub trait EndpointResolver: Send + Sync {
    fn resolve(&self, uri: &str) -> EipResult<SharedEndpoint>;
}

pub type SharedResolver = Arc<dyn EndpointResolver>;

/// 解析后的端点 URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointUri {
    scheme: String,
    path: String,
    params: BTreeMap<String, String>,
}

impl EndpointUri {
    pub fn parse(uri: &str) -> EipResult<Self> {
        let invalid = |reason: &str| EipError::InvalidUri {
            uri: uri.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = uri.trim();
        let (scheme, rest) = trimmed
            .split_once(':')
            .ok_or_else(|| invalid("missing scheme separator ':'"))?;
        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(invalid("scheme must be non-empty alphanumeric"));
        }
        let rest = rest.trim_start_matches("//");
        let (path, query) = match rest.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (rest, None),
        };
        if path.is_empty() {
            return Err(invalid("path must not be empty"));
        }

        let mut params = BTreeMap::new();
        for pair in query.into_iter().flat_map(|q| q.split('&')).filter(|p| !p.is_empty()) {
            let (k, v) = pair
                .split_once('=')
                .ok_or_else(|| invalid("query parameter without '='"))?;
            params.insert(k.to_string(), v.to_string());
        }

        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            path: path.to_string(),
            params,
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn param_as<T: FromStr>(&self, key: &str) -> EipResult<Option<T>>
    where
        T::Err: fmt::Display,
    {
        self.param(key)
            .map(|raw| {
                raw.parse::<T>().map_err(|e| EipError::InvalidUri {
                    uri: self.to_string(),
                    reason: format!("parameter '{key}': {e}"),
                })
            })
            .transpose()
    }

    /// 不含参数的端点键：`scheme:path`
    pub fn key(&self) -> String {
        format!("{}:{}", self.scheme, self.path)
    }
}

impl fmt::Display for EndpointUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme, self.path)?;
        for (i, (k, v)) in self.params.iter().enumerate() {
            write!(f, "{}{k}={v}", if i == 0 { '?' } else { '&' })?;
        }
        Ok(())
    }
}

impl FromStr for EndpointUri {
    type Err = EipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

pub const DEFAULT_PRODUCER_CACHE_SIZE: usize = 1000;

/// 生产者缓存：动态路由（收件人列表、路由单）按 URI 复用生产者
///
/// 容量为负时禁用缓存，为 0 时取默认容量；超出容量按插入顺序淘汰最旧者。
pub struct ProducerCache {
    resolver: SharedResolver,
    capacity: Option<usize>,
    producers: Mutex<IndexMap<String, SharedProducer>>,
}

impl ProducerCache {
    pub fn new(resolver: SharedResolver, cache_size: i32) -> Self {
        let capacity = match cache_size {
            n if n < 0 => None,
            0 => Some(DEFAULT_PRODUCER_CACHE_SIZE),
            n => Some(n as usize),
        };
        Self {
            resolver,
            capacity,
            producers: Mutex::new(IndexMap::new()),
        }
    }

    pub fn resolver(&self) -> &SharedResolver {
        &self.resolver
    }

    pub async fn acquire(&self, uri: &str) -> EipResult<SharedProducer> {
        let cached = self.producers.lock().get(uri).cloned();
        if let Some(hit) = cached {
            return Ok(hit);
        }

        let endpoint = self.resolver.resolve(uri)?;
        let producer = endpoint.create_producer().await?;

        if let Some(capacity) = self.capacity {
            let mut producers = self.producers.lock();
            producers.insert(uri.to_string(), producer.clone());
            while producers.len() > capacity {
                producers.shift_remove_index(0);
            }
        }
        Ok(producer)
    }

    pub fn size(&self) -> usize {
        self.producers.lock().len()
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity.is_some()
    }
}
