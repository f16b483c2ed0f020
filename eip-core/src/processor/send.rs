use super::{Processor, SharedProcessor};
use crate::endpoint::{ProducerCache, SharedProducer};
use crate::error::EipError;
use crate::exchange::{Exchange, keys::property};
use async_trait::async_trait;
use std::sync::Arc;

/// 发送到固定端点
pub struct SendProcessor {
    uri: String,
    producers: Arc<ProducerCache>,
}

impl SendProcessor {
    pub fn new(uri: impl Into<String>, producers: Arc<ProducerCache>) -> Self {
        Self {
            uri: uri.into(),
            producers,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

#[async_trait]
impl Processor for SendProcessor {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        exchange.set_property(property::TO_ENDPOINT, self.uri.clone());
        let producer = self.producers.acquire(&self.uri).await?;
        producer.send(exchange).await
    }
}

/// 把已取得的生产者当作处理器使用（动态路由的分支）
pub(crate) struct ProducerStep {
    producer: SharedProducer,
}

impl ProducerStep {
    pub(crate) fn shared(producer: SharedProducer) -> SharedProcessor {
        Arc::new(Self { producer })
    }
}

#[async_trait]
impl Processor for ProducerStep {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        exchange.set_property(property::TO_ENDPOINT, self.producer.endpoint_uri().to_string());
        self.producer.send(exchange).await
    }
}

/// 端点 URI 无法解析的错误（可被 `ignoreInvalidEndpoints` 忽略）
pub(crate) fn is_invalid_endpoint(err: &EipError) -> bool {
    matches!(
        err,
        EipError::NoSuchEndpoint { .. } | EipError::InvalidUri { .. }
    )
}
