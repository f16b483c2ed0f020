use super::Component;
use async_trait::async_trait;
use dashmap::DashMap;
use eip_core::endpoint::{
    Consumer, Endpoint, EndpointUri, Producer, SharedEndpoint, SharedProducer,
};
use eip_core::error::{EipError, EipResult};
use eip_core::exchange::Exchange;
use eip_core::processor::SharedProcessor;
use parking_lot::RwLock;
use std::sync::Arc;

/// 同一路径的所有端点共享一个通道，最多一个消费者
#[derive(Default)]
struct DirectChannel {
    consumer: RwLock<Option<SharedProcessor>>,
}

#[derive(Default)]
pub struct DirectComponent {
    channels: DashMap<String, Arc<DirectChannel>>,
}

impl DirectComponent {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前有消费者的路径数
    pub fn active_consumers(&self) -> usize {
        self.channels
            .iter()
            .filter(|c| c.value().consumer.read().is_some())
            .count()
    }
}

impl Component for DirectComponent {
    fn create_endpoint(&self, uri: &EndpointUri) -> EipResult<SharedEndpoint> {
        let channel = self
            .channels
            .entry(uri.path().to_string())
            .or_default()
            .value()
            .clone();
        Ok(Arc::new(DirectEndpoint {
            uri: uri.to_string(),
            channel,
        }))
    }
}

struct DirectEndpoint {
    uri: String,
    channel: Arc<DirectChannel>,
}

#[async_trait]
impl Endpoint for DirectEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn create_producer(&self) -> EipResult<SharedProducer> {
        Ok(Arc::new(DirectProducer {
            uri: self.uri.clone(),
            channel: self.channel.clone(),
        }))
    }

    async fn create_consumer(&self, processor: SharedProcessor) -> EipResult<Box<dyn Consumer>> {
        Ok(Box::new(DirectConsumer {
            uri: self.uri.clone(),
            channel: self.channel.clone(),
            processor,
        }))
    }
}

struct DirectProducer {
    uri: String,
    channel: Arc<DirectChannel>,
}

#[async_trait]
impl Producer for DirectProducer {
    fn endpoint_uri(&self) -> &str {
        &self.uri
    }

    async fn send(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let consumer = self.channel.consumer.read().clone();
        match consumer {
            Some(processor) => processor.process(exchange).await,
            None => Err(EipError::NoConsumers {
                uri: self.uri.clone(),
            }
            .into()),
        }
    }
}

struct DirectConsumer {
    uri: String,
    channel: Arc<DirectChannel>,
    processor: SharedProcessor,
}

#[async_trait]
impl Consumer for DirectConsumer {
    fn endpoint_uri(&self) -> &str {
        &self.uri
    }

    async fn start(&self) -> EipResult<()> {
        let mut slot = self.channel.consumer.write();
        if slot.is_some() {
            return Err(EipError::endpoint(
                &self.uri,
                "direct endpoint already has a consumer",
            ));
        }
        *slot = Some(self.processor.clone());
        Ok(())
    }

    async fn stop(&self) -> EipResult<()> {
        self.channel.consumer.write().take();
        Ok(())
    }
}
