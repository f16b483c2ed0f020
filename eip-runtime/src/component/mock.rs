//! mock：测试用端点
//!
//! 记录收到的交换，设置期望后用 `assert_is_satisfied` 在超时内等待期望达成；
//! 可为全部或第 N 个交换注入处理行为（例如抛出错误以触发重投）。
//!
use super::Component;
use crate::error::{RuntimeError, RuntimeResult};
use async_trait::async_trait;
use dashmap::DashMap;
use eip_core::endpoint::{
    Consumer, Endpoint, EndpointUri, Producer, SharedEndpoint, SharedProducer,
};
use eip_core::error::{EipError, EipResult};
use eip_core::exchange::Exchange;
use eip_core::processor::SharedProcessor;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
pub struct MockComponent {
    endpoints: DashMap<String, Arc<MockEndpoint>>,
}

impl MockComponent {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按路径取得（必要时创建）mock 端点
    pub fn endpoint(&self, path: &str) -> Arc<MockEndpoint> {
        self.endpoints
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(MockEndpoint::new(format!("mock:{path}"))))
            .value()
            .clone()
    }
}

impl Component for MockComponent {
    fn create_endpoint(&self, uri: &EndpointUri) -> EipResult<SharedEndpoint> {
        Ok(self.endpoint(uri.path()))
    }
}

#[derive(Default)]
struct Expectations {
    message_count: Option<usize>,
    bodies: Option<Vec<Value>>,
    headers: Vec<(String, Value)>,
}

#[derive(Default)]
struct MockState {
    received: Mutex<Vec<Exchange>>,
    expectations: Mutex<Expectations>,
    any_behaviour: Mutex<Option<SharedProcessor>>,
    indexed_behaviour: Mutex<HashMap<usize, SharedProcessor>>,
    arrived: Notify,
}

pub struct MockEndpoint {
    uri: String,
    state: Arc<MockState>,
}

impl MockEndpoint {
    fn new(uri: String) -> Self {
        Self {
            uri,
            state: Arc::new(MockState::default()),
        }
    }

    pub fn expected_message_count(&self, count: usize) {
        self.state.expectations.lock().message_count = Some(count);
    }

    /// 期望按顺序收到这些 body；同时隐含期望的消息数
    pub fn expected_bodies_received<I, V>(&self, bodies: I)
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let bodies: Vec<Value> = bodies.into_iter().map(Into::into).collect();
        let mut expectations = self.state.expectations.lock();
        expectations.message_count = Some(bodies.len());
        expectations.bodies = Some(bodies);
    }

    /// 期望每个收到的交换都带有该头部值
    pub fn expected_header_received(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.state
            .expectations
            .lock()
            .headers
            .push((name.into(), value.into()));
    }

    /// 每个收到的交换都执行该处理器（除非有针对序号的行为）
    pub fn when_any_exchange_received(&self, processor: SharedProcessor) {
        *self.state.any_behaviour.lock() = Some(processor);
    }

    /// 第 `index` 个（从 0 开始）收到的交换执行该处理器
    pub fn when_exchange_received(&self, index: usize, processor: SharedProcessor) {
        self.state.indexed_behaviour.lock().insert(index, processor);
    }

    pub fn received_exchanges(&self) -> Vec<Exchange> {
        self.state.received.lock().clone()
    }

    pub fn received_bodies(&self) -> Vec<Value> {
        self.state
            .received
            .lock()
            .iter()
            .map(|ex| ex.body().clone())
            .collect()
    }

    pub fn received_count(&self) -> usize {
        self.state.received.lock().len()
    }

    /// 清空记录、期望与注入行为
    pub fn reset(&self) {
        self.state.received.lock().clear();
        *self.state.expectations.lock() = Expectations::default();
        *self.state.any_behaviour.lock() = None;
        self.state.indexed_behaviour.lock().clear();
    }

    /// 在 `timeout` 内等待消息数期望达成，然后校验内容期望
    pub async fn assert_is_satisfied(&self, timeout: Duration) -> RuntimeResult<()> {
        let expected = self.state.expectations.lock().message_count;
        if let Some(expected) = expected {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                let arrived = self.state.arrived.notified();
                if self.received_count() >= expected {
                    break;
                }
                if tokio::time::timeout_at(deadline, arrived).await.is_err() {
                    break;
                }
            }
        }
        self.check()
    }

    fn check(&self) -> RuntimeResult<()> {
        let expectations = self.state.expectations.lock();
        let received = self.state.received.lock();

        if let Some(expected) = expectations.message_count
            && received.len() != expected
        {
            return Err(self.failed(format!(
                "expected {expected} messages but received {}",
                received.len()
            )));
        }
        if let Some(bodies) = &expectations.bodies {
            for (index, (expected, exchange)) in bodies.iter().zip(received.iter()).enumerate() {
                if exchange.body() != expected {
                    return Err(self.failed(format!(
                        "message {index} body: expected {expected} but was {}",
                        exchange.body()
                    )));
                }
            }
        }
        for (name, value) in &expectations.headers {
            for (index, exchange) in received.iter().enumerate() {
                if exchange.header(name) != Some(value) {
                    return Err(self.failed(format!(
                        "message {index} header '{name}': expected {value} but was {:?}",
                        exchange.header(name)
                    )));
                }
            }
        }
        Ok(())
    }

    fn failed(&self, reason: String) -> RuntimeError {
        RuntimeError::MockAssertion {
            uri: self.uri.clone(),
            reason,
        }
    }

    fn behaviour_for(&self, index: usize) -> Option<SharedProcessor> {
        if let Some(processor) = self.state.indexed_behaviour.lock().get(&index) {
            return Some(processor.clone());
        }
        self.state.any_behaviour.lock().clone()
    }
}

#[async_trait]
impl Endpoint for MockEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn create_producer(&self) -> EipResult<SharedProducer> {
        Ok(Arc::new(MockProducer {
            endpoint: MockEndpoint {
                uri: self.uri.clone(),
                state: self.state.clone(),
            },
        }))
    }

    async fn create_consumer(&self, _processor: SharedProcessor) -> EipResult<Box<dyn Consumer>> {
        Err(EipError::endpoint(
            &self.uri,
            "mock endpoints cannot be consumed from",
        ))
    }
}

struct MockProducer {
    endpoint: MockEndpoint,
}

#[async_trait]
impl Producer for MockProducer {
    fn endpoint_uri(&self) -> &str {
        &self.endpoint.uri
    }

    async fn send(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let index = {
            let mut received = self.endpoint.state.received.lock();
            received.push(exchange.clone());
            received.len() - 1
        };
        self.endpoint.state.arrived.notify_waiters();

        match self.endpoint.behaviour_for(index) {
            Some(processor) => processor.process(exchange).await,
            None => Ok(()),
        }
    }
}
