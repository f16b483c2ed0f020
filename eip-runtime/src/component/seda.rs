//! seda：进程内有界队列
//!
//! - 生产者把交换副本放入队列；默认只携带消息，`carryProperties=true` 时连同属性与变量；
//! - 请求-应答（`InOut` 或 `waitForTaskToComplete=Always`）时等待消费者处理完成并带回结果，
//!   设置 `variableReceive` 时结果 body 存入该变量而不替换消息；
//! - 消费者按 `concurrentConsumers` 启动多个任务竞争消费，停止时各任务完成当前交换后退出。
//!
//! URI 参数：`size`、`concurrentConsumers`、`waitForTaskToComplete`、`timeout`、
//! `blockWhenFull`、`carryProperties`、`variableReceive`。
//!
use super::Component;
use async_trait::async_trait;
use dashmap::DashMap;
use eip_core::endpoint::{
    Consumer, Endpoint, EndpointUri, Producer, SharedEndpoint, SharedProducer,
};
use eip_core::error::{EipError, EipResult};
use eip_core::exchange::{Exchange, ExchangePattern};
use eip_core::processor::{SharedProcessor, process_capturing};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WaitForTaskToComplete {
    Never,
    #[default]
    IfReplyExpected,
    Always,
}

impl FromStr for WaitForTaskToComplete {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "never" => Ok(Self::Never),
            "ifreplyexpected" => Ok(Self::IfReplyExpected),
            "always" => Ok(Self::Always),
            other => Err(format!("unknown waitForTaskToComplete value '{other}'")),
        }
    }
}

/// seda 端点配置；组件级默认值可被 URI 参数覆盖
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SedaConfig {
    /// 队列容量（首次创建该路径的队列时生效）
    pub size: usize,
    pub concurrent_consumers: usize,
    pub wait_for_task_to_complete: WaitForTaskToComplete,
    /// 请求-应答的等待超时（毫秒）
    pub timeout_ms: u64,
    /// 队列满时阻塞等待，否则立即失败
    pub block_when_full: bool,
    /// 携带交换属性与变量
    pub carry_properties: bool,
}

impl Default for SedaConfig {
    fn default() -> Self {
        Self {
            size: 1000,
            concurrent_consumers: 1,
            wait_for_task_to_complete: WaitForTaskToComplete::default(),
            timeout_ms: 30_000,
            block_when_full: false,
            carry_properties: false,
        }
    }
}

impl SedaConfig {
    fn with_params(&self, uri: &EndpointUri) -> EipResult<Self> {
        let mut cfg = self.clone();
        if let Some(size) = uri.param_as("size")? {
            cfg.size = size;
        }
        if let Some(n) = uri.param_as("concurrentConsumers")? {
            cfg.concurrent_consumers = n;
        }
        if let Some(wait) = uri.param_as("waitForTaskToComplete")? {
            cfg.wait_for_task_to_complete = wait;
        }
        if let Some(timeout) = uri.param_as("timeout")? {
            cfg.timeout_ms = timeout;
        }
        if let Some(block) = uri.param_as("blockWhenFull")? {
            cfg.block_when_full = block;
        }
        if let Some(carry) = uri.param_as("carryProperties")? {
            cfg.carry_properties = carry;
        }
        if cfg.size == 0 {
            return Err(EipError::InvalidUri {
                uri: uri.to_string(),
                reason: "size must be positive".to_string(),
            });
        }
        Ok(cfg)
    }
}

struct SedaItem {
    exchange: Exchange,
    reply: Option<oneshot::Sender<Exchange>>,
}

struct SedaQueue {
    tx: mpsc::Sender<SedaItem>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<SedaItem>>>,
}

impl SedaQueue {
    fn new(size: usize) -> Self {
        let (tx, rx) = mpsc::channel(size);
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }

    fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

#[derive(Default)]
pub struct SedaComponent {
    defaults: SedaConfig,
    queues: DashMap<String, Arc<SedaQueue>>,
}

impl SedaComponent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults(defaults: SedaConfig) -> Self {
        Self {
            defaults,
            queues: DashMap::new(),
        }
    }

    /// 指定路径队列中待消费的交换数
    pub fn queue_size(&self, path: &str) -> usize {
        self.queues.get(path).map(|q| q.pending()).unwrap_or(0)
    }
}

impl Component for SedaComponent {
    fn create_endpoint(&self, uri: &EndpointUri) -> EipResult<SharedEndpoint> {
        let config = self.defaults.with_params(uri)?;
        let queue = self
            .queues
            .entry(uri.path().to_string())
            .or_insert_with(|| Arc::new(SedaQueue::new(config.size)))
            .value()
            .clone();
        Ok(Arc::new(SedaEndpoint {
            uri: uri.to_string(),
            variable_receive: uri.param("variableReceive").map(str::to_string),
            config,
            queue,
        }))
    }
}

struct SedaEndpoint {
    uri: String,
    config: SedaConfig,
    variable_receive: Option<String>,
    queue: Arc<SedaQueue>,
}

#[async_trait]
impl Endpoint for SedaEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn create_producer(&self) -> EipResult<SharedProducer> {
        Ok(Arc::new(SedaProducer {
            uri: self.uri.clone(),
            config: self.config.clone(),
            variable_receive: self.variable_receive.clone(),
            queue: self.queue.clone(),
        }))
    }

    async fn create_consumer(&self, processor: SharedProcessor) -> EipResult<Box<dyn Consumer>> {
        Ok(Box::new(SedaConsumer {
            uri: self.uri.clone(),
            concurrent_consumers: self.config.concurrent_consumers.max(1),
            queue: self.queue.clone(),
            processor,
            token: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
        }))
    }
}

struct SedaProducer {
    uri: String,
    config: SedaConfig,
    variable_receive: Option<String>,
    queue: Arc<SedaQueue>,
}

impl SedaProducer {
    fn wait_for_reply(&self, exchange: &Exchange) -> bool {
        match self.config.wait_for_task_to_complete {
            WaitForTaskToComplete::Always => true,
            WaitForTaskToComplete::Never => false,
            WaitForTaskToComplete::IfReplyExpected => exchange.pattern() == ExchangePattern::InOut,
        }
    }

    async fn enqueue(&self, item: SedaItem) -> EipResult<()> {
        if self.config.block_when_full {
            return self
                .queue
                .tx
                .send(item)
                .await
                .map_err(|_| EipError::endpoint(&self.uri, "queue closed"));
        }
        self.queue.tx.try_send(item).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => EipError::endpoint(&self.uri, "queue full"),
            mpsc::error::TrySendError::Closed(_) => EipError::endpoint(&self.uri, "queue closed"),
        })
    }
}

#[async_trait]
impl Producer for SedaProducer {
    fn endpoint_uri(&self) -> &str {
        &self.uri
    }

    async fn send(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let copy = if self.config.carry_properties {
            let mut copy = exchange.clone();
            copy.prepare_for_next_stage();
            copy
        } else {
            exchange.message_only_copy()
        };

        if !self.wait_for_reply(exchange) {
            self.enqueue(SedaItem {
                exchange: copy,
                reply: None,
            })
            .await?;
            return Ok(());
        }

        let (tx, rx) = oneshot::channel();
        self.enqueue(SedaItem {
            exchange: copy,
            reply: Some(tx),
        })
        .await?;

        let timeout = Duration::from_millis(self.config.timeout_ms);
        let reply = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                return Err(EipError::endpoint(&self.uri, "consumer dropped the exchange").into());
            }
            Err(_) => {
                return Err(EipError::endpoint(
                    &self.uri,
                    format!("no reply within {} ms", self.config.timeout_ms),
                )
                .into());
            }
        };

        match &self.variable_receive {
            Some(name) if !reply.is_failed() => {
                exchange.set_variable(name.clone(), reply.body().clone());
            }
            _ => exchange.copy_results_from(&reply),
        }
        Ok(())
    }
}

struct SedaConsumer {
    uri: String,
    concurrent_consumers: usize,
    queue: Arc<SedaQueue>,
    processor: SharedProcessor,
    token: Mutex<Option<CancellationToken>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

async fn next_item(rx: &tokio::sync::Mutex<mpsc::Receiver<SedaItem>>) -> Option<SedaItem> {
    rx.lock().await.recv().await
}

#[async_trait]
impl Consumer for SedaConsumer {
    fn endpoint_uri(&self) -> &str {
        &self.uri
    }

    async fn start(&self) -> EipResult<()> {
        let token = CancellationToken::new();
        let mut workers = self.workers.lock();
        for worker in 0..self.concurrent_consumers {
            let token = token.clone();
            let rx = self.queue.rx.clone();
            let processor = self.processor.clone();
            let uri = self.uri.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let item = tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        item = next_item(&rx) => item,
                    };
                    let Some(SedaItem {
                        mut exchange,
                        reply,
                    }) = item
                    else {
                        break;
                    };
                    process_capturing(processor.as_ref(), &mut exchange).await;
                    match reply {
                        Some(reply) => {
                            let _ = reply.send(exchange);
                        }
                        None if exchange.is_failed() => {
                            warn!(
                                endpoint = %uri,
                                exchange_id = %exchange.id(),
                                error = ?exchange.failure(),
                                "exchange failed on seda consumer"
                            );
                        }
                        None => {}
                    }
                }
                debug!(endpoint = %uri, worker, "seda consumer worker exited");
            }));
        }
        *self.token.lock() = Some(token);
        Ok(())
    }

    /// 只发出停止信号：各任务完成当前交换后退出，不在此等待
    async fn stop(&self) -> EipResult<()> {
        if let Some(token) = self.token.lock().take() {
            token.cancel();
        }
        self.workers.lock().clear();
        Ok(())
    }

    fn pending(&self) -> usize {
        self.queue.pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eip_core::processor::processor_fn;
    use serde_json::json;

    async fn endpoint(component: &SedaComponent, uri: &str) -> SharedEndpoint {
        component
            .create_endpoint(&EndpointUri::parse(uri).unwrap())
            .unwrap()
    }

    #[tokio::test]
    async fn request_reply_waits_for_the_consumer() {
        let component = SedaComponent::new();
        let ep = endpoint(&component, "seda:work").await;
        let consumer = ep
            .create_consumer(processor_fn(|ex| {
                let body = ex.message().body_as_string();
                ex.set_body(format!("{body}!"));
                ex.set_property("internal", true);
                Ok(())
            }))
            .await
            .unwrap();
        consumer.start().await.unwrap();

        let producer = ep.create_producer().await.unwrap();
        let mut ex = Exchange::with_body("hi").with_pattern(ExchangePattern::InOut);
        ex.set_property("caller", 1);
        producer.send(&mut ex).await.unwrap();
        assert_eq!(ex.body(), &json!("hi!"));
        assert_eq!(ex.property("caller"), Some(&json!(1)));
        assert!(ex.property("internal").is_none());

        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn variable_receive_keeps_the_message() {
        let component = SedaComponent::new();
        let consumer = endpoint(&component, "seda:calc")
            .await
            .create_consumer(processor_fn(|ex| {
                ex.set_body(42);
                Ok(())
            }))
            .await
            .unwrap();
        consumer.start().await.unwrap();

        let producer = endpoint(&component, "seda:calc?variableReceive=answer&waitForTaskToComplete=Always")
            .await
            .create_producer()
            .await
            .unwrap();
        let mut ex = Exchange::with_body("question");
        producer.send(&mut ex).await.unwrap();
        assert_eq!(ex.body(), &json!("question"));
        assert_eq!(ex.variable("answer"), Some(&json!(42)));
        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn full_queue_rejects_unless_blocking() {
        let component = SedaComponent::new();
        let producer = endpoint(&component, "seda:tiny?size=1")
            .await
            .create_producer()
            .await
            .unwrap();
        producer.send(&mut Exchange::with_body(1)).await.unwrap();
        assert_eq!(component.queue_size("tiny"), 1);
        let err = producer.send(&mut Exchange::with_body(2)).await.unwrap_err();
        assert!(err.to_string().contains("queue full"));
    }

    #[tokio::test]
    async fn fire_and_forget_only_carries_the_message_by_default() {
        let component = SedaComponent::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let consumer = endpoint(&component, "seda:events?concurrentConsumers=2")
            .await
            .create_consumer(processor_fn(move |ex| {
                sink.lock().push(ex.property("trace").cloned());
                Ok(())
            }))
            .await
            .unwrap();
        consumer.start().await.unwrap();

        let plain = endpoint(&component, "seda:events").await.create_producer().await.unwrap();
        let carrying = endpoint(&component, "seda:events?carryProperties=true")
            .await
            .create_producer()
            .await
            .unwrap();
        let mut ex = Exchange::with_body("e");
        ex.set_property("trace", "t-1");
        plain.send(&mut ex).await.unwrap();
        carrying.send(&mut ex).await.unwrap();

        for _ in 0..100 {
            if seen.lock().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let mut seen = seen.lock().clone();
        seen.sort_by_key(|v| v.is_some());
        assert_eq!(seen, vec![None, Some(json!("t-1"))]);
        consumer.stop().await.unwrap();
    }
}
