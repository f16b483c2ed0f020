//! 生产者模板：从路由外部向端点发送交换
//!
//! - `send` 返回处理后的交换，失败保留在失败槽中供调用方检查；
//! - `send_body*` / `request_body*` 在交换以失败结束时返回 `ExchangeFailed`。
//!
//! 启用交换对象池时，`send_body*` / `request_body*` 用完的交换会归还池中。
//!
use crate::error::RuntimeResult;
use eip_core::endpoint::ProducerCache;
use eip_core::error::EipError;
use eip_core::exchange::{Exchange, ExchangePattern, ExchangePool, Message};
use serde_json::Value;
use std::sync::Arc;

#[derive(Clone)]
pub struct ProducerTemplate {
    producers: Arc<ProducerCache>,
    pool: Option<Arc<ExchangePool>>,
}

impl ProducerTemplate {
    pub(crate) fn new(producers: Arc<ProducerCache>, pool: Option<Arc<ExchangePool>>) -> Self {
        Self { producers, pool }
    }

    pub async fn send(&self, uri: &str, mut exchange: Exchange) -> RuntimeResult<Exchange> {
        let producer = self.producers.acquire(uri).await?;
        let result = producer.send(&mut exchange).await;
        exchange.capture(result);
        Ok(exchange)
    }

    pub async fn send_body(&self, uri: &str, body: impl Into<Value>) -> RuntimeResult<()> {
        self.invoke(uri, Message::new(body), ExchangePattern::InOnly)
            .await
            .map(|_| ())
    }

    pub async fn send_body_and_header(
        &self,
        uri: &str,
        body: impl Into<Value>,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> RuntimeResult<()> {
        let message = Message::new(body).with_header(name, value);
        self.invoke(uri, message, ExchangePattern::InOnly)
            .await
            .map(|_| ())
    }

    /// 请求-应答：返回结果 body
    pub async fn request_body(&self, uri: &str, body: impl Into<Value>) -> RuntimeResult<Value> {
        self.invoke(uri, Message::new(body), ExchangePattern::InOut)
            .await
    }

    pub async fn request_body_and_header(
        &self,
        uri: &str,
        body: impl Into<Value>,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> RuntimeResult<Value> {
        let message = Message::new(body).with_header(name, value);
        self.invoke(uri, message, ExchangePattern::InOut).await
    }

    async fn invoke(
        &self,
        uri: &str,
        message: Message,
        pattern: ExchangePattern,
    ) -> RuntimeResult<Value> {
        let exchange = match &self.pool {
            Some(pool) => pool.acquire(message, pattern),
            None => Exchange::new(message).with_pattern(pattern),
        };
        let mut exchange = self.send(uri, exchange).await?;

        let outcome = match exchange.take_failure() {
            Some(failure) => Err(EipError::ExchangeFailed {
                exchange_id: exchange.id().to_string(),
                failure,
            }
            .into()),
            None => Ok(exchange.message_mut().take_body()),
        };
        if let Some(pool) = &self.pool {
            pool.release(exchange);
        }
        outcome
    }
}
