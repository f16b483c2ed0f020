use super::send::is_invalid_endpoint;
use super::{Processor, continue_processing};
use crate::endpoint::ProducerCache;
use crate::exchange::{Exchange, keys::property};
use crate::expression::{SharedExpression, into_uris};
use async_trait::async_trait;
use bon::Builder;
use std::sync::Arc;
use tracing::debug;

/// 路由单：依次经过表达式算出的端点，上一跳的输出作为下一跳的输入；失败即停止
#[derive(Builder)]
pub struct RoutingSlipProcessor {
    expression: SharedExpression,
    producers: Arc<ProducerCache>,
    #[builder(into, default = ",".to_owned())]
    delimiter: String,
    #[builder(default)]
    ignore_invalid_endpoints: bool,
    #[builder(into)]
    result_variable: Option<String>,
}

#[async_trait]
impl Processor for RoutingSlipProcessor {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let uris = into_uris(self.expression.evaluate(exchange)?, &self.delimiter);
        let before = self
            .result_variable
            .as_ref()
            .map(|_| exchange.message().clone());

        for (hop, uri) in uris.iter().enumerate() {
            if !continue_processing(exchange) {
                break;
            }
            if hop > 0 {
                exchange.prepare_for_next_stage();
            }
            let producer = match self.producers.acquire(uri).await {
                Ok(producer) => producer,
                Err(err) if self.ignore_invalid_endpoints && is_invalid_endpoint(&err) => {
                    debug!(uri = %uri, error = %err, "skipping invalid routing slip hop");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            exchange.set_property(property::SLIP_ENDPOINT, uri.clone());
            exchange.set_property(property::TO_ENDPOINT, uri.clone());
            let result = producer.send(exchange).await;
            exchange.capture(result);
        }

        if let (Some(name), Some(before)) = (&self.result_variable, before) {
            if !exchange.is_failed() {
                let result = exchange.body().clone();
                exchange.set_variable(name.clone(), result);
                exchange.take_out();
                *exchange.in_message_mut() = before;
            }
        }
        Ok(())
    }
}
