use super::fanout::{Branch, MulticastConfig, fan_out};
use super::send::{ProducerStep, is_invalid_endpoint};
use super::Processor;
use crate::aggregation::use_latest;
use crate::endpoint::ProducerCache;
use crate::exchange::{Exchange, keys::property};
use crate::expression::{SharedExpression, into_uris};
use async_trait::async_trait;
use bon::Builder;
use std::sync::Arc;
use tracing::debug;

/// 收件人列表：表达式给出端点 URI（数组或分隔字符串），以多播方式发送
#[derive(Builder)]
pub struct RecipientListProcessor {
    expression: SharedExpression,
    producers: Arc<ProducerCache>,
    #[builder(into, default = ",".to_owned())]
    delimiter: String,
    #[builder(default)]
    ignore_invalid_endpoints: bool,
    /// 结果 body 存入该变量，消息本身恢复为调用前的内容
    #[builder(into)]
    result_variable: Option<String>,
    #[builder(default)]
    config: MulticastConfig,
}

#[async_trait]
impl Processor for RecipientListProcessor {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let uris = into_uris(self.expression.evaluate(exchange)?, &self.delimiter);

        let mut resolved = Vec::with_capacity(uris.len());
        for uri in uris {
            match self.producers.acquire(&uri).await {
                Ok(producer) => resolved.push((uri, producer)),
                Err(err) if self.ignore_invalid_endpoints && is_invalid_endpoint(&err) => {
                    debug!(uri = %uri, error = %err, "ignoring invalid recipient");
                }
                Err(err) => return Err(err.into()),
            }
        }

        let total = resolved.len();
        let branches: Vec<Branch> = resolved
            .into_iter()
            .enumerate()
            .map(|(index, (uri, producer))| {
                let mut copy = exchange.correlated_copy();
                copy.set_property(property::MULTICAST_INDEX, index);
                copy.set_property(property::MULTICAST_COMPLETE, index + 1 == total);
                copy.set_property(property::RECIPIENT_LIST_ENDPOINT, uri);
                Branch {
                    index,
                    exchange: copy,
                    processor: ProducerStep::shared(producer),
                }
            })
            .collect();

        let before = self
            .result_variable
            .as_ref()
            .map(|_| exchange.message().clone());
        let strategy = self
            .config
            .aggregation_strategy
            .clone()
            .or_else(|| Some(use_latest()));
        fan_out(exchange, branches.into_iter(), &self.config, strategy).await?;

        if let (Some(name), Some(before)) = (&self.result_variable, before) {
            if !exchange.is_failed() {
                let result = exchange.body().clone();
                exchange.set_variable(name.clone(), result);
                *exchange.in_message_mut() = before;
            }
        }
        Ok(())
    }
}
