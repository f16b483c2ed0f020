use super::fanout::{Branch, MulticastConfig, fan_out};
use super::{Processor, SharedProcessor};
use crate::aggregation::use_latest;
use crate::exchange::{Exchange, keys::property};
use async_trait::async_trait;

/// 多播：把交换的副本发给每个输出，未指定策略时以最新结果为准
pub struct MulticastProcessor {
    outputs: Vec<SharedProcessor>,
    config: MulticastConfig,
}

impl MulticastProcessor {
    pub fn new(outputs: Vec<SharedProcessor>, config: MulticastConfig) -> Self {
        Self { outputs, config }
    }

    pub fn outputs(&self) -> &[SharedProcessor] {
        &self.outputs
    }
}

#[async_trait]
impl Processor for MulticastProcessor {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let total = self.outputs.len();
        let branches: Vec<Branch> = self
            .outputs
            .iter()
            .enumerate()
            .map(|(index, output)| {
                let mut copy = exchange.correlated_copy();
                copy.set_property(property::MULTICAST_INDEX, index);
                copy.set_property(property::MULTICAST_COMPLETE, index + 1 == total);
                Branch {
                    index,
                    exchange: copy,
                    processor: output.clone(),
                }
            })
            .collect();

        let strategy = self
            .config
            .aggregation_strategy
            .clone()
            .or_else(|| Some(use_latest()));
        fan_out(exchange, branches.into_iter(), &self.config, strategy).await
    }
}
