use super::fanout::{Branch, MulticastConfig, fan_out};
use super::{Processor, SharedProcessor};
use crate::exchange::{Exchange, keys::property};
use crate::expression::{SharedExpression, SplitItems};
use async_trait::async_trait;
use std::iter::Peekable;

/// 拆分器：对表达式产生的每个元素创建副本并交给同一个输出
///
/// 非流式时先求出全部元素（`SPLIT_SIZE` 随每个分支给出）；流式时逐个拉取，
/// 仅最后一个分支带 `SPLIT_SIZE`。未指定聚合策略时原交换保持不变，只传播第一个失败。
pub struct SplitterProcessor {
    expression: SharedExpression<SplitItems>,
    output: SharedProcessor,
    config: MulticastConfig,
}

impl SplitterProcessor {
    pub fn new(
        expression: SharedExpression<SplitItems>,
        output: SharedProcessor,
        config: MulticastConfig,
    ) -> Self {
        Self {
            expression,
            output,
            config,
        }
    }
}

#[async_trait]
impl Processor for SplitterProcessor {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let items = self.expression.evaluate(exchange)?;
        let (items, size): (SplitItems, Option<usize>) = if self.config.streaming {
            (items, None)
        } else {
            let all: Vec<_> = items.collect();
            let size = all.len();
            (Box::new(all.into_iter()), Some(size))
        };

        let branches = SplitBranches {
            items: items.peekable(),
            template: exchange.clone(),
            output: self.output.clone(),
            index: 0,
            size,
        };
        fan_out(
            exchange,
            branches,
            &self.config,
            self.config.aggregation_strategy.clone(),
        )
        .await
    }
}

struct SplitBranches {
    items: Peekable<SplitItems>,
    template: Exchange,
    output: SharedProcessor,
    index: usize,
    size: Option<usize>,
}

impl Iterator for SplitBranches {
    type Item = Branch;

    fn next(&mut self) -> Option<Branch> {
        let item = self.items.next()?;
        let index = self.index;
        self.index += 1;
        let last = self.items.peek().is_none();

        let mut exchange = self.template.correlated_copy();
        exchange.set_body(item);
        exchange.set_property(property::SPLIT_INDEX, index);
        exchange.set_property(property::SPLIT_COMPLETE, last);
        match self.size {
            Some(size) => exchange.set_property(property::SPLIT_SIZE, size),
            None if last => exchange.set_property(property::SPLIT_SIZE, index + 1),
            None => {}
        }

        Some(Branch {
            index,
            exchange,
            processor: self.output.clone(),
        })
    }
}
