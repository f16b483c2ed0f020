use super::delayer::value_as_u64;
use super::{Processor, SharedProcessor, continue_processing, process_capturing};
use crate::exchange::{Exchange, keys::property};
use crate::expression::{SharedExpression, SharedPredicate};
use async_trait::async_trait;

enum LoopCondition {
    Count(SharedExpression),
    While(SharedPredicate),
}

/// 循环：固定次数或谓词成立期间重复执行输出
///
/// 复制模式下每一轮都从进入循环时的消息开始；否则上一轮的输出是下一轮的输入。
pub struct LoopProcessor {
    condition: LoopCondition,
    output: SharedProcessor,
    copy: bool,
}

impl LoopProcessor {
    pub fn count(count: SharedExpression, output: SharedProcessor) -> Self {
        Self {
            condition: LoopCondition::Count(count),
            output,
            copy: false,
        }
    }

    pub fn do_while(predicate: SharedPredicate, output: SharedProcessor) -> Self {
        Self {
            condition: LoopCondition::While(predicate),
            output,
            copy: false,
        }
    }

    pub fn with_copy(mut self, copy: bool) -> Self {
        self.copy = copy;
        self
    }
}

#[async_trait]
impl Processor for LoopProcessor {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let count = match &self.condition {
            LoopCondition::Count(expr) => Some(value_as_u64(&expr.evaluate(exchange)?)?),
            LoopCondition::While(_) => None,
        };
        let source = self.copy.then(|| exchange.message().clone());

        let mut index: u64 = 0;
        loop {
            let proceed = match (&self.condition, count) {
                (_, Some(count)) => index < count,
                (LoopCondition::While(predicate), None) => predicate.matches(exchange),
                (LoopCondition::Count(_), None) => false,
            };
            if !proceed {
                break;
            }

            exchange.prepare_for_next_stage();
            if let Some(source) = &source {
                *exchange.in_message_mut() = source.clone();
            }
            exchange.set_property(property::LOOP_INDEX, index);
            if let Some(count) = count {
                exchange.set_property(property::LOOP_SIZE, count);
            }

            process_capturing(self.output.as_ref(), exchange).await;
            if !continue_processing(exchange) {
                break;
            }
            index += 1;
        }
        Ok(())
    }
}
