use super::{Processor, SharedProcessor};
use crate::exchange::{Exchange, keys::property};
use crate::expression::SharedPredicate;
use async_trait::async_trait;

pub struct WhenClause {
    predicate: SharedPredicate,
    output: SharedProcessor,
}

impl WhenClause {
    pub fn new(predicate: SharedPredicate, output: SharedProcessor) -> Self {
        Self { predicate, output }
    }
}

/// 基于内容的路由：按声明顺序取第一个命中的分支；
/// 无命中且无 otherwise 时交换原样通过。
pub struct ChoiceProcessor {
    whens: Vec<WhenClause>,
    otherwise: Option<SharedProcessor>,
}

impl ChoiceProcessor {
    pub fn new(whens: Vec<WhenClause>, otherwise: Option<SharedProcessor>) -> Self {
        Self { whens, otherwise }
    }
}

#[async_trait]
impl Processor for ChoiceProcessor {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let selected = self
            .whens
            .iter()
            .find(|w| w.predicate.matches(exchange))
            .map(|w| &w.output)
            .or(self.otherwise.as_ref());

        match selected {
            Some(branch) => branch.process(exchange).await,
            None => Ok(()),
        }
    }
}

/// 过滤器：谓词不成立时跳过分支，并记录 `FILTER_MATCHED=false`
pub struct FilterProcessor {
    predicate: SharedPredicate,
    output: SharedProcessor,
}

impl FilterProcessor {
    pub fn new(predicate: SharedPredicate, output: SharedProcessor) -> Self {
        Self { predicate, output }
    }
}

#[async_trait]
impl Processor for FilterProcessor {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let matched = self.predicate.matches(exchange);
        exchange.set_property(property::FILTER_MATCHED, matched);
        if matched {
            self.output.process(exchange).await
        } else {
            Ok(())
        }
    }
}
