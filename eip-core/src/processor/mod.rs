//! 处理器（Processor）与组合
//!
//! 处理器是路由的基本构件：对交换做一次异步处理。返回 `Err` 与写入失败槽等价，
//! 组合处理器（流水线、路由、扇出等）统一通过失败槽判断是否继续。
//!
use crate::exchange::Exchange;
use async_trait::async_trait;
use std::sync::Arc;

mod aggregator;
mod choice;
mod delayer;
mod fanout;
mod idempotent;
mod looping;
mod multicast;
mod pipeline;
mod recipient_list;
mod routing_slip;
mod send;
mod splitter;
mod threads;
mod transform;

pub use aggregator::{AggregatorProcessor, CompletedBy};
pub use choice::{ChoiceProcessor, FilterProcessor, WhenClause};
pub use delayer::DelayProcessor;
pub use fanout::MulticastConfig;
pub use idempotent::{IdempotentConsumer, IdempotentRepository, MemoryIdempotentRepository};
pub use looping::LoopProcessor;
pub use multicast::MulticastProcessor;
pub use pipeline::Pipeline;
pub use recipient_list::RecipientListProcessor;
pub use routing_slip::RoutingSlipProcessor;
pub use send::SendProcessor;
pub use splitter::SplitterProcessor;
pub use threads::ThreadsProcessor;
pub use transform::{
    LogProcessor, RemoveHeaderProcessor, SetBodyProcessor, SetHeaderProcessor,
    SetPropertyProcessor, SetVariableProcessor, StopProcessor,
};

#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()>;
}

pub type SharedProcessor = Arc<dyn Processor>;

/// 同步闭包处理器
pub struct FnProcessor<F> {
    f: F,
}

#[async_trait]
impl<F> Processor for FnProcessor<F>
where
    F: Fn(&mut Exchange) -> anyhow::Result<()> + Send + Sync,
{
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        (self.f)(exchange)
    }
}

pub fn processor_fn<F>(f: F) -> SharedProcessor
where
    F: Fn(&mut Exchange) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(FnProcessor { f })
}

/// 运行处理器，并把返回的错误写入失败槽
pub async fn process_capturing(processor: &dyn Processor, exchange: &mut Exchange) {
    let result = processor.process(exchange).await;
    exchange.capture(result);
}

/// 交换是否可继续流转：未失败、未要求停止、也未被错误处理器以 handled 结束
pub fn continue_processing(exchange: &Exchange) -> bool {
    !exchange.is_failed()
        && !exchange.is_route_stop()
        && exchange.error_handler_handled() != Some(true)
}
