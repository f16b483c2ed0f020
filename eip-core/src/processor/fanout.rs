//! 扇出引擎：multicast / splitter / recipient list 共用
//!
//! 每个分支是一对（交换副本, 处理器）。顺序模式按迭代顺序聚合；并行模式在工作池上运行，
//! 按完成顺序聚合，`synchronous` 时按提交顺序聚合。流式模式惰性拉取分支并限制在途数量。
//!
//! 并行模式可设置 `timeout`：到时后只聚合已完成的分支，其余分支被中止。
//!
use super::{SharedProcessor, process_capturing};
use crate::aggregation::SharedAggregationStrategy;
use crate::error::EipError;
use crate::exchange::Exchange;
use crate::executor::WorkerPool;
use bon::Builder;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

/// 扇出公共配置
#[derive(Clone, Default, Builder)]
pub struct MulticastConfig {
    #[builder(default)]
    pub parallel_processing: bool,
    #[builder(default)]
    pub streaming: bool,
    #[builder(default)]
    pub stop_on_exception: bool,
    /// 并行时仍按分支序号聚合
    #[builder(default)]
    pub synchronous: bool,
    pub aggregation_strategy: Option<SharedAggregationStrategy>,
    pub worker_pool: Option<WorkerPool>,
    /// 每个分支副本处理前先经过此处理器
    pub on_prepare: Option<SharedProcessor>,
    /// 并行扇出的总超时
    pub timeout: Option<Duration>,
}

pub(crate) struct Branch {
    pub index: usize,
    pub exchange: Exchange,
    pub processor: SharedProcessor,
}

enum Flow {
    Continue,
    Stop,
}

/// 运行扇出并把结果写回 `original`；`strategy` 为 `None` 时保留原交换，仅传播第一个失败
pub(crate) async fn fan_out<I>(
    original: &mut Exchange,
    branches: I,
    config: &MulticastConfig,
    strategy: Option<SharedAggregationStrategy>,
) -> anyhow::Result<()>
where
    I: Iterator<Item = Branch> + Send,
{
    let mut collector = Collector::new(strategy, config.stop_on_exception);
    if config.parallel_processing {
        run_parallel(branches, config, &mut collector).await?;
    } else {
        for branch in branches {
            let (_, exchange) = run_branch(branch, config.on_prepare.clone()).await;
            if let Flow::Stop = collector.offer(exchange)? {
                break;
            }
        }
    }
    collector.complete(original);
    Ok(())
}

async fn run_parallel<I>(
    mut branches: I,
    config: &MulticastConfig,
    collector: &mut Collector,
) -> anyhow::Result<()>
where
    I: Iterator<Item = Branch> + Send,
{
    let pool = config.worker_pool.clone().unwrap_or_default();
    let limit = if config.streaming {
        pool.size()
    } else {
        usize::MAX
    };
    let mut running = JoinSet::new();
    let mut reorder: BTreeMap<usize, Exchange> = BTreeMap::new();
    let mut next_index = 0;
    let mut drained = false;
    let deadline = config.timeout.map(|timeout| Instant::now() + timeout);

    'collect: loop {
        while !drained && running.len() < limit {
            match branches.next() {
                Some(branch) => {
                    running.spawn(pool.run(run_branch(branch, config.on_prepare.clone())));
                }
                None => drained = true,
            }
        }

        let next = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, running.join_next()).await,
            None => Ok(running.join_next().await),
        };
        let Ok(next) = next else {
            warn!(
                timeout_ms = config.timeout.map_or(0, |t| t.as_millis() as u64),
                unfinished = running.len(),
                "parallel fan-out timed out, aggregating completed branches"
            );
            for ready in std::mem::take(&mut reorder).into_values() {
                if let Flow::Stop = collector.offer(ready)? {
                    break;
                }
            }
            break;
        };
        let Some(joined) = next else {
            break;
        };
        let (index, exchange) = match joined {
            Ok(Ok(done)) => done,
            Ok(Err(rejected)) => return Err(rejected.into()),
            Err(join_error) => {
                return Err(EipError::processing(format!("fan-out branch aborted: {join_error}")).into());
            }
        };

        if config.synchronous {
            reorder.insert(index, exchange);
            while let Some(ready) = reorder.remove(&next_index) {
                next_index += 1;
                if let Flow::Stop = collector.offer(ready)? {
                    break 'collect;
                }
            }
        } else if let Flow::Stop = collector.offer(exchange)? {
            break;
        }
    }

    if !running.is_empty() {
        debug!(remaining = running.len(), "fan-out completed early, aborting remaining branches");
        running.abort_all();
    }
    Ok(())
}

async fn run_branch(mut branch: Branch, on_prepare: Option<SharedProcessor>) -> (usize, Exchange) {
    if let Some(prepare) = on_prepare {
        process_capturing(prepare.as_ref(), &mut branch.exchange).await;
    }
    if !branch.exchange.is_failed() {
        process_capturing(branch.processor.as_ref(), &mut branch.exchange).await;
    }
    (branch.index, branch.exchange)
}

struct Collector {
    strategy: Option<SharedAggregationStrategy>,
    stop_on_exception: bool,
    result: Option<Exchange>,
    first_failed: Option<Exchange>,
    stopped: Option<Exchange>,
}

impl Collector {
    fn new(strategy: Option<SharedAggregationStrategy>, stop_on_exception: bool) -> Self {
        Self {
            strategy,
            stop_on_exception,
            result: None,
            first_failed: None,
            stopped: None,
        }
    }

    fn offer(&mut self, branch: Exchange) -> anyhow::Result<Flow> {
        if self.stop_on_exception && branch.is_failed() {
            self.stopped = Some(branch);
            return Ok(Flow::Stop);
        }
        match &self.strategy {
            Some(strategy) => {
                if strategy.can_pre_complete() && strategy.pre_complete(self.result.as_ref(), &branch)
                {
                    return Ok(Flow::Stop);
                }
                self.result = Some(strategy.aggregate(self.result.take(), branch)?);
            }
            None => {
                if branch.is_failed() && self.first_failed.is_none() {
                    self.first_failed = Some(branch);
                }
            }
        }
        Ok(Flow::Continue)
    }

    fn complete(self, original: &mut Exchange) {
        if let Some(stopped) = self.stopped {
            original.copy_results_from(&stopped);
            return;
        }
        if let Some(mut result) = self.result {
            if let Some(strategy) = &self.strategy {
                strategy.on_completion(&mut result);
            }
            original.copy_results_from(&result);
            return;
        }
        if let Some(failed) = self.first_failed {
            if let Some(failure) = failed.failure() {
                original.set_failure(failure.clone());
            }
            original.set_exception_caught(failed.exception_caught().cloned());
            original.set_error_handler_handled(failed.error_handler_handled());
            original.set_redelivery_exhausted(failed.is_redelivery_exhausted());
        }
    }
}
