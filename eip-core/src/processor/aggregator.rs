//! 关联聚合器（Aggregator EIP）
//!
//! 按关联键把到达的交换合并成组，组满足完成条件后作为新交换交给输出：
//! - 完成数量（completion size）；
//! - 完成谓词（对合并后的组求值）；
//! - 策略的 `pre_complete`：为真时当前组先完成，新交换开启新组；
//! - 完成超时：组在 `completion_timeout` 内没有新交换到达；
//! - 完成间隔：每隔 `completion_interval` 完成全部未完成的组；
//! - 强制完成（路由停止时由运行时调用）。
//!
//! 策略合并失败时，已有的组保持原样，失败返回给调用方。
//!
use super::{Processor, SharedProcessor, process_capturing};
use crate::aggregation::SharedAggregationStrategy;
use crate::exchange::{Exchange, keys::property, value_to_string};
use crate::expression::{SharedExpression, SharedPredicate};
use async_trait::async_trait;
use bon::Builder;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_TIMEOUT_CHECKER_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletedBy {
    Size,
    Predicate,
    Strategy,
    Timeout,
    Interval,
    Force,
}

impl CompletedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletedBy::Size => "size",
            CompletedBy::Predicate => "predicate",
            CompletedBy::Strategy => "strategy",
            CompletedBy::Timeout => "timeout",
            CompletedBy::Interval => "interval",
            CompletedBy::Force => "force",
        }
    }
}

struct Group {
    exchange: Exchange,
    size: usize,
    updated: Instant,
}

#[derive(Builder)]
pub struct AggregatorProcessor {
    correlation: SharedExpression,
    strategy: SharedAggregationStrategy,
    output: SharedProcessor,
    completion_size: Option<usize>,
    completion_predicate: Option<SharedPredicate>,
    /// 组在此时长内没有新交换到达即完成
    completion_timeout: Option<Duration>,
    /// 每隔此时长完成全部未完成的组；与 `completion_timeout` 同时设置时优先
    completion_interval: Option<Duration>,
    #[builder(default = DEFAULT_TIMEOUT_CHECKER_INTERVAL)]
    timeout_checker_interval: Duration,
    #[builder(skip)]
    groups: Mutex<HashMap<String, Group>>,
}

impl AggregatorProcessor {
    /// 当前未完成的组数
    pub fn pending_groups(&self) -> usize {
        self.groups.lock().len()
    }

    /// 是否配置了按时间完成
    pub fn is_time_driven(&self) -> bool {
        self.completion_timeout.is_some() || self.completion_interval.is_some()
    }

    /// 立即完成所有未完成的组，返回完成的组数
    pub async fn force_completion(&self) -> usize {
        let drained: Vec<(String, Group)> = self.groups.lock().drain().collect();
        let count = drained.len();
        for (key, group) in drained {
            self.emit(key, group, CompletedBy::Force).await;
        }
        count
    }

    /// 启动按时间完成的后台任务，`token` 取消或聚合器被释放时退出；未配置时返回 `None`
    pub fn spawn_completion_timer(
        self: &Arc<Self>,
        token: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let (period, completed_by) = match (self.completion_interval, self.completion_timeout) {
            (Some(interval), _) => (interval, CompletedBy::Interval),
            (None, Some(_)) => (self.timeout_checker_interval, CompletedBy::Timeout),
            (None, None) => return None,
        };
        let aggregator = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(aggregator) = aggregator.upgrade() else { break };
                        aggregator.complete_by_time(completed_by).await;
                    }
                }
            }
            debug!(completed_by = completed_by.as_str(), "aggregation timer stopped");
        }))
    }

    async fn complete_by_time(&self, completed_by: CompletedBy) -> usize {
        let now = Instant::now();
        let due: Vec<(String, Group)> = {
            let mut groups = self.groups.lock();
            let keys: Vec<String> = groups
                .iter()
                .filter(|(_, group)| match completed_by {
                    CompletedBy::Timeout => self
                        .completion_timeout
                        .is_some_and(|timeout| now.duration_since(group.updated) >= timeout),
                    _ => true,
                })
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| groups.remove(&key).map(|group| (key, group)))
                .collect()
        };
        let count = due.len();
        for (key, group) in due {
            self.emit(key, group, completed_by).await;
        }
        count
    }

    fn merge(&self, existing: Option<&Group>, incoming: Exchange) -> anyhow::Result<Group> {
        let size = existing.map_or(0, |g| g.size) + 1;
        let merged = self
            .strategy
            .aggregate(existing.map(|g| g.exchange.clone()), incoming)?;
        Ok(Group {
            exchange: merged,
            size,
            updated: Instant::now(),
        })
    }

    async fn emit(&self, key: String, group: Group, completed_by: CompletedBy) {
        let mut exchange = group.exchange;
        exchange.set_property(property::AGGREGATED_SIZE, group.size);
        exchange.set_property(property::AGGREGATED_COMPLETED_BY, completed_by.as_str());
        exchange.set_property(property::AGGREGATED_CORRELATION_KEY, key.clone());
        self.strategy.on_completion(&mut exchange);
        debug!(
            correlation_key = %key,
            size = group.size,
            completed_by = completed_by.as_str(),
            "aggregation group completed"
        );

        process_capturing(self.output.as_ref(), &mut exchange).await;
        if let Some(failure) = exchange.failure() {
            warn!(
                correlation_key = %key,
                exchange_id = %exchange.id(),
                error = %failure,
                "aggregated exchange failed"
            );
        }
    }
}

#[async_trait]
impl Processor for AggregatorProcessor {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let key = value_to_string(&self.correlation.evaluate(exchange)?);
        let incoming = exchange.correlated_copy();

        let mut completed: Vec<(Group, CompletedBy)> = Vec::new();
        let mut merge_error = None;
        {
            let mut groups = self.groups.lock();
            let mut existing = groups.remove(&key);

            if let Some(current) = &existing
                && self.strategy.can_pre_complete()
                && self.strategy.pre_complete(Some(&current.exchange), &incoming)
            {
                completed.extend(existing.take().map(|g| (g, CompletedBy::Strategy)));
            }

            match self.merge(existing.as_ref(), incoming) {
                Ok(group) => {
                    if self.completion_size.is_some_and(|size| group.size >= size) {
                        completed.push((group, CompletedBy::Size));
                    } else if self
                        .completion_predicate
                        .as_ref()
                        .is_some_and(|p| p.matches(&group.exchange))
                    {
                        completed.push((group, CompletedBy::Predicate));
                    } else {
                        groups.insert(key.clone(), group);
                    }
                }
                Err(err) => {
                    warn!(correlation_key = %key, error = %err, "aggregation strategy failed, group kept");
                    if let Some(current) = existing {
                        groups.insert(key.clone(), current);
                    }
                    merge_error = Some(err);
                }
            }
        }

        for (group, completed_by) in completed {
            self.emit(key.clone(), group, completed_by).await;
        }
        match merge_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
