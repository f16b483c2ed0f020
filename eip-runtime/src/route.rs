//! 运行期路由
//!
//! `RouteProcessor` 是交给消费者的入口处理器：记录来源路由与原始消息快照、
//! 统计在途交换数并通知路由策略。
//!
use crate::model::{ShutdownRoute, ShutdownRunningTask};
use crate::policy::SharedRoutePolicy;
use async_trait::async_trait;
use eip_core::endpoint::Consumer;
use eip_core::error::EipResult;
use eip_core::exchange::Exchange;
use eip_core::processor::{AggregatorProcessor, Processor, SharedProcessor, process_capturing};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RouteStatus {
    Stopped,
    Starting,
    Started,
    Stopping,
}

pub(crate) struct Route {
    id: String,
    from: String,
    explicit_order: Option<u32>,
    auto_startup: bool,
    shutdown_route: ShutdownRoute,
    shutdown_running_task: ShutdownRunningTask,
    processor: SharedProcessor,
    inflight: Arc<AtomicUsize>,
    policies: Vec<SharedRoutePolicy>,
    aggregators: Vec<Arc<AggregatorProcessor>>,
    status: Mutex<RouteStatus>,
    consumer: tokio::sync::Mutex<Option<Box<dyn Consumer>>>,
    /// 聚合器按时间完成任务的停止信号
    timers: Mutex<Option<CancellationToken>>,
}

pub(crate) struct RouteParts {
    pub id: String,
    pub from: String,
    pub explicit_order: Option<u32>,
    pub auto_startup: bool,
    pub shutdown_route: ShutdownRoute,
    pub shutdown_running_task: ShutdownRunningTask,
    pub pipeline: SharedProcessor,
    pub policies: Vec<SharedRoutePolicy>,
    pub aggregators: Vec<Arc<AggregatorProcessor>>,
}

impl Route {
    pub(crate) fn new(parts: RouteParts) -> Self {
        let inflight = Arc::new(AtomicUsize::new(0));
        let processor: SharedProcessor = Arc::new(RouteProcessor {
            route_id: parts.id.clone(),
            pipeline: parts.pipeline,
            inflight: inflight.clone(),
            policies: parts.policies.clone(),
        });
        Self {
            id: parts.id,
            from: parts.from,
            explicit_order: parts.explicit_order,
            auto_startup: parts.auto_startup,
            shutdown_route: parts.shutdown_route,
            shutdown_running_task: parts.shutdown_running_task,
            processor,
            inflight,
            policies: parts.policies,
            aggregators: parts.aggregators,
            status: Mutex::new(RouteStatus::Stopped),
            consumer: tokio::sync::Mutex::new(None),
            timers: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn from_uri(&self) -> &str {
        &self.from
    }

    pub(crate) fn explicit_order(&self) -> Option<u32> {
        self.explicit_order
    }

    pub(crate) fn auto_startup(&self) -> bool {
        self.auto_startup
    }

    pub(crate) fn shutdown_route(&self) -> ShutdownRoute {
        self.shutdown_route
    }

    pub(crate) fn shutdown_running_task(&self) -> ShutdownRunningTask {
        self.shutdown_running_task
    }

    pub(crate) fn processor(&self) -> SharedProcessor {
        self.processor.clone()
    }

    pub(crate) fn policies(&self) -> &[SharedRoutePolicy] {
        &self.policies
    }

    pub(crate) fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    pub(crate) fn status(&self) -> RouteStatus {
        *self.status.lock()
    }

    pub(crate) fn set_status(&self, status: RouteStatus) {
        *self.status.lock() = status;
    }

    /// 消费者已接收但未交给处理器的交换数
    pub(crate) async fn pending(&self) -> usize {
        self.consumer
            .lock()
            .await
            .as_ref()
            .map(|c| c.pending())
            .unwrap_or(0)
    }

    pub(crate) async fn attach_consumer(&self, consumer: Box<dyn Consumer>) -> EipResult<()> {
        consumer.start().await?;
        *self.consumer.lock().await = Some(consumer);
        Ok(())
    }

    /// 停止消费者（不再接收新交换）；重复调用无副作用
    pub(crate) async fn stop_consumer(&self) -> EipResult<()> {
        let consumer = self.consumer.lock().await.take();
        if let Some(consumer) = consumer {
            consumer.stop().await?;
            info!(route_id = %self.id, endpoint = %consumer.endpoint_uri(), "consumer stopped");
        }
        Ok(())
    }

    /// 启动聚合器的超时/间隔完成任务；`token` 应为上下文强制关闭信号的子信号
    pub(crate) fn start_completion_timers(&self, token: CancellationToken) {
        let mut started = 0;
        for aggregator in &self.aggregators {
            if aggregator.spawn_completion_timer(token.clone()).is_some() {
                started += 1;
            }
        }
        if started > 0 {
            debug!(route_id = %self.id, timers = started, "aggregation timers started");
        }
        if let Some(previous) = self.timers.lock().replace(token) {
            previous.cancel();
        }
    }

    pub(crate) fn stop_completion_timers(&self) {
        if let Some(token) = self.timers.lock().take() {
            token.cancel();
        }
    }

    /// 关闭时强制完成聚合器中未完成的组
    pub(crate) async fn force_complete_aggregators(&self) -> usize {
        let mut completed = 0;
        for aggregator in &self.aggregators {
            completed += aggregator.force_completion().await;
        }
        completed
    }
}

/// 在途计数守卫：交换处理的 future 被中途丢弃时也能归还计数
struct InflightGuard(Arc<AtomicUsize>);

impl InflightGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct RouteProcessor {
    route_id: String,
    pipeline: SharedProcessor,
    inflight: Arc<AtomicUsize>,
    policies: Vec<SharedRoutePolicy>,
}

#[async_trait]
impl Processor for RouteProcessor {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let _guard = InflightGuard::enter(&self.inflight);
        if exchange.from_route_id().is_none() {
            exchange.set_from_route_id(self.route_id.clone());
        }
        exchange.snapshot_original();

        for policy in &self.policies {
            policy.on_exchange_begin(&self.route_id, exchange);
        }
        process_capturing(self.pipeline.as_ref(), exchange).await;
        for policy in &self.policies {
            policy.on_exchange_done(&self.route_id, exchange);
        }
        Ok(())
    }
}
