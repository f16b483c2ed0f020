//! 关闭策略
//!
//! 路由按启动顺序排序（默认逆序），`Defer` 的路由排在最后。逐条优雅排空：
//! - `CompleteAllTasks`：等待消费者队列与在途交换都清空后再停止消费者；
//! - `CompleteCurrentTaskOnly`：先停止消费者，只等待在途交换完成。
//!
//! 排空后强制完成该路由聚合器中的未完成组。整体超时后按配置打断延迟与重投等待，
//! 并直接停止剩余路由的消费者。
//!
use crate::config::ShutdownConfig;
use crate::model::{ShutdownRoute, ShutdownRunningTask};
use crate::route::{Route, RouteStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) struct ShutdownStrategy<'a> {
    config: &'a ShutdownConfig,
    force: &'a CancellationToken,
}

impl<'a> ShutdownStrategy<'a> {
    pub(crate) fn new(config: &'a ShutdownConfig, force: &'a CancellationToken) -> Self {
        Self { config, force }
    }

    /// 关闭顺序：按启动顺序（可逆序），`Defer` 的路由保持相对顺序移到末尾
    pub(crate) fn order(&self, mut routes: Vec<(u32, Arc<Route>)>) -> Vec<Arc<Route>> {
        routes.sort_by_key(|(order, _)| *order);
        if self.config.shutdown_routes_in_reverse_order {
            routes.reverse();
        }
        let (deferred, regular): (Vec<_>, Vec<_>) = routes
            .into_iter()
            .map(|(_, route)| route)
            .partition(|route| route.shutdown_route() == ShutdownRoute::Defer);
        regular.into_iter().chain(deferred).collect()
    }

    /// 关闭全部路由；返回是否在超时内优雅完成
    pub(crate) async fn shutdown(&self, routes: &[Arc<Route>]) -> bool {
        let timeout = self.config.timeout();
        info!(routes = routes.len(), timeout_ms = self.config.timeout_ms, "graceful shutdown started");

        let graceful = async {
            for route in routes {
                if matches!(route.status(), RouteStatus::Started | RouteStatus::Starting) {
                    self.drain(route).await;
                }
            }
        };
        let completed = tokio::time::timeout(timeout, graceful).await.is_ok();
        if completed {
            info!("graceful shutdown completed");
        } else {
            let remaining: Vec<&str> = routes
                .iter()
                .filter(|r| r.status() != RouteStatus::Stopped)
                .map(|r| r.id())
                .collect();
            warn!(
                timeout_ms = self.config.timeout_ms,
                ?remaining,
                "graceful shutdown timed out"
            );
            if self.config.shutdown_now_on_timeout {
                self.force.cancel();
            }
        }

        for route in routes {
            if route.status() != RouteStatus::Stopped {
                if let Err(err) = route.stop_consumer().await {
                    warn!(route_id = %route.id(), error = %err, "failed to stop consumer");
                }
                mark_stopped(route);
            }
        }
        completed
    }

    /// 单条路由的优雅停止（`stop_route`）；超时后直接停止消费者，不打断其他路由
    pub(crate) async fn stop_one(&self, route: &Arc<Route>) -> bool {
        let completed = tokio::time::timeout(self.config.timeout(), self.drain(route))
            .await
            .is_ok();
        if !completed {
            warn!(route_id = %route.id(), timeout_ms = self.config.timeout_ms, "route did not stop in time");
            if let Err(err) = route.stop_consumer().await {
                warn!(route_id = %route.id(), error = %err, "failed to stop consumer");
            }
            mark_stopped(route);
        }
        completed
    }

    async fn drain(&self, route: &Arc<Route>) {
        route.set_status(RouteStatus::Stopping);
        let poll = self.config.poll_interval();
        match route.shutdown_running_task() {
            ShutdownRunningTask::CompleteAllTasks => {
                wait_until_idle(route, poll, true).await;
                self.stop_consumer(route).await;
            }
            ShutdownRunningTask::CompleteCurrentTaskOnly => {
                self.stop_consumer(route).await;
                wait_until_idle(route, poll, false).await;
            }
        }

        route.stop_completion_timers();
        let completed = route.force_complete_aggregators().await;
        if completed > 0 {
            info!(route_id = %route.id(), groups = completed, "forced completion of aggregation groups");
        }
        mark_stopped(route);
    }

    async fn stop_consumer(&self, route: &Route) {
        if let Err(err) = route.stop_consumer().await {
            warn!(route_id = %route.id(), error = %err, "failed to stop consumer");
        }
    }
}

async fn wait_until_idle(route: &Route, poll: Duration, include_pending: bool) {
    loop {
        let inflight = route.inflight();
        let pending = if include_pending { route.pending().await } else { 0 };
        if inflight == 0 && pending == 0 {
            return;
        }
        debug!(route_id = %route.id(), inflight, pending, "waiting for exchanges to complete");
        tokio::time::sleep(poll).await;
    }
}

fn mark_stopped(route: &Route) {
    route.stop_completion_timers();
    route.set_status(RouteStatus::Stopped);
    for policy in route.policies() {
        policy.on_stop(route.id());
    }
    info!(route_id = %route.id(), "route stopped");
}
