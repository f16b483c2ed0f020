//! 路由策略（RoutePolicy）
//!
//! 观察路由的启停与交换的开始/结束，可通过 `RouteController` 请求启停路由。
//!
use crate::controller::RouteController;
use eip_core::exchange::Exchange;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::info;

pub trait RoutePolicy: Send + Sync {
    /// 路由加入上下文时调用
    fn on_init(&self, _route_id: &str, _controller: &RouteController) {}

    fn on_start(&self, _route_id: &str) {}

    fn on_stop(&self, _route_id: &str) {}

    fn on_exchange_begin(&self, _route_id: &str, _exchange: &Exchange) {}

    fn on_exchange_done(&self, _route_id: &str, _exchange: &Exchange) {}
}

pub type SharedRoutePolicy = Arc<dyn RoutePolicy>;

/// 交接策略：路由完成一个交换后停止自身并启动另一条路由
///
/// 同一个实例挂在两条路由上，即可让两条路由轮流工作。
pub struct FlipRoutePolicy {
    first: String,
    second: String,
    controller: OnceLock<RouteController>,
}

impl FlipRoutePolicy {
    pub fn new(first: impl Into<String>, second: impl Into<String>) -> Self {
        Self {
            first: first.into(),
            second: second.into(),
            controller: OnceLock::new(),
        }
    }

    fn other(&self, route_id: &str) -> Option<&str> {
        if route_id == self.first {
            Some(&self.second)
        } else if route_id == self.second {
            Some(&self.first)
        } else {
            None
        }
    }
}

impl RoutePolicy for FlipRoutePolicy {
    fn on_init(&self, _route_id: &str, controller: &RouteController) {
        let _ = self.controller.set(controller.clone());
    }

    fn on_exchange_done(&self, route_id: &str, _exchange: &Exchange) {
        let (Some(other), Some(controller)) = (self.other(route_id), self.controller.get()) else {
            return;
        };
        info!(stop = route_id, start = other, "flipping routes");
        controller.stop_route(route_id);
        controller.start_route(other);
    }
}

/// 计数策略：记录路由事件，处理满 `limit` 个交换后请求停止该路由
pub struct CountingRoutePolicy {
    limit: Option<usize>,
    completed: AtomicUsize,
    failed: AtomicUsize,
    events: Mutex<Vec<String>>,
    controller: OnceLock<RouteController>,
}

impl CountingRoutePolicy {
    pub fn new() -> Self {
        Self {
            limit: None,
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            events: Mutex::new(Vec::new()),
            controller: OnceLock::new(),
        }
    }

    /// 完成 `limit` 个交换后停止路由
    pub fn stop_after(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::new()
        }
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// 形如 `start:route-a`、`stop:route-a` 的事件序列
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl Default for CountingRoutePolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutePolicy for CountingRoutePolicy {
    fn on_init(&self, route_id: &str, controller: &RouteController) {
        let _ = self.controller.set(controller.clone());
        self.events.lock().push(format!("init:{route_id}"));
    }

    fn on_start(&self, route_id: &str) {
        self.events.lock().push(format!("start:{route_id}"));
    }

    fn on_stop(&self, route_id: &str) {
        self.events.lock().push(format!("stop:{route_id}"));
    }

    fn on_exchange_done(&self, route_id: &str, exchange: &Exchange) {
        if exchange.is_failed() {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        let done = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        if self.limit == Some(done)
            && let Some(controller) = self.controller.get()
        {
            controller.stop_route(route_id);
        }
    }
}
