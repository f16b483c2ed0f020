//! 路由上下文（EipContext）
//!
//! 持有组件、注册表、生产者缓存、工作池与全部路由，负责：
//! - 添加路由时把定义转换为处理器树（继承上下文错误处理器与 onException）；
//! - 分配启动顺序（显式顺序冲突时启动失败），按升序启动路由；
//! - 按关闭策略停止路由，并在超时后打断延迟与重投等待；
//! - 运行生命周期控制任务，执行路由策略提交的启停命令。
//!
//! 上下文启动之后添加的路由需要显式 `start_route`。停止后的上下文不能再次启动。
//!
use crate::component::{
    ComponentRegistry, DirectComponent, MockComponent, MockEndpoint, SedaComponent,
    SharedComponent,
};
use crate::config::ContextConfig;
use crate::controller::{RouteCommand, RouteController, spawn_controller};
use crate::error::{RuntimeError, RuntimeResult};
use crate::model::{ErrorHandlerDefinition, OnExceptionDefinition, RouteDefinition};
use crate::reifier::{ReifyContext, Reifier};
use crate::route::{Route, RouteParts, RouteStatus};
use crate::shutdown::ShutdownStrategy;
use crate::template::ProducerTemplate;
use bon::bon;
use eip_core::endpoint::{EndpointResolver, EndpointUri, ProducerCache, SharedEndpoint};
use eip_core::error::{EipError, EipResult};
use eip_core::exchange::ExchangePool;
use eip_core::executor::WorkerPool;
use eip_core::registry::Registry;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 自动分配的启动顺序从此值开始
pub const AUTO_STARTUP_ORDER_BASE: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContextState {
    Created,
    Started,
    Stopped,
}

/// 上下文句柄，克隆廉价
#[derive(Clone)]
pub struct EipContext {
    inner: Arc<ContextInner>,
}

pub(crate) struct ContextInner {
    config: ContextConfig,
    registry: Arc<Registry>,
    components: Arc<ComponentRegistry>,
    mock: Arc<MockComponent>,
    producers: Arc<ProducerCache>,
    worker_pool: WorkerPool,
    exchange_pool: Option<Arc<ExchangePool>>,
    error_handler: ErrorHandlerDefinition,
    on_exceptions: Vec<OnExceptionDefinition>,
    routes: RwLock<IndexMap<String, Arc<Route>>>,
    orders: Mutex<HashMap<String, u32>>,
    state: Mutex<ContextState>,
    controller: RouteController,
    commands: Mutex<Option<UnboundedReceiver<RouteCommand>>>,
    controller_task: Mutex<Option<JoinHandle<()>>>,
    controller_token: CancellationToken,
    /// 强制关闭信号：打断延迟与重投等待
    shutdown: CancellationToken,
}

#[bon]
impl EipContext {
    #[builder]
    pub fn new(
        #[builder(default)] config: ContextConfig,
        // 路由未指定时使用；缺省为默认错误处理器
        error_handler: Option<ErrorHandlerDefinition>,
        // 上下文级 onException，排在路由级子句之后
        #[builder(default)]
        on_exceptions: Vec<OnExceptionDefinition>,
        registry: Option<Arc<Registry>>,
    ) -> Self {
        let components = Arc::new(ComponentRegistry::new());
        let mock = Arc::new(MockComponent::new());
        let defaults: [(&str, SharedComponent); 3] = [
            ("direct", Arc::new(DirectComponent::new())),
            ("seda", Arc::new(SedaComponent::new())),
            ("mock", mock.clone()),
        ];
        for (scheme, component) in defaults {
            // 新建的注册表中不会重复
            let _ = components.register(scheme, component);
        }

        let producers = Arc::new(ProducerCache::new(
            components.clone(),
            config.producer_cache_size,
        ));
        let worker_pool = WorkerPool::new(format!("{}-workers", config.name), config.worker_pool_size);
        let exchange_pool = config
            .exchange_pooling
            .then(|| Arc::new(ExchangePool::new(config.exchange_pool_capacity)));
        let (controller, commands) = RouteController::channel();

        Self {
            inner: Arc::new(ContextInner {
                config,
                registry: registry.unwrap_or_default(),
                components,
                mock,
                producers,
                worker_pool,
                exchange_pool,
                error_handler: error_handler.unwrap_or_else(ErrorHandlerDefinition::default_handler),
                on_exceptions,
                routes: RwLock::new(IndexMap::new()),
                orders: Mutex::new(HashMap::new()),
                state: Mutex::new(ContextState::Created),
                controller,
                commands: Mutex::new(Some(commands)),
                controller_task: Mutex::new(None),
                controller_token: CancellationToken::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }
}

impl Default for EipContext {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl EipContext {
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &ContextConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn worker_pool(&self) -> &WorkerPool {
        &self.inner.worker_pool
    }

    pub fn exchange_pool(&self) -> Option<&Arc<ExchangePool>> {
        self.inner.exchange_pool.as_ref()
    }

    pub fn producer_cache(&self) -> &Arc<ProducerCache> {
        &self.inner.producers
    }

    /// 强制关闭信号；自定义处理器中的长时间等待可监听它
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// 生命周期控制任务的命令入口
    pub fn controller(&self) -> RouteController {
        self.inner.controller.clone()
    }

    pub fn add_component(
        &self,
        scheme: impl Into<String>,
        component: SharedComponent,
    ) -> RuntimeResult<()> {
        self.inner.components.register(scheme, component)
    }

    pub fn resolve_endpoint(&self, uri: &str) -> RuntimeResult<SharedEndpoint> {
        Ok(self.inner.components.resolve(uri)?)
    }

    /// 取得 `mock:` 端点以设置期望或注入行为
    pub fn mock_endpoint(&self, uri: &str) -> RuntimeResult<Arc<MockEndpoint>> {
        let parsed = EndpointUri::parse(uri)?;
        if parsed.scheme() != "mock" {
            return Err(EipError::InvalidUri {
                uri: uri.to_string(),
                reason: "not a mock endpoint".to_string(),
            }
            .into());
        }
        Ok(self.inner.mock.endpoint(parsed.path()))
    }

    pub fn create_producer_template(&self) -> ProducerTemplate {
        ProducerTemplate::new(self.inner.producers.clone(), self.inner.exchange_pool.clone())
    }

    /// 转换并注册路由；路由策略在此收到控制任务入口
    pub fn add_route(&self, definition: RouteDefinition) -> RuntimeResult<()> {
        let inner = &self.inner;
        if inner.routes.read().contains_key(&definition.id) {
            return Err(RuntimeError::DuplicateRoute(definition.id));
        }

        let error_handler = definition
            .error_handler
            .as_ref()
            .unwrap_or(&inner.error_handler);
        let on_exceptions: Vec<&OnExceptionDefinition> = definition
            .on_exceptions
            .iter()
            .chain(inner.on_exceptions.iter())
            .collect();
        let reified = Reifier::new(
            &definition.id,
            ReifyContext {
                registry: &inner.registry,
                producers: inner.producers.clone(),
                resolver: inner.components.clone(),
                worker_pool: &inner.worker_pool,
                shutdown: inner.shutdown.clone(),
            },
        )
        .reify(error_handler, &on_exceptions, &definition.steps)?;

        for policy in &definition.route_policies {
            policy.on_init(&definition.id, &inner.controller);
        }

        let route = Arc::new(Route::new(RouteParts {
            id: definition.id.clone(),
            from: definition.from,
            explicit_order: definition.startup_order,
            auto_startup: definition.auto_startup,
            shutdown_route: definition.shutdown_route,
            shutdown_running_task: definition.shutdown_running_task,
            pipeline: reified.pipeline,
            policies: definition.route_policies,
            aggregators: reified.aggregators,
        }));

        let mut routes = inner.routes.write();
        if routes.contains_key(&definition.id) {
            return Err(RuntimeError::DuplicateRoute(definition.id));
        }
        info!(route_id = %definition.id, from = %route.from_uri(), "route added");
        routes.insert(definition.id, route);
        Ok(())
    }

    /// 移除已停止的路由
    pub fn remove_route(&self, route_id: &str) -> RuntimeResult<()> {
        let inner = &self.inner;
        let route = inner.route(route_id)?;
        if route.status() != RouteStatus::Stopped {
            return Err(RuntimeError::InvalidState(format!(
                "route '{route_id}' must be stopped before removal"
            )));
        }
        inner.routes.write().shift_remove(route_id);
        inner.orders.lock().remove(route_id);
        info!(route_id, "route removed");
        Ok(())
    }

    pub fn route_ids(&self) -> Vec<String> {
        self.inner.routes.read().keys().cloned().collect()
    }

    pub fn route_status(&self, route_id: &str) -> Option<RouteStatus> {
        self.inner.routes.read().get(route_id).map(|r| r.status())
    }

    /// 已分配的启动顺序（启动前仅显式顺序可见）
    pub fn startup_order(&self, route_id: &str) -> Option<u32> {
        if let Some(order) = self.inner.orders.lock().get(route_id) {
            return Some(*order);
        }
        self.inner
            .routes
            .read()
            .get(route_id)
            .and_then(|r| r.explicit_order())
    }

    /// 路由当前的在途交换数
    pub fn route_inflight(&self, route_id: &str) -> Option<usize> {
        self.inner.routes.read().get(route_id).map(|r| r.inflight())
    }

    /// 全部路由的在途交换数
    pub fn inflight(&self) -> usize {
        self.inner.routes.read().values().map(|r| r.inflight()).sum()
    }

    pub fn is_started(&self) -> bool {
        *self.inner.state.lock() == ContextState::Started
    }

    /// 分配启动顺序并按升序启动 `auto_startup` 的路由；任一路由启动失败时回滚已启动的路由
    pub async fn start(&self) -> RuntimeResult<()> {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            if *state != ContextState::Created {
                return Err(RuntimeError::InvalidState(format!(
                    "context '{}' cannot be started from state {:?}",
                    inner.config.name, *state
                )));
            }
            *state = ContextState::Started;
        }
        if let Err(err) = inner.assign_orders() {
            *inner.state.lock() = ContextState::Created;
            return Err(err);
        }

        let commands = inner.commands.lock().take();
        if let Some(commands) = commands {
            let task = spawn_controller(
                Arc::downgrade(inner),
                commands,
                inner.controller_token.clone(),
            );
            *inner.controller_task.lock() = Some(task);
        }

        let mut started: Vec<String> = Vec::new();
        for (order, route) in inner.routes_by_order() {
            if !route.auto_startup() {
                debug!(route_id = %route.id(), "auto startup disabled");
                continue;
            }
            if let Err(err) = inner.start_route(route.id()).await {
                error!(route_id = %route.id(), order, error = %err, "route failed to start, rolling back");
                for id in started.iter().rev() {
                    if let Err(stop_err) = inner.stop_route(id).await {
                        warn!(route_id = %id, error = %stop_err, "failed to stop route during rollback");
                    }
                }
                *inner.state.lock() = ContextState::Created;
                return Err(err);
            }
            started.push(route.id().to_string());
        }
        info!(context = %inner.config.name, routes = started.len(), "context started");
        Ok(())
    }

    /// 按关闭策略停止全部路由；返回是否在超时内优雅完成
    pub async fn stop(&self) -> RuntimeResult<bool> {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            if *state != ContextState::Started {
                return Ok(true);
            }
            *state = ContextState::Stopped;
        }
        inner.controller_token.cancel();

        let strategy = ShutdownStrategy::new(&inner.config.shutdown, &inner.shutdown);
        let routes = strategy.order(inner.routes_by_order());
        let graceful = strategy.shutdown(&routes).await;

        inner.shutdown.cancel();
        inner.worker_pool.shutdown();
        let task = inner.controller_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!(context = %inner.config.name, graceful, "context stopped");
        Ok(graceful)
    }

    pub async fn start_route(&self, route_id: &str) -> RuntimeResult<()> {
        self.inner.start_route(route_id).await
    }

    /// 优雅停止单条路由
    pub async fn stop_route(&self, route_id: &str) -> RuntimeResult<()> {
        self.inner.stop_route(route_id).await
    }
}

impl ContextInner {
    fn route(&self, route_id: &str) -> RuntimeResult<Arc<Route>> {
        self.routes
            .read()
            .get(route_id)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownRoute(route_id.to_string()))
    }

    /// 已分配顺序的路由，按启动顺序升序
    fn routes_by_order(&self) -> Vec<(u32, Arc<Route>)> {
        let orders = self.orders.lock();
        let mut routes: Vec<(u32, Arc<Route>)> = self
            .routes
            .read()
            .values()
            .filter_map(|route| orders.get(route.id()).map(|order| (*order, route.clone())))
            .collect();
        routes.sort_by_key(|(order, _)| *order);
        routes
    }

    /// 为尚无顺序的路由分配启动顺序：显式顺序原样使用并检查冲突，其余从 1000 起取未占用的值
    fn assign_orders(&self) -> RuntimeResult<()> {
        let routes = self.routes.read();
        let mut orders = self.orders.lock();

        let mut explicit: HashMap<u32, &str> = HashMap::new();
        for route in routes.values() {
            let Some(order) = route.explicit_order() else {
                continue;
            };
            if let Some(first) = explicit.get(&order) {
                return Err(RuntimeError::StartupOrderClash {
                    order,
                    first: first.to_string(),
                    second: route.id().to_string(),
                });
            }
            explicit.insert(order, route.id());
        }

        let mut used: HashSet<u32> = explicit.keys().copied().collect();
        used.extend(orders.values().copied());
        let mut next = AUTO_STARTUP_ORDER_BASE;
        for route in routes.values() {
            if orders.contains_key(route.id()) {
                continue;
            }
            let order = match route.explicit_order() {
                Some(order) => order,
                None => {
                    while used.contains(&next) {
                        next += 1;
                    }
                    next
                }
            };
            used.insert(order);
            orders.insert(route.id().to_string(), order);
        }
        Ok(())
    }

    pub(crate) async fn start_route(&self, route_id: &str) -> RuntimeResult<()> {
        let route = self.route(route_id)?;
        match route.status() {
            RouteStatus::Started | RouteStatus::Starting => return Ok(()),
            RouteStatus::Stopping => {
                return Err(RuntimeError::InvalidState(format!(
                    "route '{route_id}' is stopping"
                )));
            }
            RouteStatus::Stopped => {}
        }
        let assigned = self.orders.lock().contains_key(route_id);
        if !assigned {
            self.assign_orders()?;
        }

        route.set_status(RouteStatus::Starting);
        if let Err(err) = self.open_consumer(&route).await {
            route.set_status(RouteStatus::Stopped);
            return Err(err.into());
        }
        route.start_completion_timers(self.shutdown.child_token());
        route.set_status(RouteStatus::Started);
        for policy in route.policies() {
            policy.on_start(route_id);
        }
        info!(route_id, from = %route.from_uri(), "route started");
        Ok(())
    }

    async fn open_consumer(&self, route: &Route) -> EipResult<()> {
        let endpoint = self.components.resolve(route.from_uri())?;
        let consumer = endpoint.create_consumer(route.processor()).await?;
        route.attach_consumer(consumer).await
    }

    pub(crate) async fn stop_route(&self, route_id: &str) -> RuntimeResult<()> {
        let route = self.route(route_id)?;
        if route.status() == RouteStatus::Stopped {
            return Ok(());
        }
        ShutdownStrategy::new(&self.config.shutdown, &self.shutdown)
            .stop_one(&route)
            .await;
        Ok(())
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        self.controller_token.cancel();
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StepDefinition;
    use eip_core::expression;

    fn route(id: &str, order: Option<u32>) -> RouteDefinition {
        RouteDefinition::builder()
            .id(id)
            .from(format!("direct:{id}"))
            .steps(vec![StepDefinition::set_body(expression::constant("ok"))])
            .maybe_startup_order(order)
            .build()
    }

    #[tokio::test]
    async fn auto_orders_skip_explicit_values() {
        let context = EipContext::default();
        context.add_route(route("a", None)).unwrap();
        context.add_route(route("b", Some(1000))).unwrap();
        context.add_route(route("c", None)).unwrap();
        context.start().await.unwrap();

        assert_eq!(context.startup_order("a"), Some(1001));
        assert_eq!(context.startup_order("b"), Some(1000));
        assert_eq!(context.startup_order("c"), Some(1002));
        assert_eq!(context.route_status("a"), Some(RouteStatus::Started));
        context.stop().await.unwrap();
        assert_eq!(context.route_status("a"), Some(RouteStatus::Stopped));
    }

    #[tokio::test]
    async fn duplicate_route_ids_are_rejected() {
        let context = EipContext::default();
        context.add_route(route("a", None)).unwrap();
        assert!(matches!(
            context.add_route(route("a", None)),
            Err(RuntimeError::DuplicateRoute(id)) if id == "a"
        ));
    }

    #[tokio::test]
    async fn stopped_context_cannot_restart() {
        let context = EipContext::default();
        context.start().await.unwrap();
        assert!(context.stop().await.unwrap());
        assert!(matches!(
            context.start().await,
            Err(RuntimeError::InvalidState(_))
        ));
    }
}
