//! 定义 → 处理器树
//!
//! 每个步骤各自包裹一层重投错误处理器（步骤级通道），嵌套步骤同样如此；
//! 内层已处理的交换不会被外层再次处理。以下情况不包裹：
//! - 错误处理器为 `NoErrorHandler`；
//! - onException 子句内的步骤；
//! - `inherit_error_handler(false)` 的多播/负载均衡分支。
//!
use crate::error::{RuntimeError, RuntimeResult};
use crate::model::{
    AggregateDefinition, ErrorHandlerDefinition, ErrorHandlerKind, IdempotentConsumerDefinition,
    LoadBalanceDefinition, LoadBalancerKind, LoopDefinition, OnExceptionDefinition,
    StepDefinition,
};
use eip_core::aggregation::SharedAggregationStrategy;
use eip_core::endpoint::{ProducerCache, SharedResolver};
use eip_core::errorhandler::{
    ErrorHandlerConfig, ExceptionClause, RedeliveryErrorHandler, RedeliveryPolicy,
};
use eip_core::executor::WorkerPool;
use eip_core::loadbalancer::{
    FailoverLoadBalancer, RandomLoadBalancer, RoundRobinLoadBalancer, StickyLoadBalancer,
    TopicLoadBalancer,
};
use eip_core::processor::{
    AggregatorProcessor, ChoiceProcessor, DelayProcessor, FilterProcessor, IdempotentConsumer,
    IdempotentRepository, LogProcessor, LoopProcessor, MulticastConfig, MulticastProcessor,
    Pipeline, RecipientListProcessor, RemoveHeaderProcessor, RoutingSlipProcessor,
    SendProcessor, SetBodyProcessor, SetHeaderProcessor, SetPropertyProcessor,
    SetVariableProcessor, SharedProcessor, SplitterProcessor, StopProcessor, ThreadsProcessor,
    WhenClause,
};
use eip_core::registry::Registry;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 转换所需的上下文资源
pub(crate) struct ReifyContext<'a> {
    pub registry: &'a Registry,
    pub producers: Arc<ProducerCache>,
    pub resolver: SharedResolver,
    pub worker_pool: &'a WorkerPool,
    pub shutdown: CancellationToken,
}

pub(crate) struct Reifier<'a> {
    route_id: &'a str,
    ctx: ReifyContext<'a>,
    error_handler: Option<Arc<ErrorHandlerConfig>>,
    aggregators: Vec<Arc<AggregatorProcessor>>,
}

/// 转换结果：路由主体处理器与需要在关闭时强制完成的聚合器
pub(crate) struct Reified {
    pub pipeline: SharedProcessor,
    pub aggregators: Vec<Arc<AggregatorProcessor>>,
}

impl<'a> Reifier<'a> {
    pub(crate) fn new(route_id: &'a str, ctx: ReifyContext<'a>) -> Self {
        Self {
            route_id,
            ctx,
            error_handler: None,
            aggregators: Vec::new(),
        }
    }

    /// 路由级 onException 在前，上下文级在后
    pub(crate) fn reify(
        mut self,
        error_handler: &ErrorHandlerDefinition,
        on_exceptions: &[&OnExceptionDefinition],
        steps: &[StepDefinition],
    ) -> RuntimeResult<Reified> {
        self.error_handler = self.error_handler_config(error_handler, on_exceptions)?;
        let pipeline = self.pipeline(steps, true)?;
        Ok(Reified {
            pipeline,
            aggregators: self.aggregators,
        })
    }

    fn error_handler_config(
        &mut self,
        definition: &ErrorHandlerDefinition,
        on_exceptions: &[&OnExceptionDefinition],
    ) -> RuntimeResult<Option<Arc<ErrorHandlerConfig>>> {
        let dead_letter_uri = match &definition.kind {
            ErrorHandlerKind::NoErrorHandler => return Ok(None),
            ErrorHandlerKind::Default => None,
            ErrorHandlerKind::DeadLetterChannel(uri) => Some(uri.clone()),
        };
        let dead_letter = dead_letter_uri.as_ref().map(|uri| -> SharedProcessor {
            Arc::new(SendProcessor::new(uri.clone(), self.ctx.producers.clone()))
        });
        let redelivery_policy = match &definition.redelivery_policy_ref {
            Some(name) => self.redelivery_policy_ref(name)?,
            None => definition.redelivery_policy.clone(),
        };
        let clauses = on_exceptions
            .iter()
            .map(|def| self.exception_clause(def))
            .collect::<RuntimeResult<Vec<_>>>()?;

        let config = ErrorHandlerConfig::builder()
            .route_id(self.route_id)
            .redelivery_policy(redelivery_policy)
            .exception_clauses(clauses)
            .maybe_dead_letter(dead_letter)
            .maybe_dead_letter_uri(dead_letter_uri)
            .use_original_message(definition.use_original_message)
            .dead_letter_handle_new_exception(definition.dead_letter_handle_new_exception)
            .maybe_on_redelivery(definition.on_redelivery.clone())
            .maybe_on_prepare_failure(definition.on_prepare_failure.clone())
            .maybe_retry_while(definition.retry_while.clone())
            .shutdown(self.ctx.shutdown.clone())
            .build();
        Ok(Some(Arc::new(config)))
    }

    fn exception_clause(&mut self, def: &OnExceptionDefinition) -> RuntimeResult<ExceptionClause> {
        if def.exceptions.is_empty() {
            return Err(RuntimeError::invalid_definition(
                self.route_id,
                "onException requires at least one exception type",
            ));
        }
        let redelivery_policy = match &def.redelivery_policy_ref {
            Some(name) => Some(self.redelivery_policy_ref(name)?),
            None => def.redelivery_policy.clone(),
        };
        let output = if def.steps.is_empty() {
            None
        } else {
            Some(self.pipeline(&def.steps, false)?)
        };
        Ok(ExceptionClause::builder()
            .matchers(def.exceptions.clone())
            .maybe_on_when(def.on_when.clone())
            .maybe_handled(def.handled)
            .maybe_continued(def.continued)
            .maybe_redelivery_policy(redelivery_policy)
            .maybe_retry_while(def.retry_while.clone())
            .use_original_message(def.use_original_message)
            .maybe_on_redelivery(def.on_redelivery.clone())
            .maybe_output(output)
            .build())
    }

    fn redelivery_policy_ref(&self, name: &str) -> RuntimeResult<RedeliveryPolicy> {
        let policy = self.ctx.registry.require::<RedeliveryPolicy>(name)?;
        Ok((*policy).clone())
    }

    fn wrap(&self, processor: SharedProcessor, inherit: bool) -> SharedProcessor {
        match (&self.error_handler, inherit) {
            (Some(config), true) => RedeliveryErrorHandler::wrap(processor, config.clone()),
            _ => processor,
        }
    }

    fn pipeline(&mut self, steps: &[StepDefinition], inherit: bool) -> RuntimeResult<SharedProcessor> {
        let mut processors = Vec::with_capacity(steps.len());
        for step in steps {
            let processor = self.step(step, inherit)?;
            processors.push(self.wrap(processor, inherit));
        }
        Ok(Pipeline::shared(processors))
    }

    fn step(&mut self, step: &StepDefinition, inherit: bool) -> RuntimeResult<SharedProcessor> {
        let processor: SharedProcessor = match step {
            StepDefinition::Process(processor) => processor.clone(),
            StepDefinition::ProcessRef(name) => {
                (*self.ctx.registry.require::<SharedProcessor>(name)?).clone()
            }
            StepDefinition::To(uri) => {
                Arc::new(SendProcessor::new(uri.clone(), self.ctx.producers.clone()))
            }
            StepDefinition::SetBody(expression) => {
                Arc::new(SetBodyProcessor::new(expression.clone()))
            }
            StepDefinition::SetHeader { name, expression } => {
                Arc::new(SetHeaderProcessor::new(name.clone(), expression.clone()))
            }
            StepDefinition::SetProperty { name, expression } => {
                Arc::new(SetPropertyProcessor::new(name.clone(), expression.clone()))
            }
            StepDefinition::SetVariable { name, expression } => {
                Arc::new(SetVariableProcessor::new(name.clone(), expression.clone()))
            }
            StepDefinition::RemoveHeader(name) => Arc::new(RemoveHeaderProcessor::new(name.clone())),
            StepDefinition::Log { name, message } => {
                Arc::new(LogProcessor::new(name.clone(), message.clone()))
            }
            StepDefinition::Stop => Arc::new(StopProcessor),
            StepDefinition::Filter { predicate, steps } => Arc::new(FilterProcessor::new(
                predicate.clone(),
                self.pipeline(steps, inherit)?,
            )),
            StepDefinition::Choice(def) => {
                let mut whens = Vec::with_capacity(def.whens.len());
                for (predicate, steps) in &def.whens {
                    whens.push(WhenClause::new(predicate.clone(), self.pipeline(steps, inherit)?));
                }
                let otherwise = match &def.otherwise {
                    Some(steps) => Some(self.pipeline(steps, inherit)?),
                    None => None,
                };
                Arc::new(ChoiceProcessor::new(whens, otherwise))
            }
            StepDefinition::Multicast(def) => {
                let branch_inherit = inherit && def.inherit_error_handler;
                let mut outputs = Vec::with_capacity(def.outputs.len());
                for steps in &def.outputs {
                    outputs.push(self.pipeline(steps, branch_inherit)?);
                }
                let config = self.fanout_config(&def.config, def.strategy_ref.as_deref())?;
                Arc::new(MulticastProcessor::new(outputs, config))
            }
            StepDefinition::Split(def) => {
                let output = self.pipeline(&def.steps, inherit)?;
                let config = self.fanout_config(&def.config, def.strategy_ref.as_deref())?;
                Arc::new(SplitterProcessor::new(def.expression.clone(), output, config))
            }
            StepDefinition::RecipientList(def) => {
                let config = self.fanout_config(&def.config, def.strategy_ref.as_deref())?;
                Arc::new(
                    RecipientListProcessor::builder()
                        .expression(def.expression.clone())
                        .producers(self.producer_cache(def.cache_size))
                        .delimiter(def.delimiter.clone())
                        .ignore_invalid_endpoints(def.ignore_invalid_endpoints)
                        .maybe_result_variable(def.result_variable.clone())
                        .config(config)
                        .build(),
                )
            }
            StepDefinition::RoutingSlip(def) => Arc::new(
                RoutingSlipProcessor::builder()
                    .expression(def.expression.clone())
                    .producers(self.producer_cache(def.cache_size))
                    .delimiter(def.delimiter.clone())
                    .ignore_invalid_endpoints(def.ignore_invalid_endpoints)
                    .maybe_result_variable(def.result_variable.clone())
                    .build(),
            ),
            StepDefinition::Aggregate(def) => self.aggregate(def, inherit)?,
            StepDefinition::Loop(def) => self.looping(def, inherit)?,
            StepDefinition::Delay(expression) => Arc::new(DelayProcessor::new(
                expression.clone(),
                self.ctx.shutdown.clone(),
            )),
            StepDefinition::Threads { pool_size, steps } => {
                let pool = match pool_size {
                    Some(size) => WorkerPool::new(format!("{}-threads", self.route_id), *size),
                    None => self.ctx.worker_pool.clone(),
                };
                Arc::new(ThreadsProcessor::new(pool, self.pipeline(steps, inherit)?))
            }
            StepDefinition::IdempotentConsumer(def) => self.idempotent(def, inherit)?,
            StepDefinition::LoadBalance(def) => self.load_balance(def, inherit)?,
        };
        Ok(processor)
    }

    /// 未显式给出策略时按引用查找；并行且未指定工作池时使用上下文工作池
    fn fanout_config(
        &self,
        config: &MulticastConfig,
        strategy_ref: Option<&str>,
    ) -> RuntimeResult<MulticastConfig> {
        let mut config = config.clone();
        if config.aggregation_strategy.is_none()
            && let Some(name) = strategy_ref
        {
            config.aggregation_strategy = Some(self.strategy_ref(name)?);
        }
        if config.parallel_processing && config.worker_pool.is_none() {
            config.worker_pool = Some(self.ctx.worker_pool.clone());
        }
        Ok(config)
    }

    fn strategy_ref(&self, name: &str) -> RuntimeResult<SharedAggregationStrategy> {
        let strategy = self.ctx.registry.require::<SharedAggregationStrategy>(name)?;
        Ok((*strategy).clone())
    }

    fn producer_cache(&self, cache_size: Option<i32>) -> Arc<ProducerCache> {
        match cache_size {
            Some(size) => Arc::new(ProducerCache::new(self.ctx.resolver.clone(), size)),
            None => self.ctx.producers.clone(),
        }
    }

    fn aggregate(&mut self, def: &AggregateDefinition, inherit: bool) -> RuntimeResult<SharedProcessor> {
        let strategy = match (&def.strategy, &def.strategy_ref) {
            (Some(strategy), _) => strategy.clone(),
            (None, Some(name)) => self.strategy_ref(name)?,
            (None, None) => {
                return Err(RuntimeError::invalid_definition(
                    self.route_id,
                    "aggregate requires an aggregation strategy",
                ));
            }
        };
        if def.completion_timeout.is_some() && def.completion_interval.is_some() {
            return Err(RuntimeError::invalid_definition(
                self.route_id,
                "aggregate accepts only one of completion timeout or completion interval",
            ));
        }
        if def.completion_size.is_none()
            && def.completion_predicate.is_none()
            && def.completion_timeout.is_none()
            && def.completion_interval.is_none()
        {
            return Err(RuntimeError::invalid_definition(
                self.route_id,
                "aggregate requires a completion size, predicate, timeout or interval",
            ));
        }
        let aggregator = Arc::new(
            AggregatorProcessor::builder()
                .correlation(def.correlation.clone())
                .strategy(strategy)
                .output(self.pipeline(&def.steps, inherit)?)
                .maybe_completion_size(def.completion_size)
                .maybe_completion_predicate(def.completion_predicate.clone())
                .maybe_completion_timeout(def.completion_timeout)
                .maybe_completion_interval(def.completion_interval)
                .maybe_timeout_checker_interval(def.timeout_checker_interval)
                .build(),
        );
        let processor: SharedProcessor = aggregator.clone();
        self.aggregators.push(aggregator);
        Ok(processor)
    }

    fn looping(&mut self, def: &LoopDefinition, inherit: bool) -> RuntimeResult<SharedProcessor> {
        let output = self.pipeline(&def.steps, inherit)?;
        let processor = match (&def.count, &def.while_predicate) {
            (Some(count), None) => LoopProcessor::count(count.clone(), output),
            (None, Some(predicate)) => LoopProcessor::do_while(predicate.clone(), output),
            _ => {
                return Err(RuntimeError::invalid_definition(
                    self.route_id,
                    "loop requires exactly one of a count expression or a while predicate",
                ));
            }
        };
        Ok(Arc::new(processor.with_copy(def.copy)))
    }

    fn idempotent(
        &mut self,
        def: &IdempotentConsumerDefinition,
        inherit: bool,
    ) -> RuntimeResult<SharedProcessor> {
        let repository = match (&def.repository, &def.repository_ref) {
            (Some(repository), _) => repository.clone(),
            (None, Some(name)) => {
                (*self.ctx.registry.require::<Arc<dyn IdempotentRepository>>(name)?).clone()
            }
            (None, None) => {
                return Err(RuntimeError::invalid_definition(
                    self.route_id,
                    "idempotent consumer requires a repository",
                ));
            }
        };
        Ok(Arc::new(
            IdempotentConsumer::builder()
                .message_id(def.message_id.clone())
                .repository(repository)
                .output(self.pipeline(&def.steps, inherit)?)
                .eager(def.eager)
                .skip_duplicate(def.skip_duplicate)
                .remove_on_failure(def.remove_on_failure)
                .build(),
        ))
    }

    fn load_balance(
        &mut self,
        def: &LoadBalanceDefinition,
        inherit: bool,
    ) -> RuntimeResult<SharedProcessor> {
        if def.outputs.is_empty() {
            return Err(RuntimeError::invalid_definition(
                self.route_id,
                "load balancer requires at least one output",
            ));
        }
        let branch_inherit = inherit && def.inherit_error_handler;
        let mut destinations = Vec::with_capacity(def.outputs.len());
        for steps in &def.outputs {
            destinations.push(self.pipeline(steps, branch_inherit)?);
        }
        let balancer: SharedProcessor = match &def.kind {
            LoadBalancerKind::RoundRobin => Arc::new(RoundRobinLoadBalancer::new(destinations)),
            LoadBalancerKind::Random => Arc::new(RandomLoadBalancer::new(destinations)),
            LoadBalancerKind::Sticky(key) => {
                Arc::new(StickyLoadBalancer::new(key.clone(), destinations))
            }
            LoadBalancerKind::Topic => Arc::new(TopicLoadBalancer::new(destinations)),
            LoadBalancerKind::Failover {
                maximum_failover_attempts,
                round_robin,
                exceptions,
            } => Arc::new(
                FailoverLoadBalancer::builder()
                    .destinations(destinations)
                    .maximum_failover_attempts(*maximum_failover_attempts)
                    .round_robin(*round_robin)
                    .exceptions(exceptions.clone())
                    .build(),
            ),
        };
        Ok(balancer)
    }
}
