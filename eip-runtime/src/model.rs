//! 路由定义模型
//!
//! 定义是纯数据：由 `Reifier` 在添加路由时转换为处理器树。
//! 引用字符串（`*_ref`）在转换时从注册表解析。
//!
use crate::policy::SharedRoutePolicy;
use bon::Builder;
use eip_core::aggregation::SharedAggregationStrategy;
use eip_core::errorhandler::{ExceptionMatcher, RedeliveryPolicy};
use eip_core::expression::{SharedExpression, SharedPredicate, SplitItems};
use eip_core::processor::{IdempotentRepository, MulticastConfig, SharedProcessor};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// 路由定义
#[derive(Builder)]
pub struct RouteDefinition {
    #[builder(into)]
    pub(crate) id: String,
    /// 消费端点 URI
    #[builder(into)]
    pub(crate) from: String,
    pub(crate) steps: Vec<StepDefinition>,
    /// 显式启动顺序；缺省时从 1000 起自动分配
    pub(crate) startup_order: Option<u32>,
    #[builder(default = true)]
    pub(crate) auto_startup: bool,
    /// 缺省时继承上下文的错误处理器
    pub(crate) error_handler: Option<ErrorHandlerDefinition>,
    #[builder(default)]
    pub(crate) on_exceptions: Vec<OnExceptionDefinition>,
    #[builder(default)]
    pub(crate) route_policies: Vec<SharedRoutePolicy>,
    #[builder(default)]
    pub(crate) shutdown_route: ShutdownRoute,
    #[builder(default)]
    pub(crate) shutdown_running_task: ShutdownRunningTask,
}

impl RouteDefinition {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn from_uri(&self) -> &str {
        &self.from
    }
}

/// 关闭时机：`Defer` 的路由在其他路由都停止之后才停止
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ShutdownRoute {
    #[default]
    Default,
    Defer,
}

/// 关闭时对已接收任务的处理
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ShutdownRunningTask {
    /// 只完成正在处理的交换，队列中待处理的交换被丢弃
    #[default]
    CompleteCurrentTaskOnly,
    /// 先处理完消费者队列中的全部交换
    CompleteAllTasks,
}

/// 错误处理器种类
#[derive(Debug, Clone, Default)]
pub enum ErrorHandlerKind {
    /// 默认错误处理器：耗尽后失败返回给调用方
    #[default]
    Default,
    /// 死信通道：耗尽后投递到该 URI 并视为已处理
    DeadLetterChannel(String),
    /// 不包裹任何错误处理
    NoErrorHandler,
}

/// 错误处理器定义（上下文级或路由级）
#[derive(Clone, Builder)]
pub struct ErrorHandlerDefinition {
    #[builder(default)]
    pub(crate) kind: ErrorHandlerKind,
    #[builder(default)]
    pub(crate) redelivery_policy: RedeliveryPolicy,
    /// 注册表中 `RedeliveryPolicy` 的名称，优先于 `redelivery_policy`
    #[builder(into)]
    pub(crate) redelivery_policy_ref: Option<String>,
    #[builder(default)]
    pub(crate) use_original_message: bool,
    #[builder(default = true)]
    pub(crate) dead_letter_handle_new_exception: bool,
    pub(crate) on_redelivery: Option<SharedProcessor>,
    pub(crate) on_prepare_failure: Option<SharedProcessor>,
    pub(crate) retry_while: Option<SharedPredicate>,
}

impl ErrorHandlerDefinition {
    pub fn default_handler() -> Self {
        Self::builder().build()
    }

    pub fn dead_letter(uri: impl Into<String>) -> Self {
        Self::builder()
            .kind(ErrorHandlerKind::DeadLetterChannel(uri.into()))
            .build()
    }

    pub fn no_error_handler() -> Self {
        Self::builder().kind(ErrorHandlerKind::NoErrorHandler).build()
    }

    pub fn kind(&self) -> &ErrorHandlerKind {
        &self.kind
    }
}

/// onException 定义
#[derive(Builder)]
pub struct OnExceptionDefinition {
    pub(crate) exceptions: Vec<ExceptionMatcher>,
    pub(crate) on_when: Option<SharedPredicate>,
    pub(crate) handled: Option<bool>,
    pub(crate) continued: Option<bool>,
    pub(crate) redelivery_policy: Option<RedeliveryPolicy>,
    #[builder(into)]
    pub(crate) redelivery_policy_ref: Option<String>,
    pub(crate) retry_while: Option<SharedPredicate>,
    #[builder(default)]
    pub(crate) use_original_message: bool,
    pub(crate) on_redelivery: Option<SharedProcessor>,
    #[builder(default)]
    pub(crate) steps: Vec<StepDefinition>,
}

/// 路由步骤
pub enum StepDefinition {
    Process(SharedProcessor),
    /// 注册表中 `SharedProcessor` 的名称
    ProcessRef(String),
    To(String),
    SetBody(SharedExpression),
    SetHeader {
        name: String,
        expression: SharedExpression,
    },
    SetProperty {
        name: String,
        expression: SharedExpression,
    },
    SetVariable {
        name: String,
        expression: SharedExpression,
    },
    RemoveHeader(String),
    Log {
        name: String,
        message: SharedExpression,
    },
    Stop,
    Filter {
        predicate: SharedPredicate,
        steps: Vec<StepDefinition>,
    },
    Choice(ChoiceDefinition),
    Multicast(MulticastDefinition),
    Split(SplitDefinition),
    RecipientList(RecipientListDefinition),
    RoutingSlip(RoutingSlipDefinition),
    Aggregate(AggregateDefinition),
    Loop(LoopDefinition),
    /// 延迟毫秒数的表达式
    Delay(SharedExpression),
    Threads {
        /// 缺省时使用上下文工作池
        pool_size: Option<usize>,
        steps: Vec<StepDefinition>,
    },
    IdempotentConsumer(IdempotentConsumerDefinition),
    LoadBalance(LoadBalanceDefinition),
}

impl StepDefinition {
    pub fn process(processor: SharedProcessor) -> Self {
        Self::Process(processor)
    }

    pub fn process_ref(name: impl Into<String>) -> Self {
        Self::ProcessRef(name.into())
    }

    pub fn to(uri: impl Into<String>) -> Self {
        Self::To(uri.into())
    }

    pub fn set_body(expression: SharedExpression) -> Self {
        Self::SetBody(expression)
    }

    pub fn set_header(name: impl Into<String>, expression: SharedExpression) -> Self {
        Self::SetHeader {
            name: name.into(),
            expression,
        }
    }

    pub fn set_property(name: impl Into<String>, expression: SharedExpression) -> Self {
        Self::SetProperty {
            name: name.into(),
            expression,
        }
    }

    pub fn set_variable(name: impl Into<String>, expression: SharedExpression) -> Self {
        Self::SetVariable {
            name: name.into(),
            expression,
        }
    }

    pub fn remove_header(name: impl Into<String>) -> Self {
        Self::RemoveHeader(name.into())
    }

    pub fn log(name: impl Into<String>, message: SharedExpression) -> Self {
        Self::Log {
            name: name.into(),
            message,
        }
    }

    pub fn filter(predicate: SharedPredicate, steps: Vec<StepDefinition>) -> Self {
        Self::Filter { predicate, steps }
    }

    pub fn delay(millis: SharedExpression) -> Self {
        Self::Delay(millis)
    }

    pub fn threads(pool_size: Option<usize>, steps: Vec<StepDefinition>) -> Self {
        Self::Threads { pool_size, steps }
    }
}

macro_rules! step_from {
    ($($def:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$def> for StepDefinition {
                fn from(def: $def) -> Self {
                    Self::$variant(def)
                }
            }
        )*
    };
}

step_from! {
    ChoiceDefinition => Choice,
    MulticastDefinition => Multicast,
    SplitDefinition => Split,
    RecipientListDefinition => RecipientList,
    RoutingSlipDefinition => RoutingSlip,
    AggregateDefinition => Aggregate,
    LoopDefinition => Loop,
    IdempotentConsumerDefinition => IdempotentConsumer,
    LoadBalanceDefinition => LoadBalance,
}

/// 基于内容的路由
#[derive(Default)]
pub struct ChoiceDefinition {
    pub(crate) whens: Vec<(SharedPredicate, Vec<StepDefinition>)>,
    pub(crate) otherwise: Option<Vec<StepDefinition>>,
}

impl ChoiceDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, predicate: SharedPredicate, steps: Vec<StepDefinition>) -> Self {
        self.whens.push((predicate, steps));
        self
    }

    pub fn otherwise(mut self, steps: Vec<StepDefinition>) -> Self {
        self.otherwise = Some(steps);
        self
    }
}

#[derive(Builder)]
pub struct MulticastDefinition {
    /// 每个输出是一组步骤
    pub(crate) outputs: Vec<Vec<StepDefinition>>,
    #[builder(default)]
    pub(crate) config: MulticastConfig,
    #[builder(into)]
    pub(crate) strategy_ref: Option<String>,
    /// 为 false 时分支内的失败交给扇出调用处的错误处理器
    #[builder(default = true)]
    pub(crate) inherit_error_handler: bool,
}

#[derive(Builder)]
pub struct SplitDefinition {
    pub(crate) expression: SharedExpression<SplitItems>,
    pub(crate) steps: Vec<StepDefinition>,
    #[builder(default)]
    pub(crate) config: MulticastConfig,
    #[builder(into)]
    pub(crate) strategy_ref: Option<String>,
}

#[derive(Builder)]
pub struct RecipientListDefinition {
    pub(crate) expression: SharedExpression,
    #[builder(into, default = ",".to_owned())]
    pub(crate) delimiter: String,
    #[builder(default)]
    pub(crate) ignore_invalid_endpoints: bool,
    /// 专用生产者缓存容量；缺省共享上下文缓存，-1 禁用缓存
    pub(crate) cache_size: Option<i32>,
    #[builder(into)]
    pub(crate) result_variable: Option<String>,
    #[builder(default)]
    pub(crate) config: MulticastConfig,
    #[builder(into)]
    pub(crate) strategy_ref: Option<String>,
}

#[derive(Builder)]
pub struct RoutingSlipDefinition {
    pub(crate) expression: SharedExpression,
    #[builder(into, default = ",".to_owned())]
    pub(crate) delimiter: String,
    #[builder(default)]
    pub(crate) ignore_invalid_endpoints: bool,
    pub(crate) cache_size: Option<i32>,
    #[builder(into)]
    pub(crate) result_variable: Option<String>,
}

#[derive(Builder)]
pub struct AggregateDefinition {
    pub(crate) correlation: SharedExpression,
    pub(crate) strategy: Option<SharedAggregationStrategy>,
    #[builder(into)]
    pub(crate) strategy_ref: Option<String>,
    pub(crate) completion_size: Option<usize>,
    pub(crate) completion_predicate: Option<SharedPredicate>,
    /// 组空闲超过此时长即完成；不能与 `completion_interval` 同时使用
    pub(crate) completion_timeout: Option<Duration>,
    pub(crate) completion_interval: Option<Duration>,
    pub(crate) timeout_checker_interval: Option<Duration>,
    /// 聚合完成后的步骤
    pub(crate) steps: Vec<StepDefinition>,
}

/// 循环：`count` 与 `while_predicate` 二选一
#[derive(Builder)]
pub struct LoopDefinition {
    pub(crate) count: Option<SharedExpression>,
    pub(crate) while_predicate: Option<SharedPredicate>,
    #[builder(default)]
    pub(crate) copy: bool,
    pub(crate) steps: Vec<StepDefinition>,
}

#[derive(Builder)]
pub struct IdempotentConsumerDefinition {
    pub(crate) message_id: SharedExpression,
    pub(crate) repository: Option<Arc<dyn IdempotentRepository>>,
    /// 注册表中 `Arc<dyn IdempotentRepository>` 的名称
    #[builder(into)]
    pub(crate) repository_ref: Option<String>,
    #[builder(default = true)]
    pub(crate) eager: bool,
    #[builder(default = true)]
    pub(crate) skip_duplicate: bool,
    #[builder(default = true)]
    pub(crate) remove_on_failure: bool,
    pub(crate) steps: Vec<StepDefinition>,
}

pub enum LoadBalancerKind {
    RoundRobin,
    Random,
    Sticky(SharedExpression),
    Topic,
    Failover {
        /// -1 不限
        maximum_failover_attempts: i32,
        round_robin: bool,
        exceptions: Vec<ExceptionMatcher>,
    },
}

#[derive(Builder)]
pub struct LoadBalanceDefinition {
    pub(crate) kind: LoadBalancerKind,
    pub(crate) outputs: Vec<Vec<StepDefinition>>,
    #[builder(default = true)]
    pub(crate) inherit_error_handler: bool,
}
