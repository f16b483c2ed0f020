//! 重投错误处理器（RedeliveryErrorHandler）
//!
//! 包裹单个路由步骤，在步骤失败时依次：
//! 1. 记录 `exception_caught`，选择匹配的 onException 子句及其重投策略；
//! 2. 按 `retry_while` 或重投计数决定是否重投，等待计算出的延迟（可被关闭打断）；
//! 3. 重投耗尽后执行 `on_prepare_failure`，再交给子句步骤或死信端点；
//! 4. 按 handled / continued 语义设置交换的最终状态。
//!
//! 已被内层处理器处理过的交换（`error_handler_handled` 已设置）不会再次处理。
//!
use super::{ExceptionClause, RedeliveryPolicy, select_clause};
use crate::error::{EipError, Failure};
use crate::exchange::{
    Exchange,
    keys::{header, property},
};
use crate::expression::SharedPredicate;
use crate::processor::{Processor, SharedProcessor, process_capturing};
use async_trait::async_trait;
use bon::Builder;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// 错误处理器配置，同一路由内的各步骤共享
#[derive(Clone, Builder)]
pub struct ErrorHandlerConfig {
    #[builder(into)]
    route_id: String,
    #[builder(default)]
    redelivery_policy: RedeliveryPolicy,
    #[builder(default)]
    exception_clauses: Vec<ExceptionClause>,
    /// 死信通道的投递处理器；设置即为死信通道语义（默认 handled）
    dead_letter: Option<SharedProcessor>,
    #[builder(into)]
    dead_letter_uri: Option<String>,
    #[builder(default)]
    use_original_message: bool,
    #[builder(default = true)]
    dead_letter_handle_new_exception: bool,
    on_redelivery: Option<SharedProcessor>,
    on_prepare_failure: Option<SharedProcessor>,
    retry_while: Option<SharedPredicate>,
    /// 强制关闭信号：打断重投等待
    #[builder(default)]
    shutdown: CancellationToken,
}

impl ErrorHandlerConfig {
    pub fn route_id(&self) -> &str {
        &self.route_id
    }

    pub fn is_dead_letter_channel(&self) -> bool {
        self.dead_letter.is_some()
    }

    pub fn dead_letter_uri(&self) -> Option<&str> {
        self.dead_letter_uri.as_deref()
    }

    pub fn redelivery_policy(&self) -> &RedeliveryPolicy {
        &self.redelivery_policy
    }

    pub fn exception_clauses(&self) -> &[ExceptionClause] {
        &self.exception_clauses
    }
}

pub struct RedeliveryErrorHandler {
    output: SharedProcessor,
    config: Arc<ErrorHandlerConfig>,
}

impl RedeliveryErrorHandler {
    pub fn new(output: SharedProcessor, config: Arc<ErrorHandlerConfig>) -> Self {
        Self { output, config }
    }

    pub fn wrap(output: SharedProcessor, config: Arc<ErrorHandlerConfig>) -> SharedProcessor {
        Arc::new(Self::new(output, config))
    }

    pub fn config(&self) -> &ErrorHandlerConfig {
        &self.config
    }

    async fn exhausted(
        &self,
        exchange: &mut Exchange,
        failure: Failure,
        clause: Option<&ExceptionClause>,
        policy: &RedeliveryPolicy,
        attempts: u32,
    ) {
        let cfg = &self.config;
        exchange.set_redelivery_exhausted(true);
        exchange.set_property(property::FAILURE_ROUTE_ID, cfg.route_id.clone());
        if let Some(endpoint) = exchange.property(property::TO_ENDPOINT).cloned() {
            exchange.set_property(property::FAILURE_ENDPOINT, endpoint);
        }

        if policy.log_exhausted {
            if policy.log_stack_trace {
                error!(
                    route_id = %cfg.route_id,
                    exchange_id = %exchange.id(),
                    attempts,
                    error = %format!("{failure:#}"),
                    "failed delivery, exhausted after all redelivery attempts"
                );
            } else {
                warn!(
                    route_id = %cfg.route_id,
                    exchange_id = %exchange.id(),
                    attempts,
                    error = %failure,
                    "failed delivery, exhausted after all redelivery attempts"
                );
            }
        }

        let clause_output = clause.and_then(|c| c.output().cloned());
        let to_dead_letter = clause_output.is_none() && cfg.dead_letter.is_some();
        let failure_processor = clause_output.or_else(|| cfg.dead_letter.clone());
        let handled = clause
            .and_then(|c| c.handled())
            .unwrap_or(cfg.is_dead_letter_channel());
        let continued = clause.and_then(|c| c.continued()).unwrap_or(false);
        let use_original =
            cfg.use_original_message || clause.is_some_and(|c| c.use_original_message());

        // 失败处理期间失败槽为空，错误保留在 exception_caught 中
        exchange.clear_failure();
        if let Some(prepare) = &cfg.on_prepare_failure {
            process_capturing(prepare.as_ref(), exchange).await;
        }
        if let Some(processor) = failure_processor {
            if use_original {
                if let Some(original) = exchange.original_message().cloned() {
                    exchange.take_out();
                    *exchange.in_message_mut() = original;
                }
            }
            if !exchange.is_failed() {
                process_capturing(processor.as_ref(), exchange).await;
            }
        }

        if let Some(new_failure) = exchange.take_failure() {
            if to_dead_letter && cfg.dead_letter_handle_new_exception {
                warn!(
                    route_id = %cfg.route_id,
                    exchange_id = %exchange.id(),
                    dead_letter = cfg.dead_letter_uri.as_deref().unwrap_or("-"),
                    error = %new_failure,
                    "dead letter delivery failed, new failure handled"
                );
                exchange.set_error_handler_handled(Some(true));
            } else {
                exchange.set_failure(new_failure);
                exchange.set_error_handler_handled(Some(false));
            }
            return;
        }

        if continued {
            debug!(route_id = %cfg.route_id, exchange_id = %exchange.id(), "failure handled, continuing");
            exchange.set_error_handler_handled(None);
        } else if handled {
            exchange.set_error_handler_handled(Some(true));
        } else {
            exchange.set_failure(failure);
            exchange.set_error_handler_handled(Some(false));
        }
    }

    fn interrupted(&self, exchange: &mut Exchange, attempts: u32) {
        warn!(
            route_id = %self.config.route_id,
            exchange_id = %exchange.id(),
            attempts,
            "redelivery interrupted by shutdown"
        );
        let reason = format!("redelivery of exchange {} interrupted by shutdown", exchange.id());
        exchange.set_failure(EipError::interrupted(reason));
        exchange.set_redelivery_exhausted(true);
        exchange.set_error_handler_handled(Some(false));
    }
}

#[async_trait]
impl Processor for RedeliveryErrorHandler {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let cfg = &self.config;
        let mut counter: u32 = 0;
        let mut previous_delay: u64 = 0;

        loop {
            process_capturing(self.output.as_ref(), exchange).await;
            let Some(failure) = exchange.failure().cloned() else {
                return Ok(());
            };
            if exchange.error_handler_handled().is_some() {
                return Ok(());
            }
            exchange.set_exception_caught(Some(failure.clone()));

            let clause = select_clause(&cfg.exception_clauses, exchange, &failure);
            let policy = clause
                .and_then(|c| c.redelivery_policy())
                .unwrap_or(&cfg.redelivery_policy);
            let retry_while = clause
                .and_then(|c| c.retry_while())
                .or(cfg.retry_while.as_ref());

            let next = counter + 1;
            let mut redeliver = match retry_while {
                Some(predicate) => predicate.matches(exchange),
                None => policy.should_redeliver(next),
            };
            if cfg.shutdown.is_cancelled() && !policy.allow_redelivery_while_stopping {
                redeliver = false;
            }
            if !redeliver {
                self.exhausted(exchange, failure, clause, policy, counter + 1)
                    .await;
                return Ok(());
            }
            counter = next;

            let delay = policy.calculate_redelivery_delay(previous_delay, counter);
            previous_delay = delay;
            if policy.log_retry_attempted {
                debug!(
                    route_id = %cfg.route_id,
                    exchange_id = %exchange.id(),
                    attempt = counter,
                    delay_ms = delay,
                    error = %failure,
                    "redelivery scheduled"
                );
            }
            if delay > 0 {
                tokio::select! {
                    _ = cfg.shutdown.cancelled() => {
                        self.interrupted(exchange, counter);
                        return Ok(());
                    }
                    _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                }
            }

            exchange.clear_failure();
            exchange.set_header(header::REDELIVERED, true);
            exchange.set_header(header::REDELIVERY_COUNTER, counter);
            exchange.set_header(header::REDELIVERY_DELAY, delay);
            if policy.maximum_redeliveries >= 0 {
                exchange.set_header(header::REDELIVERY_MAX_COUNTER, policy.maximum_redeliveries);
            }

            let on_redelivery = clause
                .and_then(|c| c.on_redelivery())
                .or(cfg.on_redelivery.as_ref());
            if let Some(hook) = on_redelivery {
                process_capturing(hook.as_ref(), exchange).await;
                if exchange.is_failed() {
                    exchange.set_redelivery_exhausted(true);
                    exchange.set_error_handler_handled(Some(false));
                    return Ok(());
                }
            }
        }
    }
}
