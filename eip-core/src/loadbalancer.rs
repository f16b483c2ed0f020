//! 负载均衡器
//!
//! - 轮询（round robin）与随机；
//! - 粘性（sticky）：按键表达式固定目标，新键按轮询分配；
//! - 主题（topic）：每个目标都收到一份副本，全部运行后把最后一个失败记到原交换上；
//! - 故障转移（failover）：按顺序尝试，可限定次数、轮询起点与可转移的错误类型。
//!
use crate::error::EipError;
use crate::errorhandler::ExceptionMatcher;
use crate::exchange::{Exchange, value_to_string};
use crate::expression::SharedExpression;
use crate::processor::{Processor, SharedProcessor, process_capturing};
use async_trait::async_trait;
use bon::Builder;
use dashmap::DashMap;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

fn no_destinations() -> anyhow::Error {
    EipError::processing("load balancer has no destinations").into()
}

pub struct RoundRobinLoadBalancer {
    destinations: Vec<SharedProcessor>,
    next: AtomicUsize,
}

impl RoundRobinLoadBalancer {
    pub fn new(destinations: Vec<SharedProcessor>) -> Self {
        Self {
            destinations,
            next: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Processor for RoundRobinLoadBalancer {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        if self.destinations.is_empty() {
            return Err(no_destinations());
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.destinations.len();
        self.destinations[index].process(exchange).await
    }
}

pub struct RandomLoadBalancer {
    destinations: Vec<SharedProcessor>,
}

impl RandomLoadBalancer {
    pub fn new(destinations: Vec<SharedProcessor>) -> Self {
        Self { destinations }
    }
}

#[async_trait]
impl Processor for RandomLoadBalancer {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        if self.destinations.is_empty() {
            return Err(no_destinations());
        }
        let index = rand::thread_rng().gen_range(0..self.destinations.len());
        self.destinations[index].process(exchange).await
    }
}

pub struct StickyLoadBalancer {
    key: SharedExpression,
    destinations: Vec<SharedProcessor>,
    assignments: DashMap<String, usize>,
    next: AtomicUsize,
}

impl StickyLoadBalancer {
    pub fn new(key: SharedExpression, destinations: Vec<SharedProcessor>) -> Self {
        Self {
            key,
            destinations,
            assignments: DashMap::new(),
            next: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Processor for StickyLoadBalancer {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        if self.destinations.is_empty() {
            return Err(no_destinations());
        }
        let key = value_to_string(&self.key.evaluate(exchange)?);
        let index = *self
            .assignments
            .entry(key)
            .or_insert_with(|| self.next.fetch_add(1, Ordering::Relaxed) % self.destinations.len());
        self.destinations[index].process(exchange).await
    }
}

pub struct TopicLoadBalancer {
    destinations: Vec<SharedProcessor>,
}

impl TopicLoadBalancer {
    pub fn new(destinations: Vec<SharedProcessor>) -> Self {
        Self { destinations }
    }
}

#[async_trait]
impl Processor for TopicLoadBalancer {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let mut last_failed: Option<Exchange> = None;
        for destination in &self.destinations {
            let mut copy = exchange.correlated_copy();
            process_capturing(destination.as_ref(), &mut copy).await;
            if copy.is_failed() {
                last_failed = Some(copy);
            }
        }
        if let Some(failed) = last_failed {
            if let Some(failure) = failed.failure() {
                exchange.set_failure(failure.clone());
            }
            exchange.set_exception_caught(failed.exception_caught().cloned());
            exchange.set_error_handler_handled(failed.error_handler_handled());
        }
        Ok(())
    }
}

/// 故障转移
///
/// `maximum_failover_attempts` 为转移次数上限（-1 不限，0 不转移）。
/// 不轮询时从第一个目标开始，最多走完一遍列表；轮询时每个交换从下一个起点开始并循环。
#[derive(Builder)]
pub struct FailoverLoadBalancer {
    destinations: Vec<SharedProcessor>,
    #[builder(default = -1)]
    maximum_failover_attempts: i32,
    #[builder(default)]
    round_robin: bool,
    /// 为空时任意错误都转移
    #[builder(default)]
    exceptions: Vec<ExceptionMatcher>,
    #[builder(skip)]
    next: AtomicUsize,
}

impl FailoverLoadBalancer {
    fn should_failover(&self, exchange: &Exchange) -> bool {
        match exchange.failure() {
            Some(failure) => {
                self.exceptions.is_empty() || self.exceptions.iter().any(|m| m.matches(failure))
            }
            None => false,
        }
    }

    fn attempts_exhausted(&self, failovers: usize) -> bool {
        let max = self.maximum_failover_attempts;
        if max >= 0 && failovers > max as usize {
            return true;
        }
        !self.round_robin && failovers >= self.destinations.len()
    }
}

#[async_trait]
impl Processor for FailoverLoadBalancer {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let total = self.destinations.len();
        if total == 0 {
            return Err(no_destinations());
        }
        let mut index = if self.round_robin {
            self.next.fetch_add(1, Ordering::Relaxed) % total
        } else {
            0
        };
        let input = exchange.message().clone();
        let mut failovers = 0;

        loop {
            if failovers > 0 {
                exchange.take_out();
                *exchange.in_message_mut() = input.clone();
            }
            exchange.reset_failure_state();
            process_capturing(self.destinations[index].as_ref(), exchange).await;

            if !self.should_failover(exchange) {
                return Ok(());
            }
            failovers += 1;
            if self.attempts_exhausted(failovers) {
                debug!(exchange_id = %exchange.id(), failovers, "failover attempts exhausted");
                return Ok(());
            }
            index = (index + 1) % total;
            debug!(exchange_id = %exchange.id(), next = index, "failing over");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::header;
    use crate::processor::processor_fn;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("transient")]
    struct Transient;

    #[derive(Debug, Error)]
    #[error("fatal")]
    struct Fatal;

    fn recording(
        name: &'static str,
        fail: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
    ) -> SharedProcessor {
        processor_fn(move |ex| {
            log.lock().push(name);
            if fail {
                return Err(Transient.into());
            }
            ex.set_header("handled-by", name);
            Ok(())
        })
    }

    #[tokio::test]
    async fn failover_round_robin_tries_each_once_until_success() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let lb = FailoverLoadBalancer::builder()
            .destinations(vec![
                recording("X", true, log.clone()),
                recording("Y", true, log.clone()),
                recording("Z", false, log.clone()),
            ])
            .maximum_failover_attempts(3)
            .round_robin(true)
            .build();

        let mut ex = Exchange::with_body("payload");
        lb.process(&mut ex).await.unwrap();
        assert!(!ex.is_failed());
        assert_eq!(ex.header("handled-by"), Some(&json!("Z")));
        assert_eq!(*log.lock(), vec!["X", "Y", "Z"]);
    }

    #[tokio::test]
    async fn failover_without_round_robin_walks_the_list_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let lb = FailoverLoadBalancer::builder()
            .destinations(vec![recording("A", true, log.clone()), recording("B", true, log.clone())])
            .build();
        let mut ex = Exchange::default();
        lb.process(&mut ex).await.unwrap();
        assert!(ex.is_failed());
        assert_eq!(*log.lock(), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn failover_only_for_listed_errors() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let fatal = processor_fn(move |_| {
            sink.lock().push("fatal");
            Err(Fatal.into())
        });
        let lb = FailoverLoadBalancer::builder()
            .destinations(vec![fatal, recording("ok", false, log.clone())])
            .exceptions(vec![ExceptionMatcher::of::<Transient>()])
            .build();
        let mut ex = Exchange::default();
        lb.process(&mut ex).await.unwrap();
        assert!(ex.failure().is_some_and(|f| f.is::<Fatal>()));
        assert_eq!(*log.lock(), vec!["fatal"]);
    }

    #[tokio::test]
    async fn sticky_keeps_keys_on_their_destination() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let lb = StickyLoadBalancer::new(
            header("session"),
            vec![recording("one", false, log.clone()), recording("two", false, log.clone())],
        );
        for session in ["a", "b", "a", "c", "a", "b"] {
            let mut ex = Exchange::default();
            ex.set_header("session", session);
            lb.process(&mut ex).await.unwrap();
        }
        assert_eq!(*log.lock(), vec!["one", "two", "one", "one", "one", "two"]);
    }

    #[tokio::test]
    async fn topic_sends_to_all_and_reports_failure_afterwards() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let lb = TopicLoadBalancer::new(vec![
            recording("first", true, log.clone()),
            recording("second", false, log.clone()),
        ]);
        let mut ex = Exchange::with_body("news");
        lb.process(&mut ex).await.unwrap();
        assert_eq!(*log.lock(), vec!["first", "second"]);
        assert!(ex.is_failed());
        assert!(ex.header("handled-by").is_none());
    }

    #[tokio::test]
    async fn round_robin_rotates() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let lb = RoundRobinLoadBalancer::new(vec![
            recording("a", false, log.clone()),
            recording("b", false, log.clone()),
        ]);
        for _ in 0..3 {
            lb.process(&mut Exchange::default()).await.unwrap();
        }
        assert_eq!(*log.lock(), vec!["a", "b", "a"]);
    }

    #[tokio::test]
    async fn random_picks_a_destination_or_fails_when_empty() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let lb = RandomLoadBalancer::new(vec![recording("only", false, log.clone())]);
        lb.process(&mut Exchange::default()).await.unwrap();
        assert_eq!(*log.lock(), vec!["only"]);

        let empty = RandomLoadBalancer::new(Vec::new());
        assert!(empty.process(&mut Exchange::default()).await.is_err());
    }
}
