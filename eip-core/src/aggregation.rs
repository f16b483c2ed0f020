//! 聚合策略（AggregationStrategy）
//!
//! 将扇出（multicast/split/recipient list）或关联聚合器收到的多个交换合并为一个：
//! - `aggregate(old, new)`：首次调用时 `old` 为 `None`；
//! - `pre_complete(old, new)`：声明 `can_pre_complete` 的策略会在合并前被询问，
//!   返回 `true` 表示 `old` 已完整，`new` 不再并入，扇出随即提前结束。
//!
use crate::exchange::{Exchange, value_to_string};
use serde_json::Value;
use std::sync::Arc;

pub trait AggregationStrategy: Send + Sync {
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> anyhow::Result<Exchange>;

    fn can_pre_complete(&self) -> bool {
        false
    }

    fn pre_complete(&self, _old: Option<&Exchange>, _new: &Exchange) -> bool {
        false
    }

    /// 聚合完成后、结果交还给调用方之前回调
    fn on_completion(&self, _exchange: &mut Exchange) {}
}

pub type SharedAggregationStrategy = Arc<dyn AggregationStrategy>;

/// 保留最新结果；若旧结果已失败而新结果成功，保留旧的失败
#[derive(Debug, Clone, Copy, Default)]
pub struct UseLatestStrategy;

impl AggregationStrategy for UseLatestStrategy {
    fn aggregate(&self, old: Option<Exchange>, mut new: Exchange) -> anyhow::Result<Exchange> {
        if let Some(old) = old
            && !new.is_failed()
            && let Some(failure) = old.failure()
        {
            new.set_failure(failure.clone());
            new.set_error_handler_handled(old.error_handler_handled());
        }
        Ok(new)
    }
}

/// 将各 body 收集为数组；可选按批大小提前完成
#[derive(Debug, Clone, Copy, Default)]
pub struct GroupedBodyStrategy {
    batch_size: Option<usize>,
}

impl GroupedBodyStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// 收满 `size` 个即完成
    pub fn with_batch_size(size: usize) -> Self {
        Self {
            batch_size: Some(size),
        }
    }
}

impl AggregationStrategy for GroupedBodyStrategy {
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> anyhow::Result<Exchange> {
        let item = new.body().clone();
        let mut target = match old {
            Some(old) => {
                let mut old = old;
                if let (false, Some(failure)) = (old.is_failed(), new.failure()) {
                    old.set_failure(failure.clone());
                }
                old
            }
            None => {
                let mut first = new;
                first.set_body(Value::Array(Vec::new()));
                first
            }
        };
        match target.message_mut().body_mut() {
            Value::Array(items) => items.push(item),
            other => *other = Value::Array(vec![item]),
        }
        Ok(target)
    }

    fn can_pre_complete(&self) -> bool {
        self.batch_size.is_some()
    }

    fn pre_complete(&self, old: Option<&Exchange>, _new: &Exchange) -> bool {
        match (self.batch_size, old) {
            (Some(size), Some(old)) => old.body().as_array().is_some_and(|a| a.len() >= size),
            _ => false,
        }
    }
}

/// 以分隔符拼接文本 body
#[derive(Debug, Clone, Default)]
pub struct StringConcatStrategy {
    separator: String,
}

impl StringConcatStrategy {
    pub fn new(separator: impl Into<String>) -> Self {
        Self {
            separator: separator.into(),
        }
    }
}

impl AggregationStrategy for StringConcatStrategy {
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> anyhow::Result<Exchange> {
        let Some(mut old) = old else {
            return Ok(new);
        };
        let joined = format!(
            "{}{}{}",
            old.message().body_as_string(),
            self.separator,
            value_to_string(new.body())
        );
        old.set_body(joined);
        if let (false, Some(failure)) = (old.is_failed(), new.failure()) {
            old.set_failure(failure.clone());
        }
        Ok(old)
    }
}

/// 闭包聚合策略
pub struct FnStrategy<F> {
    f: F,
}

impl<F> AggregationStrategy for FnStrategy<F>
where
    F: Fn(Option<Exchange>, Exchange) -> anyhow::Result<Exchange> + Send + Sync,
{
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> anyhow::Result<Exchange> {
        (self.f)(old, new)
    }
}

pub fn strategy_fn<F>(f: F) -> SharedAggregationStrategy
where
    F: Fn(Option<Exchange>, Exchange) -> anyhow::Result<Exchange> + Send + Sync + 'static,
{
    Arc::new(FnStrategy { f })
}

pub fn use_latest() -> SharedAggregationStrategy {
    Arc::new(UseLatestStrategy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Failure;
    use serde_json::json;

    #[test]
    fn use_latest_keeps_earlier_failure() {
        let mut failed = Exchange::with_body("a");
        failed.set_failure(Failure::msg("boom"));
        let ok = Exchange::with_body("b");

        let merged = UseLatestStrategy.aggregate(Some(failed), ok).unwrap();
        assert_eq!(merged.body(), &json!("b"));
        assert!(merged.is_failed());
    }

    #[test]
    fn grouped_body_collects_and_pre_completes() {
        let s = GroupedBodyStrategy::with_batch_size(2);
        let one = s.aggregate(None, Exchange::with_body(1)).unwrap();
        assert!(!s.pre_complete(Some(&one), &Exchange::with_body(2)));
        let two = s.aggregate(Some(one), Exchange::with_body(2)).unwrap();
        assert_eq!(two.body(), &json!([1, 2]));
        assert!(s.pre_complete(Some(&two), &Exchange::with_body(3)));
        assert!(!GroupedBodyStrategy::new().can_pre_complete());
    }

    #[test]
    fn concat_joins_in_call_order() {
        let s = StringConcatStrategy::new("+");
        let r = ["A", "B", "C"]
            .into_iter()
            .try_fold(None, |acc, b| s.aggregate(acc, Exchange::with_body(b)).map(Some))
            .unwrap()
            .unwrap();
        assert_eq!(r.body(), &json!("A+B+C"));
    }
}
