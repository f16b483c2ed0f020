//! 表达式（Expression）与谓词（Predicate）
//!
//! 引擎不绑定任何表达式语言，只消费以下两个能力：
//! - `Expression<T>`：对交换求值，得到类型化结果；
//! - `Predicate`：对交换求布尔值。
//!
//! 闭包自动实现两者；另提供少量取头/属性/body/常量的便捷构造，便于装配与测试。
//!
use crate::error::{EipError, EipResult};
use crate::exchange::{Exchange, value_to_string};
use serde_json::Value;
use std::sync::Arc;

/// 表达式：对交换求值
pub trait Expression<T = Value>: Send + Sync {
    fn evaluate(&self, exchange: &Exchange) -> EipResult<T>;
}

/// 谓词：对交换求布尔值
pub trait Predicate: Send + Sync {
    fn matches(&self, exchange: &Exchange) -> bool;
}

pub type SharedExpression<T = Value> = Arc<dyn Expression<T>>;
pub type SharedPredicate = Arc<dyn Predicate>;

/// 拆分结果：惰性产生的值序列，可以是无限序列
pub type SplitItems = Box<dyn Iterator<Item = Value> + Send>;

impl<T, F> Expression<T> for F
where
    F: Fn(&Exchange) -> EipResult<T> + Send + Sync,
{
    fn evaluate(&self, exchange: &Exchange) -> EipResult<T> {
        self(exchange)
    }
}

impl<F> Predicate for F
where
    F: Fn(&Exchange) -> bool + Send + Sync,
{
    fn matches(&self, exchange: &Exchange) -> bool {
        self(exchange)
    }
}

/// 由闭包构造表达式
pub fn from_fn<T, F>(f: F) -> SharedExpression<T>
where
    T: 'static,
    F: Fn(&Exchange) -> EipResult<T> + Send + Sync + 'static,
{
    Arc::new(f)
}

pub fn constant(value: impl Into<Value>) -> SharedExpression {
    let value = value.into();
    from_fn(move |_| Ok(value.clone()))
}

pub fn body() -> SharedExpression {
    from_fn(|ex| Ok(ex.body().clone()))
}

/// 取消息头，缺失时为 null
pub fn header(name: impl Into<String>) -> SharedExpression {
    let name = name.into();
    from_fn(move |ex| Ok(ex.header(&name).cloned().unwrap_or(Value::Null)))
}

/// 取交换属性，缺失时为 null
pub fn property(name: impl Into<String>) -> SharedExpression {
    let name = name.into();
    from_fn(move |ex| Ok(ex.property(&name).cloned().unwrap_or(Value::Null)))
}

/// 以文本形式取消息头；缺失时报错
pub fn header_string(name: impl Into<String>) -> SharedExpression<String> {
    let name = name.into();
    from_fn(move |ex| {
        ex.header(&name)
            .map(value_to_string)
            .ok_or_else(|| EipError::expression(format!("header '{name}' not present")))
    })
}

/// body 拆分：数组逐元素，字符串按 `,` 切分，null 为空序列，其余值作为单个元素
pub fn body_items() -> SharedExpression<SplitItems> {
    from_fn(|ex| Ok(into_items(ex.body().clone(), ",")))
}

/// 按分隔符切分文本 body
pub fn body_tokenize(separator: impl Into<String>) -> SharedExpression<SplitItems> {
    let separator = separator.into();
    from_fn(move |ex| Ok(into_items(ex.body().clone(), &separator)))
}

/// 将任意值转换为拆分序列
pub fn into_items(value: Value, separator: &str) -> SplitItems {
    match value {
        Value::Null => Box::new(std::iter::empty()),
        Value::Array(items) => Box::new(items.into_iter()),
        Value::String(s) => {
            let parts: Vec<Value> = s
                .split(separator)
                .filter(|p| !p.is_empty())
                .map(|p| Value::from(p.to_string()))
                .collect();
            Box::new(parts.into_iter())
        }
        other => Box::new(std::iter::once(other)),
    }
}

/// 将值解析为端点 URI 列表（数组或分隔字符串）
pub fn into_uris(value: Value, delimiter: &str) -> Vec<String> {
    into_items(value, delimiter)
        .map(|v| value_to_string(&v).trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// 谓词构造
pub mod predicate {
    use super::*;

    /// 由闭包构造谓词
    pub fn from_fn<F>(f: F) -> SharedPredicate
    where
        F: Fn(&Exchange) -> bool + Send + Sync + 'static,
    {
        Arc::new(f)
    }

    pub fn constant(value: bool) -> SharedPredicate {
        from_fn(move |_| value)
    }

    pub fn header_equals(name: impl Into<String>, value: impl Into<Value>) -> SharedPredicate {
        let name = name.into();
        let value = value.into();
        from_fn(move |ex| ex.header(&name) == Some(&value))
    }

    pub fn has_header(name: impl Into<String>) -> SharedPredicate {
        let name = name.into();
        from_fn(move |ex| ex.header(&name).is_some())
    }

    pub fn property_equals(name: impl Into<String>, value: impl Into<Value>) -> SharedPredicate {
        let name = name.into();
        let value = value.into();
        from_fn(move |ex| ex.property(&name) == Some(&value))
    }

    pub fn body_equals(value: impl Into<Value>) -> SharedPredicate {
        let value = value.into();
        from_fn(move |ex| ex.body() == &value)
    }

    pub fn body_contains(fragment: impl Into<String>) -> SharedPredicate {
        let fragment = fragment.into();
        from_fn(move |ex| ex.message().body_as_string().contains(&fragment))
    }

    pub fn not(inner: SharedPredicate) -> SharedPredicate {
        from_fn(move |ex| !inner.matches(ex))
    }

    pub fn and(left: SharedPredicate, right: SharedPredicate) -> SharedPredicate {
        from_fn(move |ex| left.matches(ex) && right.matches(ex))
    }

    pub fn or(left: SharedPredicate, right: SharedPredicate) -> SharedPredicate {
        from_fn(move |ex| left.matches(ex) || right.matches(ex))
    }
}
