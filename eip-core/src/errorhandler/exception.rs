//! onException 子句与匹配
//!
//! 匹配顺序：具体类型优先于兜底子句；同为具体类型时错误本身优先于其原因链中更深的错误；
//! 其余按声明顺序。`on_when` 守卫不成立的子句不参与匹配。
//!
use super::RedeliveryPolicy;
use crate::error::Failure;
use crate::exchange::Exchange;
use crate::expression::SharedPredicate;
use crate::processor::SharedProcessor;
use bon::Builder;
use std::any::type_name;
use std::error::Error as StdError;
use std::fmt;

/// 错误类型匹配器
#[derive(Clone, Copy)]
pub struct ExceptionMatcher {
    name: &'static str,
    catch_all: bool,
    depth: fn(&Failure) -> Option<usize>,
}

impl ExceptionMatcher {
    /// 匹配错误链中任意位置的 `E`
    pub fn of<E>() -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            name: type_name::<E>(),
            catch_all: false,
            depth: Failure::depth_of::<E>,
        }
    }

    /// 兜底：匹配任意错误
    pub fn any() -> Self {
        Self {
            name: "*",
            catch_all: true,
            depth: |_| Some(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn matches(&self, failure: &Failure) -> bool {
        (self.depth)(failure).is_some()
    }

    fn rank(&self, failure: &Failure) -> Option<(bool, usize)> {
        (self.depth)(failure).map(|depth| (self.catch_all, depth))
    }
}

impl fmt::Debug for ExceptionMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// onException 子句
#[derive(Clone, Builder)]
pub struct ExceptionClause {
    matchers: Vec<ExceptionMatcher>,
    on_when: Option<SharedPredicate>,
    /// 处理后视为成功并停止路由
    handled: Option<bool>,
    /// 处理后清除失败并继续路由
    continued: Option<bool>,
    redelivery_policy: Option<RedeliveryPolicy>,
    /// 设置后取代计数判断：谓词成立即继续重投
    retry_while: Option<SharedPredicate>,
    #[builder(default)]
    use_original_message: bool,
    on_redelivery: Option<SharedProcessor>,
    /// 重投耗尽后执行的步骤
    output: Option<SharedProcessor>,
}

impl ExceptionClause {
    pub fn matchers(&self) -> &[ExceptionMatcher] {
        &self.matchers
    }

    pub fn handled(&self) -> Option<bool> {
        self.handled
    }

    pub fn continued(&self) -> Option<bool> {
        self.continued
    }

    pub fn redelivery_policy(&self) -> Option<&RedeliveryPolicy> {
        self.redelivery_policy.as_ref()
    }

    pub fn retry_while(&self) -> Option<&SharedPredicate> {
        self.retry_while.as_ref()
    }

    pub fn use_original_message(&self) -> bool {
        self.use_original_message
    }

    pub fn on_redelivery(&self) -> Option<&SharedProcessor> {
        self.on_redelivery.as_ref()
    }

    pub fn output(&self) -> Option<&SharedProcessor> {
        self.output.as_ref()
    }

    fn rank(&self, failure: &Failure) -> Option<(bool, usize)> {
        self.matchers.iter().filter_map(|m| m.rank(failure)).min()
    }
}

impl fmt::Debug for ExceptionClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionClause")
            .field("matchers", &self.matchers)
            .field("handled", &self.handled)
            .field("continued", &self.continued)
            .finish_non_exhaustive()
    }
}

/// 为失败选择最具体的子句
pub fn select_clause<'a>(
    clauses: &'a [ExceptionClause],
    exchange: &Exchange,
    failure: &Failure,
) -> Option<&'a ExceptionClause> {
    clauses
        .iter()
        .enumerate()
        .filter_map(|(order, clause)| {
            clause
                .rank(failure)
                .map(|(catch_all, depth)| ((catch_all, depth, order), clause))
        })
        .filter(|(_, clause)| clause.on_when.as_ref().is_none_or(|p| p.matches(exchange)))
        .min_by_key(|(key, _)| *key)
        .map(|(_, clause)| clause)
}
