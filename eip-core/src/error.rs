//! 引擎统一错误定义
//!
//! - `EipError`：框架自身产生的错误（类型转换、端点解析、表达式求值、关闭中断等）；
//! - `Failure`：交换（Exchange）失败槽中保存的错误，可在多个阶段之间共享，
//!   并支持沿错误链按具体类型匹配（供 onException 子句使用）。
//!
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// 统一错误类型
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum EipError {
    // --- 数据/类型 ---
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },
    #[error("type conversion failed: expected={expected}, reason={reason}")]
    TypeConversion {
        expected: &'static str,
        reason: String,
    },
    #[error("expression evaluation failed: {reason}")]
    Expression { reason: String },

    // --- 配置 ---
    #[error("invalid delay pattern '{pattern}': {reason}")]
    InvalidDelayPattern { pattern: String, reason: String },
    #[error("invalid endpoint uri '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },
    #[error("no bean bound in registry: name={name}, type={expected}")]
    NoSuchBean {
        name: String,
        expected: &'static str,
    },

    // --- 端点 ---
    #[error("no endpoint could be resolved for uri: {uri}")]
    NoSuchEndpoint { uri: String },
    #[error("no consumers available on endpoint: {uri}")]
    NoConsumers { uri: String },
    #[error("endpoint error: uri={uri}, reason={reason}")]
    Endpoint { uri: String, reason: String },

    // --- 执行 ---
    #[error("exchange {exchange_id} failed: {failure}")]
    ExchangeFailed {
        exchange_id: String,
        failure: Failure,
    },
    #[error("interrupted: {reason}")]
    Interrupted { reason: String },
    #[error("rejected execution: {reason}")]
    RejectedExecution { reason: String },
    #[error("aggregation error: {reason}")]
    Aggregation { reason: String },
    #[error("processing error: {reason}")]
    Processing { reason: String },
}

impl EipError {
    pub fn expression(reason: impl Into<String>) -> Self {
        Self::Expression {
            reason: reason.into(),
        }
    }

    pub fn processing(reason: impl Into<String>) -> Self {
        Self::Processing {
            reason: reason.into(),
        }
    }

    pub fn interrupted(reason: impl Into<String>) -> Self {
        Self::Interrupted {
            reason: reason.into(),
        }
    }

    pub fn endpoint(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Endpoint {
            uri: uri.into(),
            reason: reason.into(),
        }
    }
}

/// 统一 Result 类型别名
pub type EipResult<T> = Result<T, EipError>;

/// 失败槽中的错误
///
/// 包装一个共享的 `anyhow::Error`：克隆廉价，且在重投、死信、聚合等阶段都指向同一个错误实例。
#[derive(Clone)]
pub struct Failure {
    inner: Arc<anyhow::Error>,
}

impl Failure {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: Arc::new(err.into()),
        }
    }

    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self::new(anyhow::Error::msg(message))
    }

    pub fn error(&self) -> &anyhow::Error {
        &self.inner
    }

    /// 顶层错误是否为 `E`
    pub fn is<E>(&self) -> bool
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.inner.is::<E>()
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.inner.downcast_ref::<E>()
    }

    /// `E` 在错误链中出现的深度：0 表示错误本身，1 表示其直接原因，依此类推
    pub fn depth_of<E>(&self) -> Option<usize>
    where
        E: StdError + Send + Sync + 'static,
    {
        if self.inner.is::<E>() {
            return Some(0);
        }
        self.inner
            .chain()
            .enumerate()
            .skip(1)
            .find(|(_, cause)| cause.is::<E>())
            .map(|(depth, _)| depth)
    }

    pub fn chain(&self) -> anyhow::Chain<'_> {
        self.inner.chain()
    }

    /// 两个失败是否为同一个错误实例
    pub fn same_as(&self, other: &Failure) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            write!(f, "{:#}", self.inner)
        } else {
            write!(f, "{}", self.inner)
        }
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.inner, f)
    }
}

impl From<anyhow::Error> for Failure {
    fn from(err: anyhow::Error) -> Self {
        Self {
            inner: Arc::new(err),
        }
    }
}

impl From<EipError> for Failure {
    fn from(err: EipError) -> Self {
        Self::new(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[derive(Debug, Error)]
    #[error("io went away")]
    struct IoGone;

    #[derive(Debug, Error)]
    #[error("wrapper")]
    struct Wrapper(#[source] IoGone);

    #[test]
    fn depth_walks_the_cause_chain() {
        let direct = Failure::new(IoGone);
        assert_eq!(direct.depth_of::<IoGone>(), Some(0));

        let wrapped = Failure::new(Wrapper(IoGone));
        assert_eq!(wrapped.depth_of::<Wrapper>(), Some(0));
        assert_eq!(wrapped.depth_of::<IoGone>(), Some(1));
        assert_eq!(wrapped.depth_of::<EipError>(), None);
    }

    #[test]
    fn context_keeps_original_type_visible() {
        let err = Err::<(), _>(IoGone).context("while sending").unwrap_err();
        let failure = Failure::from(err);
        assert!(failure.is::<IoGone>());
        assert_eq!(failure.to_string(), "while sending");
    }

    #[test]
    fn clones_share_the_same_error() {
        let a = Failure::msg("boom");
        let b = a.clone();
        assert!(a.same_as(&b));
        assert!(!a.same_as(&Failure::msg("boom")));
    }
}
