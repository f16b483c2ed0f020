//! 错误处理：重投策略、onException 子句与重投错误处理器
//!
mod exception;
mod handler;
mod policy;

pub use exception::{ExceptionClause, ExceptionMatcher, select_clause};
pub use handler::{ErrorHandlerConfig, RedeliveryErrorHandler};
pub use policy::{DelayPattern, RedeliveryPolicy};
