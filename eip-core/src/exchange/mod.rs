//! 交换（Exchange）与消息（Message）模型
//!
//! 定义路由中流转的数据单元、内置的属性/消息头键名，以及交换对象池。

#[allow(clippy::module_inception)]
mod exchange;
pub mod keys;
mod message;
mod pool;

pub use exchange::{Exchange, ExchangePattern, ExchangeStatus};
pub use message::Message;
pub use pool::{ExchangePool, ExchangePoolStats};

pub use message::value_to_string;
