//! EIP 路由运行时（eip-runtime）
//!
//! 在 `eip-core` 之上提供：
//! - 路由定义模型（`model`）与定义到处理器树的转换
//! - 路由上下文（`context`）：启动顺序、启停、关闭策略
//! - 生命周期控制任务（`controller`）与路由策略（`policy`）
//! - 内置进程内组件（`component`）：direct、seda、mock
//! - 生产者模板（`template`）与上下文配置（`config`）
//!
pub mod component;
pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod model;
pub mod policy;
pub mod route;
pub mod template;

mod reifier;
mod shutdown;

pub use context::EipContext;
pub use error::{RuntimeError, RuntimeResult};
pub use template::ProducerTemplate;
