//! EIP 路由与错误恢复核心库（eip-core）
//!
//! 提供企业集成模式（EIP）路由引擎与传输无关的部分：
//! - 交换与消息模型（`exchange`），含关联副本与交换对象池
//! - 表达式与谓词契约（`expression`）
//! - 处理器与组合（`processor`）：流水线、路由、过滤、多播/拆分/聚合、收件人列表、路由单等
//! - 聚合策略（`aggregation`）
//! - 重投错误处理器（`errorhandler`）：死信通道、重投策略、onException 子句
//! - 负载均衡器（`loadbalancer`）
//! - 端点契约（`endpoint`）、Bean 注册表（`registry`）与工作池（`executor`）
//!
//! 路由装配、生命周期与内置组件位于 `eip-runtime`。
//!
pub mod aggregation;
pub mod endpoint;
pub mod error;
pub mod errorhandler;
pub mod exchange;
pub mod executor;
pub mod expression;
pub mod loadbalancer;
pub mod processor;
pub mod registry;

pub use async_trait::async_trait;

// 允许在本 crate 内部通过 ::eip_core 进行自引用，
// 以便过程宏在本 crate 的单元测试中也能解析到 ::eip_core 路径。
extern crate self as eip_core;
