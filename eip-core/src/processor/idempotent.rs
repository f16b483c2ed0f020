//! 幂等消费者
//!
//! 以表达式求出消息键，仓库中已存在的键视为重复：标记 `DUPLICATE_MESSAGE`，
//! 默认跳过。处理失败时移除键，允许重新投递。
//!
use super::{Processor, SharedProcessor, process_capturing};
use crate::error::EipError;
use crate::exchange::{Exchange, keys::property, value_to_string};
use crate::expression::SharedExpression;
use async_trait::async_trait;
use bon::Builder;
use indexmap::IndexSet;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

pub trait IdempotentRepository: Send + Sync {
    /// 新增键；已存在时返回 `false`
    fn add(&self, key: &str) -> bool;

    fn contains(&self, key: &str) -> bool;

    fn remove(&self, key: &str) -> bool;

    /// 处理成功后确认键
    fn confirm(&self, key: &str) -> bool;

    /// 清空全部键
    fn clear(&self);
}

pub const DEFAULT_REPOSITORY_CAPACITY: usize = 1000;

/// 内存仓库：容量有限，按最近使用淘汰
pub struct MemoryIdempotentRepository {
    keys: Mutex<IndexSet<String>>,
    capacity: usize,
}

impl Default for MemoryIdempotentRepository {
    fn default() -> Self {
        Self::new(DEFAULT_REPOSITORY_CAPACITY)
    }
}

impl MemoryIdempotentRepository {
    pub fn new(capacity: usize) -> Self {
        Self {
            keys: Mutex::new(IndexSet::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }
}

fn touch(keys: &mut IndexSet<String>, key: &str) -> bool {
    match keys.get_index_of(key) {
        Some(at) => {
            let last = keys.len() - 1;
            keys.move_index(at, last);
            true
        }
        None => false,
    }
}

impl IdempotentRepository for MemoryIdempotentRepository {
    fn add(&self, key: &str) -> bool {
        let mut keys = self.keys.lock();
        if touch(&mut keys, key) {
            return false;
        }
        keys.insert(key.to_string());
        while keys.len() > self.capacity {
            keys.shift_remove_index(0);
        }
        true
    }

    fn contains(&self, key: &str) -> bool {
        touch(&mut self.keys.lock(), key)
    }

    fn remove(&self, key: &str) -> bool {
        self.keys.lock().shift_remove(key)
    }

    fn confirm(&self, _key: &str) -> bool {
        true
    }

    fn clear(&self) {
        self.keys.lock().clear();
    }
}

#[derive(Builder)]
pub struct IdempotentConsumer {
    message_id: SharedExpression,
    repository: Arc<dyn IdempotentRepository>,
    output: SharedProcessor,
    /// 处理前即登记键
    #[builder(default = true)]
    eager: bool,
    #[builder(default = true)]
    skip_duplicate: bool,
    #[builder(default = true)]
    remove_on_failure: bool,
}

#[async_trait]
impl Processor for IdempotentConsumer {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let key = value_to_string(&self.message_id.evaluate(exchange)?);
        if key.is_empty() {
            return Err(EipError::expression(format!(
                "no message id for idempotent consumer on exchange {}",
                exchange.id()
            ))
            .into());
        }

        let is_new = if self.eager {
            self.repository.add(&key)
        } else {
            !self.repository.contains(&key)
        };

        if !is_new {
            exchange.set_property(property::DUPLICATE_MESSAGE, true);
            debug!(message_id = %key, exchange_id = %exchange.id(), "duplicate message");
            if self.skip_duplicate {
                return Ok(());
            }
            return self.output.process(exchange).await;
        }

        process_capturing(self.output.as_ref(), exchange).await;
        if exchange.is_failed() {
            if self.remove_on_failure {
                self.repository.remove(&key);
            }
        } else {
            if !self.eager {
                self.repository.add(&key);
            }
            self.repository.confirm(&key);
        }
        Ok(())
    }
}
