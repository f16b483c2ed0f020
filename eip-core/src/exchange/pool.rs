use super::{Exchange, ExchangePattern, Message};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// 交换对象池统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangePoolStats {
    pub created: u64,
    pub acquired: u64,
    pub released: u64,
    pub discarded: u64,
}

/// 交换对象池（空闲链表）
///
/// - `acquire`：优先复用空闲实例，复位全部可变字段并分配新 id；
/// - `release`：清空所有引用（载荷、属性、失败等）后放回，超出容量则丢弃。
pub struct ExchangePool {
    free: Mutex<Vec<Exchange>>,
    capacity: usize,
    created: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
    discarded: AtomicU64,
}

impl ExchangePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            created: AtomicU64::new(0),
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    pub fn acquire(&self, message: Message, pattern: ExchangePattern) -> Exchange {
        self.acquired.fetch_add(1, Ordering::Relaxed);
        let recycled = self.free.lock().pop();
        match recycled {
            Some(mut exchange) => {
                exchange.reset(message, pattern);
                exchange
            }
            None => {
                self.created.fetch_add(1, Ordering::Relaxed);
                Exchange::new(message).with_pattern(pattern)
            }
        }
    }

    pub fn release(&self, mut exchange: Exchange) {
        self.released.fetch_add(1, Ordering::Relaxed);
        exchange.clear();
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(exchange);
        } else {
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// 当前空闲实例数
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    pub fn stats(&self) -> ExchangePoolStats {
        ExchangePoolStats {
            created: self.created.load(Ordering::Relaxed),
            acquired: self.acquired.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}
