//! 工作池（WorkerPool）
//!
//! 以信号量限制并发度的 tokio 任务池，供并行扇出与 `threads` 阶段使用。
//! 池关闭后不再接受新任务，提交返回 `RejectedExecution`。
//!
//! 已占用工作槽的任务再向同一个池提交工作（并行扇出中嵌套并行扇出、`threads` 下的并行多播）时，
//! 嵌套的工作沿用调用方的槽，不再等待新的许可。
//!
use crate::error::{EipError, EipResult};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::task::futures::TaskLocalFuture;

tokio::task_local! {
    /// 当前任务所处的工作池（以信号量地址标识）
    static ACTIVE_POOLS: Vec<usize>;
}

pub const DEFAULT_POOL_SIZE: usize = 10;

#[derive(Clone)]
pub struct WorkerPool {
    name: Arc<str>,
    size: usize,
    permits: Arc<Semaphore>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("available", &self.available())
            .finish()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new("default", DEFAULT_POOL_SIZE)
    }
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        let size = size.max(1);
        Self {
            name: Arc::from(name.into()),
            size,
            permits: Arc::new(Semaphore::new(size)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// 当前空闲的工作槽数
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// 占用一个工作槽，池已关闭时拒绝
    pub async fn acquire(&self) -> EipResult<OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| self.rejected())
    }

    /// 当前任务是否已在本池的工作槽中运行
    pub fn is_current(&self) -> bool {
        ACTIVE_POOLS
            .try_with(|pools| pools.contains(&self.id()))
            .unwrap_or(false)
    }

    /// 为当前任务取得工作槽：已在本池中运行时返回 `None`（沿用调用方的槽）
    pub async fn enter(&self) -> EipResult<Option<OwnedSemaphorePermit>> {
        self.slot(self.is_current()).await
    }

    /// 给将要在新任务中运行的 future 打上“位于本池”的标记
    pub fn bind<F: Future>(&self, fut: F) -> TaskLocalFuture<Vec<usize>, F> {
        let mut pools = ACTIVE_POOLS
            .try_with(|pools| pools.clone())
            .unwrap_or_default();
        pools.push(self.id());
        ACTIVE_POOLS.scope(pools, fut)
    }

    /// 包装为“先占槽再执行”的 future，可交给 `JoinSet` 或 `tokio::spawn`
    ///
    /// 是否嵌套在提交时（调用方任务中）判定。
    pub fn run<F>(&self, fut: F) -> impl Future<Output = EipResult<F::Output>> + Send + 'static
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let pool = self.clone();
        let nested = self.is_current();
        self.bind(async move {
            let _permit = pool.slot(nested).await?;
            Ok::<_, EipError>(fut.await)
        })
    }

    pub fn spawn<F>(&self, fut: F) -> JoinHandle<EipResult<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        tokio::spawn(self.run(fut))
    }

    /// 关闭：已占槽的任务继续运行，等待中的与后续提交均被拒绝
    pub fn shutdown(&self) {
        self.permits.close();
    }

    pub fn is_shutdown(&self) -> bool {
        self.permits.is_closed()
    }

    async fn slot(&self, nested: bool) -> EipResult<Option<OwnedSemaphorePermit>> {
        if !nested {
            return self.acquire().await.map(Some);
        }
        if self.is_shutdown() {
            return Err(self.rejected());
        }
        Ok(None)
    }

    fn id(&self) -> usize {
        Arc::as_ptr(&self.permits) as usize
    }

    fn rejected(&self) -> EipError {
        EipError::RejectedExecution {
            reason: format!("worker pool '{}' is shut down", self.name),
        }
    }
}
