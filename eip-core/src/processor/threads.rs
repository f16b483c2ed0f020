use super::{Processor, SharedProcessor, process_capturing};
use crate::error::EipError;
use crate::exchange::Exchange;
use crate::executor::WorkerPool;
use async_trait::async_trait;

/// 把后续处理移交给工作池中的任务执行，调用方等待其完成
pub struct ThreadsProcessor {
    pool: WorkerPool,
    output: SharedProcessor,
}

impl ThreadsProcessor {
    pub fn new(pool: WorkerPool, output: SharedProcessor) -> Self {
        Self { pool, output }
    }
}

#[async_trait]
impl Processor for ThreadsProcessor {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let permit = self.pool.enter().await?;
        let mut owned = std::mem::take(exchange);
        let output = self.output.clone();
        let handle = tokio::spawn(self.pool.bind(async move {
            let _permit = permit;
            process_capturing(output.as_ref(), &mut owned).await;
            owned
        }));
        match handle.await {
            Ok(done) => {
                *exchange = done;
                Ok(())
            }
            Err(join_error) => Err(EipError::processing(format!(
                "worker '{}' aborted: {join_error}",
                self.pool.name()
            ))
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::processor_fn;
    use serde_json::json;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn runs_on_the_pool_and_returns_the_result() {
        let threads = ThreadsProcessor::new(
            WorkerPool::new("threads", 1),
            processor_fn(|ex| {
                ex.set_body("done");
                Ok(())
            }),
        );
        let mut ex = Exchange::with_body("start");
        let id = ex.id().to_string();
        threads.process(&mut ex).await.unwrap();
        assert_eq!(ex.body(), &json!("done"));
        assert_eq!(ex.id(), id);
    }

    #[tokio::test]
    async fn closed_pool_rejects() {
        let pool = WorkerPool::new("closed", 1);
        pool.shutdown();
        let threads = ThreadsProcessor::new(pool, processor_fn(|_| Ok(())));
        let mut ex = Exchange::with_body("x");
        let err = threads.process(&mut ex).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EipError>(),
            Some(EipError::RejectedExecution { .. })
        ));
        assert_eq!(ex.body(), &json!("x"));
    }
}
