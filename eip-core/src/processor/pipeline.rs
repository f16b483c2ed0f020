use super::{Processor, SharedProcessor, continue_processing, process_capturing};
use crate::exchange::Exchange;
use async_trait::async_trait;
use std::sync::Arc;

/// 流水线：按序执行各阶段，阶段之间把 out 提升为 in；
/// 失败或被要求停止时立即结束，失败留在交换的失败槽中。
pub struct Pipeline {
    steps: Vec<SharedProcessor>,
}

impl Pipeline {
    pub fn new(steps: Vec<SharedProcessor>) -> Self {
        Self { steps }
    }

    /// 单阶段时直接返回该阶段，避免多一层包装
    pub fn shared(mut steps: Vec<SharedProcessor>) -> SharedProcessor {
        if steps.len() == 1 {
            if let Some(only) = steps.pop() {
                return only;
            }
        }
        Arc::new(Self::new(steps))
    }

    pub fn steps(&self) -> &[SharedProcessor] {
        &self.steps
    }
}

#[async_trait]
impl Processor for Pipeline {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        for (index, step) in self.steps.iter().enumerate() {
            if !continue_processing(exchange) {
                break;
            }
            if index > 0 {
                exchange.prepare_for_next_stage();
            }
            process_capturing(step.as_ref(), exchange).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Message;
    use crate::processor::processor_fn;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn out_of_one_stage_is_in_of_the_next() {
        let pipeline = Pipeline::new(vec![
            processor_fn(|ex| {
                ex.set_out(Message::new("stage-1"));
                Ok(())
            }),
            processor_fn(|ex| {
                assert!(!ex.has_out());
                let body = ex.message().body_as_string();
                ex.set_body(format!("{body}+stage-2"));
                Ok(())
            }),
        ]);
        let mut ex = Exchange::with_body("in");
        pipeline.process(&mut ex).await.unwrap();
        assert_eq!(ex.body(), &json!("stage-1+stage-2"));
    }

    #[tokio::test]
    async fn failure_or_stop_short_circuits() {
        let reached = Arc::new(AtomicUsize::new(0));
        let counter = reached.clone();
        let tail = processor_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let failing = Pipeline::new(vec![
            processor_fn(|_| Err(anyhow::anyhow!("boom"))),
            tail.clone(),
        ]);
        let mut ex = Exchange::default();
        failing.process(&mut ex).await.unwrap();
        assert!(ex.is_failed());

        let stopping = Pipeline::new(vec![
            processor_fn(|ex| {
                ex.set_route_stop(true);
                Ok(())
            }),
            tail,
        ]);
        let mut ex = Exchange::default();
        stopping.process(&mut ex).await.unwrap();
        assert!(ex.is_route_stop());
        assert_eq!(reached.load(Ordering::SeqCst), 0);
    }
}
