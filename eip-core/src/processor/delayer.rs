use super::Processor;
use crate::error::{EipError, EipResult};
use crate::exchange::Exchange;
use crate::expression::SharedExpression;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// 延迟器：按表达式给出的毫秒数暂停，关闭时立即中断
pub struct DelayProcessor {
    delay: SharedExpression,
    shutdown: CancellationToken,
}

impl DelayProcessor {
    pub fn new(delay: SharedExpression, shutdown: CancellationToken) -> Self {
        Self { delay, shutdown }
    }
}

#[async_trait]
impl Processor for DelayProcessor {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let millis = value_as_u64(&self.delay.evaluate(exchange)?)?;
        if millis == 0 {
            return Ok(());
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => {
                Err(EipError::interrupted(format!(
                    "delay of exchange {} interrupted by shutdown",
                    exchange.id()
                ))
                .into())
            }
            _ = tokio::time::sleep(Duration::from_millis(millis)) => Ok(()),
        }
    }
}

/// 数值或数字字符串转为非负整数
pub(crate) fn value_as_u64(value: &Value) -> EipResult<u64> {
    let parsed = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        Value::Null => Some(0),
        _ => None,
    };
    parsed.ok_or_else(|| EipError::TypeConversion {
        expected: "u64",
        reason: format!("cannot interpret {value} as a non-negative integer"),
    })
}
