//! 简单的消息变换步骤
use super::Processor;
use crate::exchange::{Exchange, value_to_string};
use crate::expression::SharedExpression;
use async_trait::async_trait;
use tracing::info;

pub struct SetBodyProcessor {
    expression: SharedExpression,
}

impl SetBodyProcessor {
    pub fn new(expression: SharedExpression) -> Self {
        Self { expression }
    }
}

#[async_trait]
impl Processor for SetBodyProcessor {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let body = self.expression.evaluate(exchange)?;
        exchange.set_body(body);
        Ok(())
    }
}

pub struct SetHeaderProcessor {
    name: String,
    expression: SharedExpression,
}

impl SetHeaderProcessor {
    pub fn new(name: impl Into<String>, expression: SharedExpression) -> Self {
        Self {
            name: name.into(),
            expression,
        }
    }
}

#[async_trait]
impl Processor for SetHeaderProcessor {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let value = self.expression.evaluate(exchange)?;
        exchange.set_header(self.name.clone(), value);
        Ok(())
    }
}

pub struct SetPropertyProcessor {
    name: String,
    expression: SharedExpression,
}

impl SetPropertyProcessor {
    pub fn new(name: impl Into<String>, expression: SharedExpression) -> Self {
        Self {
            name: name.into(),
            expression,
        }
    }
}

#[async_trait]
impl Processor for SetPropertyProcessor {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let value = self.expression.evaluate(exchange)?;
        exchange.set_property(self.name.clone(), value);
        Ok(())
    }
}

pub struct SetVariableProcessor {
    name: String,
    expression: SharedExpression,
}

impl SetVariableProcessor {
    pub fn new(name: impl Into<String>, expression: SharedExpression) -> Self {
        Self {
            name: name.into(),
            expression,
        }
    }
}

#[async_trait]
impl Processor for SetVariableProcessor {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let value = self.expression.evaluate(exchange)?;
        exchange.set_variable(self.name.clone(), value);
        Ok(())
    }
}

pub struct RemoveHeaderProcessor {
    name: String,
}

impl RemoveHeaderProcessor {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Processor for RemoveHeaderProcessor {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        exchange.message_mut().remove_header(&self.name);
        Ok(())
    }
}

/// 停止当前交换的后续路由
#[derive(Debug, Default)]
pub struct StopProcessor;

#[async_trait]
impl Processor for StopProcessor {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        exchange.set_route_stop(true);
        Ok(())
    }
}

/// 以 info 级别记录一条日志
pub struct LogProcessor {
    name: String,
    message: SharedExpression,
}

impl LogProcessor {
    pub fn new(name: impl Into<String>, message: SharedExpression) -> Self {
        Self {
            name: name.into(),
            message,
        }
    }
}

#[async_trait]
impl Processor for LogProcessor {
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let message = self.message.evaluate(exchange)?;
        info!(
            log = %self.name,
            exchange_id = %exchange.id(),
            "{}",
            value_to_string(&message)
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{constant, from_fn, header};
    use serde_json::json;

    #[tokio::test]
    async fn set_steps_write_their_namespaces() {
        let mut ex = Exchange::with_body("a");
        ex.set_header("src", "h");

        SetBodyProcessor::new(header("src")).process(&mut ex).await.unwrap();
        SetPropertyProcessor::new("p", constant(1)).process(&mut ex).await.unwrap();
        SetVariableProcessor::new("v", constant(2)).process(&mut ex).await.unwrap();
        RemoveHeaderProcessor::new("src").process(&mut ex).await.unwrap();

        assert_eq!(ex.body(), &json!("h"));
        assert_eq!(ex.property("p"), Some(&json!(1)));
        assert_eq!(ex.variable("v"), Some(&json!(2)));
        assert!(ex.header("src").is_none());
    }

    #[tokio::test]
    async fn failing_expression_is_an_error() {
        let broken = from_fn(|_| Err(crate::error::EipError::expression("bad")));
        let mut ex = Exchange::default();
        let result = SetHeaderProcessor::new("x", broken).process(&mut ex).await;
        assert!(result.is_err());
    }
}
