use super::keys::property;
use super::message::{Message, convert};
use crate::error::Failure;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// 交换模式：单向（fire-and-forget）或请求-应答
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExchangePattern {
    #[default]
    InOnly,
    InOut,
}

/// 交换在路由中的总体状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeStatus {
    /// 正常流转中
    Active,
    /// 被显式要求停止路由
    Stopped,
    /// 失败槽中存在错误
    Failed,
    /// 曾失败但已被错误处理器处理
    Handled,
}

/// 交换：在路由中流转的工作单元
///
/// - 当前消息：存在 out 时为 out，否则为 in；流水线在阶段之间把 out 提升为 in；
/// - 失败槽：最多保存一个错误，设置后对下游所有错误处理阶段可见，直到被显式清除；
/// - 属性与变量是两个独立的命名空间。
#[derive(Debug, Clone)]
pub struct Exchange {
    id: String,
    pattern: ExchangePattern,
    created_at: DateTime<Utc>,
    in_message: Message,
    out_message: Option<Message>,
    original_message: Option<Message>,
    properties: HashMap<String, Value>,
    variables: HashMap<String, Value>,
    failure: Option<Failure>,
    exception_caught: Option<Failure>,
    route_stop: bool,
    error_handler_handled: Option<bool>,
    redelivery_exhausted: bool,
    from_route_id: Option<String>,
}

impl Default for Exchange {
    fn default() -> Self {
        Self::new(Message::default())
    }
}

impl Exchange {
    pub fn new(message: Message) -> Self {
        Self {
            id: new_exchange_id(),
            pattern: ExchangePattern::default(),
            created_at: Utc::now(),
            in_message: message,
            out_message: None,
            original_message: None,
            properties: HashMap::new(),
            variables: HashMap::new(),
            failure: None,
            exception_caught: None,
            route_stop: false,
            error_handler_handled: None,
            redelivery_exhausted: false,
            from_route_id: None,
        }
    }

    pub fn with_body(body: impl Into<Value>) -> Self {
        Self::new(Message::new(body))
    }

    pub fn with_pattern(mut self, pattern: ExchangePattern) -> Self {
        self.pattern = pattern;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pattern(&self) -> ExchangePattern {
        self.pattern
    }

    pub fn set_pattern(&mut self, pattern: ExchangePattern) {
        self.pattern = pattern;
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    // ---- 消息 ----

    pub fn in_message(&self) -> &Message {
        &self.in_message
    }

    pub fn in_message_mut(&mut self) -> &mut Message {
        &mut self.in_message
    }

    pub fn out_message(&self) -> Option<&Message> {
        self.out_message.as_ref()
    }

    pub fn has_out(&self) -> bool {
        self.out_message.is_some()
    }

    pub fn set_out(&mut self, message: Message) {
        self.out_message = Some(message);
    }

    pub fn take_out(&mut self) -> Option<Message> {
        self.out_message.take()
    }

    /// 当前消息
    pub fn message(&self) -> &Message {
        self.out_message.as_ref().unwrap_or(&self.in_message)
    }

    pub fn message_mut(&mut self) -> &mut Message {
        match self.out_message {
            Some(ref mut out) => out,
            None => &mut self.in_message,
        }
    }

    pub fn body(&self) -> &Value {
        self.message().body()
    }

    pub fn body_as<T: DeserializeOwned>(&self) -> crate::error::EipResult<T> {
        self.message().body_as()
    }

    pub fn set_body(&mut self, body: impl Into<Value>) {
        self.message_mut().set_body(body);
    }

    pub fn header(&self, name: &str) -> Option<&Value> {
        self.message().header(name)
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.message_mut().set_header(name, value);
    }

    /// 进入下一阶段前调用：若上一阶段产生了 out，则以其作为新的 in
    pub fn prepare_for_next_stage(&mut self) {
        if let Some(out) = self.out_message.take() {
            self.in_message = out;
        }
    }

    /// 进入路由时的原始消息（`useOriginalMessage` 使用）
    pub fn original_message(&self) -> Option<&Message> {
        self.original_message.as_ref()
    }

    /// 记录原始消息快照，仅首次生效
    pub fn snapshot_original(&mut self) {
        if self.original_message.is_none() {
            self.original_message = Some(self.message().clone());
        }
    }

    // ---- 属性 ----

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// 按类型读取属性；缺失或无法转换时返回 `None`
    pub fn property_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.properties.get(key).and_then(|v| convert::<T>(v).ok())
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn remove_property(&mut self, key: &str) -> Option<Value> {
        self.properties.remove(key)
    }

    pub fn has_property(&self, key: &str) -> bool {
        self.properties.contains_key(key)
    }

    pub fn properties(&self) -> &HashMap<String, Value> {
        &self.properties
    }

    // ---- 变量 ----

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn variable_as<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.variables.get(name).and_then(|v| convert::<T>(v).ok())
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.variables.insert(name.into(), value.into());
    }

    pub fn remove_variable(&mut self, name: &str) -> Option<Value> {
        self.variables.remove(name)
    }

    pub fn variables(&self) -> &HashMap<String, Value> {
        &self.variables
    }

    // ---- 失败与状态 ----

    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    pub fn set_failure(&mut self, failure: impl Into<Failure>) {
        self.failure = Some(failure.into());
    }

    pub fn take_failure(&mut self) -> Option<Failure> {
        self.failure.take()
    }

    pub fn clear_failure(&mut self) {
        self.failure = None;
    }

    /// 将处理器返回的错误写入失败槽
    pub fn capture(&mut self, result: anyhow::Result<()>) {
        if let Err(err) = result {
            self.failure = Some(Failure::from(err));
        }
    }

    /// 错误处理器捕获的错误，处理完成后仍保留
    pub fn exception_caught(&self) -> Option<&Failure> {
        self.exception_caught.as_ref()
    }

    pub fn set_exception_caught(&mut self, failure: Option<Failure>) {
        self.exception_caught = failure;
    }

    pub fn is_route_stop(&self) -> bool {
        self.route_stop
    }

    pub fn set_route_stop(&mut self, stop: bool) {
        self.route_stop = stop;
    }

    /// `None`：未经错误处理器处理；`Some(true)`：已处理；`Some(false)`：处理后仍失败
    pub fn error_handler_handled(&self) -> Option<bool> {
        self.error_handler_handled
    }

    pub fn set_error_handler_handled(&mut self, handled: Option<bool>) {
        self.error_handler_handled = handled;
    }

    pub fn is_redelivery_exhausted(&self) -> bool {
        self.redelivery_exhausted
    }

    pub fn set_redelivery_exhausted(&mut self, exhausted: bool) {
        self.redelivery_exhausted = exhausted;
    }

    /// 清除失败相关的全部痕迹（故障转移前使用）
    pub fn reset_failure_state(&mut self) {
        self.failure = None;
        self.exception_caught = None;
        self.error_handler_handled = None;
        self.redelivery_exhausted = false;
    }

    pub fn status(&self) -> ExchangeStatus {
        if self.failure.is_some() {
            ExchangeStatus::Failed
        } else if self.route_stop {
            ExchangeStatus::Stopped
        } else if self.error_handler_handled == Some(true) {
            ExchangeStatus::Handled
        } else {
            ExchangeStatus::Active
        }
    }

    pub fn from_route_id(&self) -> Option<&str> {
        self.from_route_id.as_deref()
    }

    pub fn set_from_route_id(&mut self, route_id: impl Into<String>) {
        self.from_route_id = Some(route_id.into());
    }

    // ---- 复制 ----

    /// 关联副本：新的 id，当前消息作为 in，属性与变量随之复制，失败状态清空。
    /// 关联 ID 归调用方所有：已存在时保持不变，否则写入父交换的 id。
    pub fn correlated_copy(&self) -> Exchange {
        let mut copy = self.clone();
        copy.id = new_exchange_id();
        copy.created_at = Utc::now();
        copy.prepare_for_next_stage();
        copy.reset_failure_state();
        copy.route_stop = false;
        if !copy.properties.contains_key(property::CORRELATION_ID) {
            copy.properties
                .insert(property::CORRELATION_ID.to_string(), Value::from(self.id.clone()));
        }
        copy
    }

    /// 将结果交换的消息与失败状态带回本交换；属性与变量不合并
    pub fn copy_results_from(&mut self, result: &Exchange) {
        self.in_message = result.message().clone();
        self.out_message = None;
        self.failure = result.failure.clone();
        self.exception_caught = result.exception_caught.clone();
        self.route_stop = result.route_stop;
        self.error_handler_handled = result.error_handler_handled;
        self.redelivery_exhausted = result.redelivery_exhausted;
    }

    /// 仅保留消息的副本（异步队列跳转使用）
    pub fn message_only_copy(&self) -> Exchange {
        let mut copy = Exchange::new(self.message().clone());
        copy.id = self.id.clone();
        copy.pattern = self.pattern;
        copy
    }

    /// 释放所有引用的数据，供对象池复用
    pub(crate) fn clear(&mut self) {
        self.in_message.clear();
        self.out_message = None;
        self.original_message = None;
        self.properties.clear();
        self.variables.clear();
        self.failure = None;
        self.exception_caught = None;
        self.route_stop = false;
        self.error_handler_handled = None;
        self.redelivery_exhausted = false;
        self.from_route_id = None;
    }

    /// 复位为一个全新的交换
    pub(crate) fn reset(&mut self, message: Message, pattern: ExchangePattern) {
        self.clear();
        self.id = new_exchange_id();
        self.created_at = Utc::now();
        self.pattern = pattern;
        self.in_message = message;
    }
}

fn new_exchange_id() -> String {
    Uuid::new_v4().to_string()
}
