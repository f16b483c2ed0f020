use crate::error::{EipError, EipResult};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::any::type_name;
use std::collections::HashMap;

/// 消息：载荷（body）与头（headers）
///
/// body 以 JSON 值承载，读取时按需转换为目标类型（惰性类型转换）。
/// 头键区分大小写，由传输层自行约定大小写策略。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    body: Value,
    #[serde(default)]
    headers: HashMap<String, Value>,
}

impl Message {
    pub fn new(body: impl Into<Value>) -> Self {
        Self {
            body: body.into(),
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut Value {
        &mut self.body
    }

    pub fn set_body(&mut self, body: impl Into<Value>) {
        self.body = body.into();
    }

    pub fn take_body(&mut self) -> Value {
        std::mem::take(&mut self.body)
    }

    /// 将 body 转换为 `T`
    pub fn body_as<T: DeserializeOwned>(&self) -> EipResult<T> {
        convert(&self.body)
    }

    /// 以任意可序列化的值作为 body
    pub fn set_body_from<T: Serialize>(&mut self, value: &T) -> EipResult<()> {
        self.body = serde_json::to_value(value)?;
        Ok(())
    }

    /// 文本视图：字符串原样返回，null 为空串，其他值取其 JSON 表示
    pub fn body_as_string(&self) -> String {
        value_to_string(&self.body)
    }

    pub fn header(&self, name: &str) -> Option<&Value> {
        self.headers.get(name)
    }

    pub fn header_as<T: DeserializeOwned>(&self, name: &str) -> EipResult<Option<T>> {
        self.headers.get(name).map(convert::<T>).transpose()
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.headers.insert(name.into(), value.into());
    }

    pub fn remove_header(&mut self, name: &str) -> Option<Value> {
        self.headers.remove(name)
    }

    pub fn headers(&self) -> &HashMap<String, Value> {
        &self.headers
    }

    pub fn has_headers(&self) -> bool {
        !self.headers.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.body = Value::Null;
        self.headers.clear();
    }
}

pub(crate) fn convert<T: DeserializeOwned>(value: &Value) -> EipResult<T> {
    serde_json::from_value(value.clone()).map_err(|e| EipError::TypeConversion {
        expected: type_name::<T>(),
        reason: e.to_string(),
    })
}

/// 值的文本视图：字符串原样返回，null 为空串，其他值取其 JSON 表示
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
