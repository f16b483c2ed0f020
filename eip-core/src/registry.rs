//! Bean 注册表：按名称保存任意共享对象（重投策略、聚合策略、幂等仓库、处理器等）
//!
use crate::error::{EipError, EipResult};
use dashmap::DashMap;
use std::any::{Any, type_name};
use std::sync::Arc;

type Bean = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
pub struct Registry {
    beans: DashMap<String, Bean>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 绑定；同名已存在时覆盖
    pub fn bind<T: Send + Sync + 'static>(&self, name: impl Into<String>, bean: T) {
        self.beans.insert(name.into(), Arc::new(bean));
    }

    pub fn lookup<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.beans
            .get(name)
            .and_then(|bean| bean.value().clone().downcast::<T>().ok())
    }

    /// 查找，缺失或类型不符时报错
    pub fn require<T: Send + Sync + 'static>(&self, name: &str) -> EipResult<Arc<T>> {
        self.lookup(name).ok_or_else(|| EipError::NoSuchBean {
            name: name.to_string(),
            expected: type_name::<T>(),
        })
    }

    pub fn unbind(&self, name: &str) -> bool {
        self.beans.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.beans.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.beans.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
