//! 操作处理器注册表
//!
//! 每种 ActionKind 最多一个 OperationHandler，由 HandlerRegistry 按种类注册与查找；
//! Executor 在持有租约期间调用 handler，并把 HandlerError 映射为 Retryable / Fatal。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::core::types::ActionKind;

/// handler 失败的分类
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// 暂时性失败（I/O 中断、子进程超时等），可重试
    #[error("Transient failure: {0}")]
    Retryable(String),

    #[error("Operation failed: {0}")]
    Fatal(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
}

/// 一种 ActionKind 的执行者
#[async_trait]
pub trait OperationHandler: Send + Sync {
    fn kind(&self) -> ActionKind;

    /// 支持的操作名
    fn operations(&self) -> Vec<&'static str>;

    async fn run(&self, operation: &str, params: Value) -> Result<Value, HandlerError>;
}

/// 某种类 handler 对外公布的能力
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capability {
    pub kind: ActionKind,
    pub operations: Vec<&'static str>,
}

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<ActionKind, Arc<dyn OperationHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册；同种类的旧 handler 被替换
    pub fn register(&mut self, handler: impl OperationHandler + 'static) {
        self.register_arc(Arc::new(handler));
    }

    pub fn register_arc(&mut self, handler: Arc<dyn OperationHandler>) {
        let kind = handler.kind();
        if self.handlers.insert(kind, handler).is_some() {
            tracing::debug!(kind = %kind, "Replacing operation handler");
        }
    }

    pub fn get(&self, kind: ActionKind) -> Option<Arc<dyn OperationHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<ActionKind> {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        self.kinds()
            .into_iter()
            .filter_map(|kind| {
                self.handlers.get(&kind).map(|h| Capability {
                    kind,
                    operations: h.operations(),
                })
            })
            .collect()
    }
}

/// 读取字符串参数
pub(crate) fn str_param<'a>(params: &'a Value, key: &str) -> Result<&'a str, HandlerError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| HandlerError::InvalidParameters(format!("missing string '{key}'")))
}

pub(crate) fn bool_param(params: &Value, key: &str, default: bool) -> bool {
    params.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
}
