//! 资源操作 handler（resource_op）
//!
//! `hold` 在 Executor 已取得的租约下等待 `duration_ms`，用于预留与压测场景；
//! 租约由 Executor 在返回后释放。

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::types::ActionKind;
use crate::handlers::registry::{HandlerError, OperationHandler};

#[derive(Debug, Default)]
pub struct ResourceOpHandler;

#[async_trait]
impl OperationHandler for ResourceOpHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::ResourceOp
    }

    fn operations(&self) -> Vec<&'static str> {
        vec!["hold"]
    }

    async fn run(&self, operation: &str, params: Value) -> Result<Value, HandlerError> {
        if operation != "hold" {
            return Err(HandlerError::UnsupportedOperation(operation.to_string()));
        }
        let duration_ms = match params.get("duration_ms") {
            None | Some(Value::Null) => 0,
            Some(v) => v.as_u64().ok_or_else(|| {
                HandlerError::InvalidParameters("'duration_ms' must be a non-negative integer".into())
            })?,
        };
        if duration_ms > 0 {
            tokio::time::sleep(Duration::from_millis(duration_ms)).await;
        }
        Ok(json!({ "held_ms": duration_ms }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_hold_waits() {
        let start = tokio::time::Instant::now();
        let out = ResourceOpHandler.run("hold", json!({"duration_ms": 250})).await.unwrap();
        assert_eq!(out["held_ms"], 250);
        assert!(start.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_hold_rejects_bad_duration() {
        let err = ResourceOpHandler.run("hold", json!({"duration_ms": -5})).await.unwrap_err();
        assert!(matches!(err, HandlerError::InvalidParameters(_)));
    }
}
