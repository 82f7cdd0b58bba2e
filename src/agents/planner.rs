//! Plan Generator 边界
//!
//! 外部规划器（通常是 LLM）负责产生初始 proposal 与被拒后的精炼 proposal；
//! 其延迟与输出质量不受核心控制，任何语法合法的 ActionProposal 都会被接受。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::{PlanError, RejectReason};
use crate::core::types::{ActionKind, ActionProposal};

#[async_trait]
pub trait PlanGenerator: Send + Sync {
    /// 为一个目标生成初始 proposal（新 lineage，attempt = 0）
    async fn propose(&self, goal: &str) -> Result<ActionProposal, PlanError>;

    /// 被拒后生成修订版（同一 lineage，attempt + 1）
    async fn refine(
        &self,
        rejected: &ActionProposal,
        reason: &RejectReason,
    ) -> Result<ActionProposal, PlanError>;
}

/// 结构化的任务草稿（JSON 任务文件 / 规划器输出）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDraft {
    pub kind: ActionKind,
    pub operation: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub justification: String,
}

impl TaskDraft {
    pub fn new(kind: ActionKind, operation: impl Into<String>, params: Value) -> Self {
        Self {
            kind,
            operation: operation.into(),
            params,
            justification: String::new(),
        }
    }

    pub fn with_justification(mut self, justification: impl Into<String>) -> Self {
        self.justification = justification.into();
        self
    }

    pub fn into_proposal(self) -> ActionProposal {
        ActionProposal::new(self.kind, self.operation, self.params, self.justification)
    }

    /// 作为 `previous` 的精炼版本
    pub fn refine_of(self, previous: &ActionProposal) -> ActionProposal {
        previous.refined(self.kind, self.operation, self.params, self.justification)
    }
}

/// 把目标当作 JSON TaskDraft 解析；精炼时原样重提并在理由中注明拒绝原因
#[derive(Debug, Default)]
pub struct JsonPlanner;

#[async_trait]
impl PlanGenerator for JsonPlanner {
    async fn propose(&self, goal: &str) -> Result<ActionProposal, PlanError> {
        let draft: TaskDraft =
            serde_json::from_str(goal).map_err(|e| PlanError::Malformed(e.to_string()))?;
        Ok(draft.into_proposal())
    }

    async fn refine(
        &self,
        rejected: &ActionProposal,
        reason: &RejectReason,
    ) -> Result<ActionProposal, PlanError> {
        Ok(rejected.refined(
            rejected.kind(),
            rejected.operation(),
            rejected.params().clone(),
            format!("{} (revised after rejection: {})", rejected.justification(), reason),
        ))
    }
}

/// 脚本化规划器（用于测试，无需外部服务）：按顺序返回预置的精炼草稿
#[derive(Debug, Default)]
pub struct ScriptedPlanner {
    initial: Mutex<VecDeque<TaskDraft>>,
    refinements: Mutex<VecDeque<TaskDraft>>,
    refine_calls: AtomicU32,
    fail_refine: bool,
}

impl ScriptedPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial(self, draft: TaskDraft) -> Self {
        self.initial.lock().push_back(draft);
        self
    }

    pub fn with_refinement(self, draft: TaskDraft) -> Self {
        self.refinements.lock().push_back(draft);
        self
    }

    /// refine 一律失败
    pub fn failing_refine(mut self) -> Self {
        self.fail_refine = true;
        self
    }

    pub fn refine_calls(&self) -> u32 {
        self.refine_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlanGenerator for ScriptedPlanner {
    async fn propose(&self, goal: &str) -> Result<ActionProposal, PlanError> {
        if let Some(draft) = self.initial.lock().pop_front() {
            return Ok(draft.into_proposal());
        }
        JsonPlanner.propose(goal).await
    }

    async fn refine(
        &self,
        rejected: &ActionProposal,
        reason: &RejectReason,
    ) -> Result<ActionProposal, PlanError> {
        self.refine_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_refine {
            return Err(PlanError::Unavailable("scripted failure".to_string()));
        }
        let next = self.refinements.lock().pop_front();
        match next {
            Some(draft) => Ok(draft.refine_of(rejected)),
            None => JsonPlanner.refine(rejected, reason).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_json_planner_propose() {
        let p = JsonPlanner
            .propose(r#"{"kind": "query_op", "operation": "system_info"}"#)
            .await
            .unwrap();
        assert_eq!(p.kind(), ActionKind::QueryOp);
        assert_eq!(p.attempt(), 0);
        assert_eq!(p.params(), &Value::Null);
    }

    #[tokio::test]
    async fn test_json_planner_rejects_garbage() {
        let err = JsonPlanner.propose("delete everything").await.unwrap_err();
        assert!(matches!(err, PlanError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_scripted_refine_same_lineage() {
        let planner = ScriptedPlanner::new().with_refinement(TaskDraft::new(
            ActionKind::FileOp,
            "list_directory",
            json!({"dir_path": "/tmp"}),
        ));
        let first = ActionProposal::new(ActionKind::FileOp, "delete-system-root", json!({}), "");
        let reason = RejectReason::DeniedOperation {
            operation: "delete-system-root".into(),
        };
        let refined = planner.refine(&first, &reason).await.unwrap();
        assert_eq!(refined.lineage(), first.lineage());
        assert_eq!(refined.attempt(), 1);
        assert_eq!(refined.operation(), "list_directory");

        // 脚本用完后原样重提
        let again = planner.refine(&refined, &reason).await.unwrap();
        assert_eq!(again.operation(), "list_directory");
        assert_eq!(again.attempt(), 2);
        assert_eq!(planner.refine_calls(), 2);
    }
}
