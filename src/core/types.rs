//! 编排核心的值类型：ActionProposal、EvaluationVerdict、ActionResult、LineageReport
//!
//! 这些值在 Supervisor / Executor / Orchestrator 之间传递，创建后不再修改。
//! 重试或精炼总是产生新的 ActionProposal，与前驱共享 LineageId。

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::{FailureCause, RejectReason};
use crate::resource::{LeaseId, ResourceDemand, ResourceKind};

/// 动作种类：决定由哪个 OperationHandler 执行
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    FileOp,
    ProcessOp,
    WindowOp,
    ResourceOp,
    QueryOp,
}

impl ActionKind {
    pub const ALL: [ActionKind; 5] = [
        ActionKind::FileOp,
        ActionKind::ProcessOp,
        ActionKind::WindowOp,
        ActionKind::ResourceOp,
        ActionKind::QueryOp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::FileOp => "file_op",
            ActionKind::ProcessOp => "process_op",
            ActionKind::WindowOp => "window_op",
            ActionKind::ResourceOp => "resource_op",
            ActionKind::QueryOp => "query_op",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        Self::ALL.into_iter().find(|k| k.as_str() == normalized)
    }

    /// 执行前需要向 Broker 申请资源的种类
    pub fn is_resource_bearing(&self) -> bool {
        matches!(
            self,
            ActionKind::FileOp | ActionKind::ProcessOp | ActionKind::ResourceOp
        )
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一条 lineage 的标识（原始任务及其全部重试 / 精炼共享）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LineageId(String);

impl LineageId {
    pub fn new() -> Self {
        Self(format!("lineage_{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LineageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LineageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 单次尝试的 proposal 标识
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProposalId(uuid::Uuid);

impl ProposalId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ProposalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 一次动作请求及其理由；由外部 Plan Generator 产生，创建后不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionProposal {
    id: ProposalId,
    lineage: LineageId,
    kind: ActionKind,
    operation: String,
    params: Value,
    justification: String,
    attempt: u32,
    created_at: i64,
}

impl ActionProposal {
    /// 新 lineage 的首个 proposal（attempt = 0）
    pub fn new(
        kind: ActionKind,
        operation: impl Into<String>,
        params: Value,
        justification: impl Into<String>,
    ) -> Self {
        Self::build(LineageId::new(), kind, operation.into(), params, justification.into(), 0)
    }

    fn build(
        lineage: LineageId,
        kind: ActionKind,
        operation: String,
        params: Value,
        justification: String,
        attempt: u32,
    ) -> Self {
        Self {
            id: ProposalId::new(),
            lineage,
            kind,
            operation,
            params,
            justification,
            attempt,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// 普通重试：内容不变，attempt + 1，新 id
    pub fn next_attempt(&self) -> Self {
        Self::build(
            self.lineage.clone(),
            self.kind,
            self.operation.clone(),
            self.params.clone(),
            self.justification.clone(),
            self.attempt + 1,
        )
    }

    /// 精炼：同一 lineage 下的新内容，attempt + 1
    pub fn refined(
        &self,
        kind: ActionKind,
        operation: impl Into<String>,
        params: Value,
        justification: impl Into<String>,
    ) -> Self {
        Self::build(
            self.lineage.clone(),
            kind,
            operation.into(),
            params,
            justification.into(),
            self.attempt + 1,
        )
    }

    /// 把外部生成的 proposal 归入指定 lineage 与 attempt；已匹配时原样返回
    pub fn rehomed(self, lineage: &LineageId, attempt: u32) -> Self {
        if &self.lineage == lineage && self.attempt == attempt {
            return self;
        }
        Self::build(
            lineage.clone(),
            self.kind,
            self.operation,
            self.params,
            self.justification,
            attempt,
        )
    }

    pub fn id(&self) -> &ProposalId {
        &self.id
    }

    pub fn lineage(&self) -> &LineageId {
        &self.lineage
    }

    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn params(&self) -> &Value {
        &self.params
    }

    pub fn justification(&self) -> &str {
        &self.justification
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    /// 解析 `params.resources` 中显式声明的资源需求
    ///
    /// 格式：`[{"kind": "cpu_share", "quantity": 6}, ...]`；同种类需求合并，结果按 ResourceKind 排序。
    pub fn resource_demands(&self) -> Result<Vec<ResourceDemand>, FailureCause> {
        let Some(raw) = self.params.get("resources") else {
            return Ok(Vec::new());
        };
        let items = raw.as_array().ok_or_else(|| {
            FailureCause::InvalidParameters("'resources' must be an array".to_string())
        })?;
        let mut merged: std::collections::BTreeMap<ResourceKind, u64> = Default::default();
        for item in items {
            let kind = item
                .get("kind")
                .and_then(|v| v.as_str())
                .and_then(ResourceKind::parse)
                .ok_or_else(|| {
                    FailureCause::InvalidParameters(format!("unknown resource kind in {item}"))
                })?;
            let quantity = item.get("quantity").and_then(|v| v.as_u64()).ok_or_else(|| {
                FailureCause::InvalidParameters(format!("missing quantity in {item}"))
            })?;
            if quantity == 0 {
                continue;
            }
            let entry = merged.entry(kind).or_insert(0);
            *entry = entry.saturating_add(quantity);
        }
        Ok(merged
            .into_iter()
            .map(|(kind, quantity)| ResourceDemand { kind, quantity })
            .collect())
    }
}

/// 安全评估结论；每个 proposal 只产生一次
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", content = "reason", rename_all = "snake_case")]
pub enum EvaluationVerdict {
    Approved,
    Rejected(RejectReason),
}

impl EvaluationVerdict {
    pub fn is_approved(&self) -> bool {
        matches!(self, EvaluationVerdict::Approved)
    }
}

/// 动作执行状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "cause", rename_all = "snake_case")]
pub enum ActionStatus {
    Success,
    RetryableFailure(FailureCause),
    FatalFailure(FailureCause),
}

impl ActionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ActionStatus::Success => "success",
            ActionStatus::RetryableFailure(_) => "retryable_failure",
            ActionStatus::FatalFailure(_) => "fatal_failure",
        }
    }
}

/// Executor 的结构化结果；返回时 `leases` 中的租约均已释放
#[derive(Debug, Clone, Serialize)]
pub struct ActionResult {
    pub proposal_id: ProposalId,
    pub lineage_id: LineageId,
    pub status: ActionStatus,
    pub payload: Value,
    pub attempt: u32,
    pub leases: Vec<LeaseId>,
    pub duration_ms: u64,
}

impl ActionResult {
    pub fn is_success(&self) -> bool {
        matches!(self.status, ActionStatus::Success)
    }
}

/// 一条 lineage 运行中的计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LineageProgress {
    /// 已产生的 proposal 数
    pub attempts: u32,
    pub executor_invocations: u32,
    pub refines: u32,
    pub retries: u32,
}

/// lineage 的终态
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LineageOutcome {
    Success { payload: Value },
    Failure { cause: FailureCause },
}

/// 每条 lineage 恰好一份的终态报告
#[derive(Debug, Clone, Serialize)]
pub struct LineageReport {
    pub lineage_id: LineageId,
    #[serde(flatten)]
    pub outcome: LineageOutcome,
    /// 产生的 proposal 总数（含精炼）
    pub attempts: u32,
    pub executor_invocations: u32,
    pub refines: u32,
    pub retries: u32,
    pub elapsed_ms: u64,
}

impl LineageReport {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, LineageOutcome::Success { .. })
    }

    pub fn failure_cause(&self) -> Option<&FailureCause> {
        match &self.outcome {
            LineageOutcome::Failure { cause } => Some(cause),
            LineageOutcome::Success { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_next_attempt_keeps_lineage_and_content() {
        let p = ActionProposal::new(ActionKind::FileOp, "read_file", json!({"file_path": "a.txt"}), "need it");
        let q = p.next_attempt();
        assert_eq!(q.lineage(), p.lineage());
        assert_ne!(q.id(), p.id());
        assert_eq!(q.attempt(), 1);
        assert_eq!(q.params(), p.params());
        assert_eq!(q.operation(), "read_file");
    }

    #[test]
    fn test_rehomed_restamps_foreign_proposal() {
        let p = ActionProposal::new(ActionKind::QueryOp, "system_info", json!({}), "");
        let foreign = ActionProposal::new(ActionKind::QueryOp, "resource_usage", json!({}), "");
        let q = foreign.rehomed(p.lineage(), 3);
        assert_eq!(q.lineage(), p.lineage());
        assert_eq!(q.attempt(), 3);
        assert_eq!(q.operation(), "resource_usage");
    }

    #[test]
    fn test_resource_demands_merge_and_sort() {
        let p = ActionProposal::new(
            ActionKind::ResourceOp,
            "hold",
            json!({"resources": [
                {"kind": "network", "quantity": 5},
                {"kind": "cpu_share", "quantity": 2},
                {"kind": "cpu", "quantity": 3},
                {"kind": "disk_bytes", "quantity": 0}
            ]}),
            "",
        );
        let demands = p.resource_demands().unwrap();
        assert_eq!(
            demands,
            vec![
                ResourceDemand { kind: ResourceKind::CpuShare, quantity: 5 },
                ResourceDemand { kind: ResourceKind::NetworkBandwidth, quantity: 5 },
            ]
        );
    }

    #[test]
    fn test_resource_demands_reject_garbage() {
        let p = ActionProposal::new(ActionKind::ResourceOp, "hold", json!({"resources": [{"kind": "gpu", "quantity": 1}]}), "");
        assert!(matches!(p.resource_demands(), Err(FailureCause::InvalidParameters(_))));
        let p = ActionProposal::new(ActionKind::ResourceOp, "hold", json!({"resources": 3}), "");
        assert!(p.resource_demands().is_err());
    }

    #[test]
    fn test_action_kind_parse() {
        assert_eq!(ActionKind::parse("file-op"), Some(ActionKind::FileOp));
        assert_eq!(ActionKind::parse("QUERY_OP"), Some(ActionKind::QueryOp));
        assert_eq!(ActionKind::parse("delete-system-root"), None);
        assert!(!ActionKind::WindowOp.is_resource_bearing());
    }
}
