//! 错误分类
//!
//! - ConfigurationError：启动时致命（容量、重试/精炼上限、正则非法）
//! - RejectReason：Supervisor 的安全拒绝原因
//! - DenialReason：Broker 拒绝资源申请的原因，在 Executor 边界一律视为可重试失败
//! - LedgerError：租约不存在等契约违例，上报但不致命
//! - FailureCause：ActionResult / LineageReport 中携带的失败原因

use serde::Serialize;
use thiserror::Error;

use crate::core::types::ActionKind;
use crate::resource::{LeaseId, ResourceKind};

/// 配置错误：只在启动阶段出现
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Invalid capacity for {kind}: {value} (must be > 0)")]
    InvalidCapacity { kind: ResourceKind, value: i64 },

    #[error("Invalid limit {name}={value}: {reason}")]
    InvalidLimit {
        name: &'static str,
        value: u64,
        reason: &'static str,
    },

    #[error("Invalid denylist pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Unknown action kind in config: {0}")]
    UnknownActionKind(String),

    #[error("Unknown resource kind in config: {0}")]
    UnknownResourceKind(String),

    #[error("Config load failed: {0}")]
    Load(#[from] config::ConfigError),
}

/// Ledger 操作错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// 释放未知或已释放的租约
    #[error("Lease not found: {0}")]
    LeaseNotFound(LeaseId),

    #[error("Insufficient {kind}: requested {requested}, available {available}")]
    Insufficient {
        kind: ResourceKind,
        requested: u64,
        available: u64,
    },
}

/// Broker 拒绝原因
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("capacity unavailable")]
    CapacityUnavailable,
    #[error("cancelled")]
    Cancelled,
}

/// Supervisor 的拒绝原因
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RejectReason {
    #[error("action kind '{kind}' is denylisted")]
    DeniedKind { kind: ActionKind },

    #[error("operation '{operation}' is denylisted")]
    DeniedOperation { operation: String },

    #[error("parameters match denylisted pattern '{pattern}'")]
    DeniedPattern { pattern: String },

    /// 已用尽精炼次数；`last` 为最后一次策略拒绝
    #[error("refine limit exceeded after {refines} refinements (last: {last})")]
    RefineLimitExceeded {
        refines: u32,
        last: Box<RejectReason>,
    },
}

impl RejectReason {
    pub fn is_refine_limit(&self) -> bool {
        matches!(self, RejectReason::RefineLimitExceeded { .. })
    }
}

/// 外部 Plan Generator 的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("Plan generator unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed plan: {0}")]
    Malformed(String),
}

/// 失败原因：用于 ActionResult 与终态报告
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "detail", rename_all = "snake_case")]
pub enum FailureCause {
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(DenialReason),

    #[error("handler timed out")]
    HandlerTimeout,

    #[error("operation failed: {0}")]
    Operation(String),

    #[error("handler panicked")]
    HandlerPanicked,

    #[error("no handler registered for {0}")]
    NoHandler(ActionKind),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("cancelled")]
    Cancelled,

    #[error("retries exhausted (last: {last})")]
    RetriesExhausted { last: Box<FailureCause> },

    #[error("safety rejected: {0}")]
    SafetyRejected(RejectReason),

    #[error("plan generator failed: {0}")]
    PlannerFailed(String),

    #[error("lineage task panicked")]
    LineagePanicked,
}

impl From<PlanError> for FailureCause {
    fn from(e: PlanError) -> Self {
        FailureCause::PlannerFailed(e.to_string())
    }
}
