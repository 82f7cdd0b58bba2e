//! 核心编排层：值类型与错误、失败恢复、lineage 调度、关闭管理、主控循环

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod shutdown;
pub mod task_scheduler;
pub mod types;

pub use builder::OrchestratorBuilder;
pub use error::{ConfigurationError, DenialReason, FailureCause, LedgerError, PlanError, RejectReason};
pub use orchestrator::{LineageHandle, Orchestrator};
pub use recovery::{BackoffPolicy, RecoveryAction, RecoveryEngine};
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use task_scheduler::TaskScheduler;
pub use types::{
    ActionKind, ActionProposal, ActionResult, ActionStatus, EvaluationVerdict, LineageId, LineageOutcome,
    LineageProgress, LineageReport, ProposalId,
};
