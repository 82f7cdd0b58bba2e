//! Supervisor（Parent 角色）：安全评估与精炼循环
//!
//! 每个 proposal 的状态机：Proposed -> Evaluating -> {Approved, Rejected}。
//! 被策略拒绝且精炼次数未用尽时，请 Plan Generator 给出同一 lineage 的修订版并重新评估；
//! 用尽时给出 Rejected(RefineLimitExceeded)，由编排循环转为终态失败。
//! Supervisor 不执行动作，也不接触 Resource Broker。

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::agents::planner::PlanGenerator;
use crate::agents::policy::SafetyPolicy;
use crate::core::error::{PlanError, RejectReason};
use crate::core::types::{ActionProposal, EvaluationVerdict, LineageProgress};
use crate::observability::{CoreEvent, EventSink};

/// 单个 proposal 的评估状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProposalState {
    Proposed,
    Evaluating,
    Approved,
    Rejected(RejectReason),
}

impl ProposalState {
    /// 合法转移：Proposed -> Evaluating -> 终态
    pub fn advance(self, verdict: Option<&EvaluationVerdict>) -> ProposalState {
        match (self, verdict) {
            (ProposalState::Proposed, _) => ProposalState::Evaluating,
            (ProposalState::Evaluating, Some(EvaluationVerdict::Approved)) => ProposalState::Approved,
            (ProposalState::Evaluating, Some(EvaluationVerdict::Rejected(reason))) => {
                ProposalState::Rejected(reason.clone())
            }
            (state, _) => state,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProposalState::Approved | ProposalState::Rejected(_))
    }
}

/// review 的结果
#[derive(Debug)]
pub enum Review {
    /// 交给 Executor 的 proposal（可能是精炼后的版本）
    Approved(ActionProposal),
    /// 精炼次数用尽，lineage 终止
    Rejected(RejectReason),
    PlannerFailed(PlanError),
    Cancelled,
}

pub struct Supervisor {
    policy: SafetyPolicy,
    planner: Arc<dyn PlanGenerator>,
    refine_limit: u32,
    sink: Arc<dyn EventSink>,
}

impl Supervisor {
    pub fn new(
        policy: SafetyPolicy,
        planner: Arc<dyn PlanGenerator>,
        refine_limit: u32,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            policy,
            planner,
            refine_limit,
            sink,
        }
    }

    pub fn refine_limit(&self) -> u32 {
        self.refine_limit
    }

    /// 确定性评估：拒绝名单优先；命中且该 lineage 已用尽精炼次数时给出 RefineLimitExceeded
    pub fn evaluate(&self, proposal: &ActionProposal, refines_used: u32) -> EvaluationVerdict {
        let mut state = ProposalState::Proposed.advance(None);
        debug_assert_eq!(state, ProposalState::Evaluating);

        let verdict = match self.policy.check(proposal) {
            Ok(()) => EvaluationVerdict::Approved,
            Err(reason) if refines_used >= self.refine_limit => {
                EvaluationVerdict::Rejected(RejectReason::RefineLimitExceeded {
                    refines: refines_used,
                    last: Box::new(reason),
                })
            }
            Err(reason) => EvaluationVerdict::Rejected(reason),
        };
        state = state.advance(Some(&verdict));
        debug_assert!(state.is_terminal());

        tracing::info!(
            lineage = %proposal.lineage(),
            attempt = proposal.attempt(),
            kind = %proposal.kind(),
            operation = %proposal.operation(),
            approved = verdict.is_approved(),
            "Proposal evaluated"
        );
        self.sink.emit(CoreEvent::ProposalEvaluated {
            lineage_id: proposal.lineage().clone(),
            proposal_id: proposal.id().clone(),
            attempt: proposal.attempt(),
            kind: proposal.kind(),
            operation: proposal.operation().to_string(),
            verdict: verdict.clone(),
        });
        verdict
    }

    /// 评估并在需要时驱动精炼，直到批准、精炼用尽、规划失败或取消
    pub async fn review(
        &self,
        proposal: ActionProposal,
        progress: &mut LineageProgress,
        cancel: &CancellationToken,
    ) -> Review {
        let mut current = proposal;
        loop {
            let reason = match self.evaluate(&current, progress.refines) {
                EvaluationVerdict::Approved => return Review::Approved(current),
                EvaluationVerdict::Rejected(reason) if reason.is_refine_limit() => {
                    return Review::Rejected(reason)
                }
                EvaluationVerdict::Rejected(reason) => reason,
            };

            tracing::debug!(
                lineage = %current.lineage(),
                refines = progress.refines,
                limit = self.refine_limit,
                "Rejected ({}), requesting refinement",
                reason
            );

            let refined = tokio::select! {
                _ = cancel.cancelled() => return Review::Cancelled,
                r = self.planner.refine(&current, &reason) => r,
            };
            progress.refines += 1;
            match refined {
                Ok(next) => {
                    let attempt = current.attempt() + 1;
                    if next.lineage() != current.lineage() || next.attempt() != attempt {
                        tracing::warn!(
                            lineage = %current.lineage(),
                            "Planner returned a proposal outside the lineage, re-homing it"
                        );
                    }
                    current = next.rehomed(current.lineage(), attempt);
                    progress.attempts += 1;
                }
                Err(e) => {
                    tracing::warn!(lineage = %current.lineage(), "Refinement failed: {}", e);
                    return Review::PlannerFailed(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::planner::{ScriptedPlanner, TaskDraft};
    use crate::agents::policy::DEFAULT_DENIED_OPERATIONS;
    use crate::core::types::ActionKind;
    use crate::observability::MemorySink;
    use serde_json::json;

    fn policy() -> SafetyPolicy {
        SafetyPolicy::new([], DEFAULT_DENIED_OPERATIONS.iter().map(|s| s.to_string()), &[]).unwrap()
    }

    fn supervisor(planner: Arc<ScriptedPlanner>, limit: u32) -> (Supervisor, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        (Supervisor::new(policy(), planner, limit, sink.clone()), sink)
    }

    fn root_delete() -> ActionProposal {
        ActionProposal::new(ActionKind::FileOp, "delete-system-root", json!({"path": "/"}), "free space")
    }

    #[test]
    fn test_state_machine_transitions() {
        let s = ProposalState::Proposed.advance(None);
        assert_eq!(s, ProposalState::Evaluating);
        let s = s.advance(Some(&EvaluationVerdict::Approved));
        assert_eq!(s, ProposalState::Approved);
        // 终态不再变化
        let reason = RejectReason::DeniedOperation { operation: "x".into() };
        assert_eq!(
            s.clone().advance(Some(&EvaluationVerdict::Rejected(reason))),
            ProposalState::Approved
        );
        assert!(s.is_terminal());
    }

    #[test]
    fn test_denylisted_rejected_on_first_evaluation() {
        let planner = Arc::new(ScriptedPlanner::new());
        let (sup, sink) = supervisor(planner.clone(), 3);
        let verdict = sup.evaluate(&root_delete(), 0);
        assert_eq!(
            verdict,
            EvaluationVerdict::Rejected(RejectReason::DeniedOperation {
                operation: "delete-system-root".into()
            })
        );
        assert_eq!(planner.refine_calls(), 0);
        assert_eq!(sink.count("proposal_evaluated"), 1);
    }

    #[test]
    fn test_limit_reached_gives_refine_limit_exceeded() {
        let (sup, _) = supervisor(Arc::new(ScriptedPlanner::new()), 2);
        let verdict = sup.evaluate(&root_delete(), 2);
        assert!(matches!(
            verdict,
            EvaluationVerdict::Rejected(RejectReason::RefineLimitExceeded { refines: 2, .. })
        ));
        // 未命中拒绝名单的 proposal 不受精炼计数影响
        let ok = ActionProposal::new(ActionKind::QueryOp, "system_info", json!({}), "");
        assert!(sup.evaluate(&ok, 2).is_approved());
    }

    #[tokio::test]
    async fn test_review_refines_until_safe() {
        let planner = Arc::new(
            ScriptedPlanner::new()
                .with_refinement(TaskDraft::new(ActionKind::FileOp, "delete-system-root", json!({})))
                .with_refinement(TaskDraft::new(ActionKind::FileOp, "list_directory", json!({"dir_path": "/tmp"}))),
        );
        let (sup, _) = supervisor(planner.clone(), 3);
        let first = root_delete();
        let lineage = first.lineage().clone();
        let mut progress = LineageProgress { attempts: 1, ..Default::default() };

        match sup.review(first, &mut progress, &CancellationToken::new()).await {
            Review::Approved(p) => {
                assert_eq!(p.operation(), "list_directory");
                assert_eq!(p.lineage(), &lineage);
                assert_eq!(p.attempt(), 2);
            }
            other => panic!("Expected Approved, got {other:?}"),
        }
        assert_eq!(progress.refines, 2);
        assert_eq!(progress.attempts, 3);
        assert_eq!(planner.refine_calls(), 2);
    }

    #[tokio::test]
    async fn test_review_stops_at_refine_limit() {
        let planner = Arc::new(ScriptedPlanner::new());
        let (sup, _) = supervisor(planner.clone(), 2);
        let mut progress = LineageProgress::default();
        let review = sup.review(root_delete(), &mut progress, &CancellationToken::new()).await;
        assert!(matches!(
            review,
            Review::Rejected(RejectReason::RefineLimitExceeded { refines: 2, .. })
        ));
        assert_eq!(planner.refine_calls(), 2);
    }

    #[tokio::test]
    async fn test_zero_refine_limit_never_calls_planner() {
        let planner = Arc::new(ScriptedPlanner::new());
        let (sup, _) = supervisor(planner.clone(), 0);
        let mut progress = LineageProgress::default();
        let review = sup.review(root_delete(), &mut progress, &CancellationToken::new()).await;
        assert!(matches!(review, Review::Rejected(_)));
        assert_eq!(planner.refine_calls(), 0);
    }

    #[tokio::test]
    async fn test_planner_failure_surfaces() {
        let planner = Arc::new(ScriptedPlanner::new().failing_refine());
        let (sup, _) = supervisor(planner, 2);
        let mut progress = LineageProgress::default();
        let review = sup.review(root_delete(), &mut progress, &CancellationToken::new()).await;
        assert!(matches!(review, Review::PlannerFailed(PlanError::Unavailable(_))));
    }
}
