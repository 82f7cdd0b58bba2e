//! 失败恢复：把 ActionResult 映射为下一步动作（完成 / 退避后重试 / 终止）
//!
//! 只有这里和 Supervisor 的精炼上限会把局部失败升级为 lineage 终态；
//! 资源拒绝本身永远是可重试的。

use std::time::Duration;

use serde_json::Value;

use crate::core::error::FailureCause;
use crate::core::types::{ActionResult, ActionStatus};

/// 指数退避：base × 2^retries_used，封顶 cap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    pub fn delay(&self, retries_used: u32) -> Duration {
        let factor = 1u32.checked_shl(retries_used).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(5))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// lineage 成功结束
    Complete(Value),
    /// 等待后以新 proposal 重试
    Retry { delay: Duration },
    /// 终态失败
    Abort(FailureCause),
}

#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    max_retries: u32,
    backoff: BackoffPolicy,
}

impl RecoveryEngine {
    pub fn new(max_retries: u32, backoff: BackoffPolicy) -> Self {
        Self { max_retries, backoff }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// `retries_used` 为该 lineage 已经做过的重试次数
    pub fn handle(&self, result: &ActionResult, retries_used: u32) -> RecoveryAction {
        match &result.status {
            ActionStatus::Success => RecoveryAction::Complete(result.payload.clone()),
            ActionStatus::RetryableFailure(_) if retries_used < self.max_retries => {
                RecoveryAction::Retry {
                    delay: self.backoff.delay(retries_used),
                }
            }
            ActionStatus::RetryableFailure(cause) => RecoveryAction::Abort(FailureCause::RetriesExhausted {
                last: Box::new(cause.clone()),
            }),
            ActionStatus::FatalFailure(cause) => RecoveryAction::Abort(cause.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::DenialReason;
    use crate::core::types::{ActionKind, ActionProposal};
    use serde_json::json;

    fn result(status: ActionStatus) -> ActionResult {
        let p = ActionProposal::new(ActionKind::QueryOp, "system_info", json!({}), "");
        ActionResult {
            proposal_id: p.id().clone(),
            lineage_id: p.lineage().clone(),
            status,
            payload: json!({"ok": true}),
            attempt: 0,
            leases: Vec::new(),
            duration_ms: 1,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let b = BackoffPolicy::new(Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(b.delay(0), Duration::from_millis(100));
        assert_eq!(b.delay(1), Duration::from_millis(200));
        assert_eq!(b.delay(2), Duration::from_millis(400));
        assert_eq!(b.delay(3), Duration::from_millis(500));
        assert_eq!(b.delay(40), Duration::from_millis(500));
    }

    #[test]
    fn test_retryable_until_exhausted() {
        let engine = RecoveryEngine::new(3, BackoffPolicy::default());
        let cause = FailureCause::ResourceUnavailable(DenialReason::DeadlineExceeded);
        let r = result(ActionStatus::RetryableFailure(cause.clone()));
        for used in 0..3 {
            assert!(matches!(engine.handle(&r, used), RecoveryAction::Retry { .. }));
        }
        assert_eq!(
            engine.handle(&r, 3),
            RecoveryAction::Abort(FailureCause::RetriesExhausted { last: Box::new(cause) })
        );
    }

    #[test]
    fn test_fatal_and_success() {
        let engine = RecoveryEngine::new(3, BackoffPolicy::default());
        let fatal = result(ActionStatus::FatalFailure(FailureCause::HandlerPanicked));
        assert_eq!(engine.handle(&fatal, 0), RecoveryAction::Abort(FailureCause::HandlerPanicked));
        let ok = result(ActionStatus::Success);
        assert_eq!(engine.handle(&ok, 2), RecoveryAction::Complete(json!({"ok": true})));
    }

    #[test]
    fn test_zero_retries_aborts_first_failure() {
        let engine = RecoveryEngine::new(0, BackoffPolicy::default());
        let r = result(ActionStatus::RetryableFailure(FailureCause::HandlerTimeout));
        assert!(matches!(
            engine.handle(&r, 0),
            RecoveryAction::Abort(FailureCause::RetriesExhausted { .. })
        ));
    }
}
