//! 编排循环：驱动一条 lineage 从 proposal 到唯一的终态报告
//!
//! Proposal -> Supervisor（含精炼）-> Executor（含资源申请）-> RecoveryEngine：
//! 成功即结束；可重试失败在上限内退避后以新 proposal 重新送审；致命失败立即结束。
//! 多条 lineage 各自一个任务并发运行，互相只通过 Broker 竞争资源。

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agents::{Executor, PlanGenerator, Review, Supervisor};
use crate::core::error::FailureCause;
use crate::core::recovery::{RecoveryAction, RecoveryEngine};
use crate::core::shutdown::{ShutdownManager, ShutdownReason};
use crate::core::task_scheduler::TaskScheduler;
use crate::core::types::{ActionProposal, LineageId, LineageOutcome, LineageProgress, LineageReport};
use crate::observability::{CoreEvent, EventSink};

pub struct Orchestrator {
    supervisor: Supervisor,
    executor: Executor,
    planner: Arc<dyn PlanGenerator>,
    recovery: RecoveryEngine,
    scheduler: TaskScheduler,
    shutdown: Arc<ShutdownManager>,
    active: Mutex<HashMap<LineageId, CancellationToken>>,
    sink: Arc<dyn EventSink>,
}

/// lineage 的起点
enum Origin {
    Proposal(ActionProposal),
    Goal(String),
}

impl Orchestrator {
    pub fn new(
        supervisor: Supervisor,
        executor: Executor,
        planner: Arc<dyn PlanGenerator>,
        recovery: RecoveryEngine,
        scheduler: TaskScheduler,
        shutdown: Arc<ShutdownManager>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            supervisor,
            executor,
            planner,
            recovery,
            scheduler,
            shutdown,
            active: Mutex::new(HashMap::new()),
            sink,
        }
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn shutdown_manager(&self) -> &Arc<ShutdownManager> {
        &self.shutdown
    }

    /// 在当前任务中运行一条 lineage，直到终态
    pub async fn run_lineage(&self, initial: ActionProposal, cancel: &CancellationToken) -> LineageReport {
        let started = Instant::now();
        let lineage = initial.lineage().clone();
        let mut progress = LineageProgress {
            attempts: 1,
            ..Default::default()
        };
        let outcome = self.drive(initial, &mut progress, cancel).await;
        self.finish(lineage, outcome, progress, started)
    }

    async fn drive(
        &self,
        initial: ActionProposal,
        progress: &mut LineageProgress,
        cancel: &CancellationToken,
    ) -> LineageOutcome {
        let mut proposal = initial;
        loop {
            if cancel.is_cancelled() {
                return failure(FailureCause::Cancelled);
            }

            let approved = match self.supervisor.review(proposal, progress, cancel).await {
                Review::Approved(p) => p,
                Review::Rejected(reason) => return failure(FailureCause::SafetyRejected(reason)),
                Review::PlannerFailed(e) => return failure(e.into()),
                Review::Cancelled => return failure(FailureCause::Cancelled),
            };

            progress.executor_invocations += 1;
            let result = self.executor.execute(&approved, cancel).await;

            match self.recovery.handle(&result, progress.retries) {
                RecoveryAction::Complete(payload) => return LineageOutcome::Success { payload },
                RecoveryAction::Abort(cause) => return failure(cause),
                RecoveryAction::Retry { delay } => {
                    tracing::debug!(
                        lineage = %approved.lineage(),
                        retry = progress.retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying after backoff"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return failure(FailureCause::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    progress.retries += 1;
                    progress.attempts += 1;
                    proposal = approved.next_attempt();
                }
            }
        }
    }

    /// 生成并发出终态报告
    fn finish(
        &self,
        lineage_id: LineageId,
        outcome: LineageOutcome,
        progress: LineageProgress,
        started: Instant,
    ) -> LineageReport {
        let report = LineageReport {
            lineage_id,
            outcome,
            attempts: progress.attempts,
            executor_invocations: progress.executor_invocations,
            refines: progress.refines,
            retries: progress.retries,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        match report.failure_cause() {
            None => tracing::info!(
                lineage = %report.lineage_id,
                attempts = report.attempts,
                elapsed_ms = report.elapsed_ms,
                "Lineage succeeded"
            ),
            Some(cause) => tracing::warn!(
                lineage = %report.lineage_id,
                attempts = report.attempts,
                retries = report.retries,
                refines = report.refines,
                "Lineage failed: {}",
                cause
            ),
        }
        self.sink.emit(CoreEvent::LineageTerminal {
            report: report.clone(),
        });
        report
    }

    /// 为已有 proposal 启动一条 lineage
    pub fn spawn(self: &Arc<Self>, proposal: ActionProposal) -> LineageHandle {
        let lineage = proposal.lineage().clone();
        self.launch(lineage, Origin::Proposal(proposal))
    }

    /// 请规划器为目标生成初始 proposal 并启动 lineage；规划失败也会得到终态报告
    pub fn submit(self: &Arc<Self>, goal: impl Into<String>) -> LineageHandle {
        self.launch(LineageId::new(), Origin::Goal(goal.into()))
    }

    fn launch(self: &Arc<Self>, lineage: LineageId, origin: Origin) -> LineageHandle {
        let cancel = self.shutdown.child_token();
        self.active.lock().insert(lineage.clone(), cancel.clone());

        let this = Arc::clone(self);
        let token = cancel.clone();
        let id = lineage.clone();
        let task = tokio::spawn(async move {
            let started = Instant::now();
            let run = AssertUnwindSafe(this.run_origin(id.clone(), origin, &token)).catch_unwind();
            let report = match run.await {
                Ok(report) => report,
                Err(_) => {
                    tracing::error!(lineage = %id, "Lineage task panicked");
                    this.finish(
                        id.clone(),
                        failure(FailureCause::LineagePanicked),
                        LineageProgress::default(),
                        started,
                    )
                }
            };
            this.active.lock().remove(&id);
            report
        });

        LineageHandle {
            id: lineage,
            cancel,
            task,
            sink: Arc::clone(&self.sink),
        }
    }

    async fn run_origin(&self, lineage: LineageId, origin: Origin, cancel: &CancellationToken) -> LineageReport {
        let started = Instant::now();
        let Some(_permit) = self.scheduler.acquire(cancel).await else {
            return self.finish(lineage, failure(FailureCause::Cancelled), LineageProgress::default(), started);
        };

        let initial = match origin {
            Origin::Proposal(p) => p,
            Origin::Goal(goal) => {
                let proposed = tokio::select! {
                    _ = cancel.cancelled() => Err(FailureCause::Cancelled),
                    r = self.planner.propose(&goal) => r.map_err(FailureCause::from),
                };
                match proposed {
                    Ok(p) => p.rehomed(&lineage, 0),
                    Err(cause) => {
                        return self.finish(lineage, failure(cause), LineageProgress::default(), started)
                    }
                }
            }
        };
        self.run_lineage(initial, cancel).await
    }

    /// 取消一条运行中的 lineage；不存在时返回 false
    pub fn cancel(&self, lineage: &LineageId) -> bool {
        match self.active.lock().get(lineage) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_lineages(&self) -> Vec<LineageId> {
        self.active.lock().keys().cloned().collect()
    }

    /// 取消全部 lineage 并停止发放新许可
    pub fn shutdown(&self, reason: ShutdownReason) {
        self.scheduler.close();
        self.shutdown.shutdown(reason);
    }
}

fn failure(cause: FailureCause) -> LineageOutcome {
    LineageOutcome::Failure { cause }
}

/// 一条已启动 lineage 的句柄
pub struct LineageHandle {
    id: LineageId,
    cancel: CancellationToken,
    task: JoinHandle<LineageReport>,
    sink: Arc<dyn EventSink>,
}

impl LineageHandle {
    pub fn id(&self) -> &LineageId {
        &self.id
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// 等待终态报告；任务被运行时中止时补发一份
    pub async fn join(self) -> LineageReport {
        match self.task.await {
            Ok(report) => report,
            Err(e) => {
                let cause = if e.is_panic() {
                    FailureCause::LineagePanicked
                } else {
                    FailureCause::Cancelled
                };
                let report = LineageReport {
                    lineage_id: self.id,
                    outcome: failure(cause),
                    attempts: 0,
                    executor_invocations: 0,
                    refines: 0,
                    retries: 0,
                    elapsed_ms: 0,
                };
                self.sink.emit(CoreEvent::LineageTerminal {
                    report: report.clone(),
                });
                report
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{ExecutorSettings, SafetyPolicy, ScriptedPlanner};
    use crate::core::recovery::BackoffPolicy;
    use crate::core::types::ActionKind;
    use crate::handlers::{HandlerError, HandlerRegistry, OperationHandler};
    use crate::observability::MemorySink;
    use crate::resource::{Ledger, ResourceBroker, ResourceKind};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Flaky {
        calls: AtomicU32,
    }

    #[async_trait]
    impl OperationHandler for Flaky {
        fn kind(&self) -> ActionKind {
            ActionKind::QueryOp
        }

        fn operations(&self) -> Vec<&'static str> {
            vec!["flaky", "ok"]
        }

        async fn run(&self, operation: &str, _params: Value) -> Result<Value, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match operation {
                "ok" => Ok(json!("done")),
                _ => Err(HandlerError::Retryable("busy".into())),
            }
        }
    }

    fn orchestrator(planner: ScriptedPlanner) -> (Arc<Orchestrator>, Arc<MemorySink>, Arc<Flaky>) {
        orchestrator_with_backoff(planner, BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(4)))
    }

    fn orchestrator_with_backoff(
        planner: ScriptedPlanner,
        backoff: BackoffPolicy,
    ) -> (Arc<Orchestrator>, Arc<MemorySink>, Arc<Flaky>) {
        let sink = Arc::new(MemorySink::default());
        let ledger = Ledger::new([(ResourceKind::CpuShare, 4)], Duration::from_secs(60));
        let broker = Arc::new(ResourceBroker::new(ledger, 8, sink.clone()));
        let flaky = Arc::new(Flaky::default());
        let mut handlers = HandlerRegistry::new();
        handlers.register_arc(flaky.clone());
        let planner: Arc<dyn PlanGenerator> = Arc::new(planner);
        let supervisor = Supervisor::new(
            SafetyPolicy::new([], ["format-disk".to_string()], &[]).unwrap(),
            planner.clone(),
            1,
            sink.clone(),
        );
        let executor = Executor::new(broker, handlers, sink.clone(), ExecutorSettings::default());
        let orch = Orchestrator::new(
            supervisor,
            executor,
            planner,
            RecoveryEngine::new(2, backoff),
            TaskScheduler::new(2),
            Arc::new(ShutdownManager::new()),
            sink.clone(),
        );
        (Arc::new(orch), sink, flaky)
    }

    #[tokio::test]
    async fn test_success_single_report() {
        let (orch, sink, _) = orchestrator(ScriptedPlanner::new());
        let p = ActionProposal::new(ActionKind::QueryOp, "ok", json!({}), "");
        let report = orch.spawn(p).join().await;
        assert!(report.is_success());
        assert_eq!(report.executor_invocations, 1);
        assert_eq!(sink.count("lineage_terminal"), 1);
        assert!(orch.active_lineages().is_empty());
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let (orch, sink, flaky) = orchestrator(ScriptedPlanner::new());
        let p = ActionProposal::new(ActionKind::QueryOp, "flaky", json!({}), "");
        let report = orch.spawn(p).join().await;
        assert!(matches!(report.failure_cause(), Some(FailureCause::RetriesExhausted { .. })));
        assert_eq!(report.executor_invocations, 3);
        assert_eq!(report.retries, 2);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        assert_eq!(sink.count("lineage_terminal"), 1);
    }

    #[tokio::test]
    async fn test_submit_planner_failure_reports() {
        let (orch, sink, _) = orchestrator(ScriptedPlanner::new());
        let report = orch.submit("not json").join().await;
        assert!(matches!(report.failure_cause(), Some(FailureCause::PlannerFailed(_))));
        assert_eq!(report.executor_invocations, 0);
        assert_eq!(sink.count("lineage_terminal"), 1);
    }

    #[tokio::test]
    async fn test_submit_goal_runs() {
        let (orch, _, _) = orchestrator(ScriptedPlanner::new());
        let handle = orch.submit(r#"{"kind": "query_op", "operation": "ok"}"#);
        let id = handle.id().clone();
        let report = handle.join().await;
        assert!(report.is_success());
        assert_eq!(report.lineage_id, id);
    }

    #[tokio::test]
    async fn test_safety_rejected_after_refine_limit() {
        let (orch, _, flaky) = orchestrator(ScriptedPlanner::new());
        let p = ActionProposal::new(ActionKind::QueryOp, "format-disk", json!({}), "");
        let report = orch.spawn(p).join().await;
        assert!(matches!(report.failure_cause(), Some(FailureCause::SafetyRejected(r)) if r.is_refine_limit()));
        assert_eq!(report.refines, 1);
        assert_eq!(report.executor_invocations, 0);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_waiting_lineage() {
        let (orch, _, _) = orchestrator(ScriptedPlanner::new());
        orch.shutdown(ShutdownReason::UserInitiated);
        let p = ActionProposal::new(ActionKind::QueryOp, "ok", json!({}), "");
        let report = orch.spawn(p).join().await;
        assert_eq!(report.failure_cause(), Some(&FailureCause::Cancelled));
        assert!(!orch.cancel(&report.lineage_id));
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_skips_sleep() {
        let (orch, sink, flaky) = orchestrator_with_backoff(
            ScriptedPlanner::new(),
            BackoffPolicy::new(Duration::from_secs(60), Duration::from_secs(60)),
        );
        let p = ActionProposal::new(ActionKind::QueryOp, "flaky", json!({}), "");
        let handle = orch.spawn(p);
        for _ in 0..1000 {
            if flaky.calls.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);

        handle.cancel();
        let report = tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .expect("cancel must cut the backoff short");
        assert_eq!(report.failure_cause(), Some(&FailureCause::Cancelled));
        assert_eq!(report.executor_invocations, 1);
        assert_eq!(report.retries, 0);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
        assert_eq!(sink.count("lineage_terminal"), 1);
    }
}
