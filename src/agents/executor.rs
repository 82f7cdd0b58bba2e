//! Executor（Child 角色）：申请资源、调用 handler、归还租约
//!
//! 资源型动作先按 ResourceKind 顺序逐项向 Broker 申请；任一项被拒则归还已得租约，
//! 不调用 handler，返回 RetryableFailure(ResourceUnavailable)。
//! handler 在独立任务中运行并受超时约束；无论成功、失败、超时、panic 还是取消，
//! LeaseGuard 都会在返回前归还全部租约。handler 给出的 Retryable / Fatal 分类原样保留。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RuntimeConfig;
use crate::core::error::{DenialReason, FailureCause};
use crate::core::types::{ActionKind, ActionProposal, ActionResult, ActionStatus};
use crate::handlers::{Capability, HandlerError, HandlerRegistry};
use crate::observability::{CoreEvent, EventSink};
use crate::resource::{LeaseGuard, ResourceBroker, ResourceDemand, ResourceRequest};

/// Executor 的可调参数
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub handler_timeout: Duration,
    /// 资源请求的默认截止时间；None 表示无限等待
    pub default_deadline: Option<Duration>,
    /// 未在 `params.resources` 中声明时使用的默认需求
    pub default_demands: HashMap<ActionKind, Vec<ResourceDemand>>,
    pub history_size: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            handler_timeout: Duration::from_secs(30),
            default_deadline: Some(Duration::from_secs(30)),
            default_demands: HashMap::new(),
            history_size: 1000,
        }
    }
}

impl ExecutorSettings {
    pub fn from_runtime(cfg: &RuntimeConfig) -> Self {
        Self {
            handler_timeout: cfg.handler_timeout,
            default_deadline: cfg.default_deadline,
            default_demands: cfg.default_demands.clone(),
            history_size: cfg.history_size,
        }
    }
}

pub struct Executor {
    broker: Arc<ResourceBroker>,
    handlers: HandlerRegistry,
    sink: Arc<dyn EventSink>,
    settings: ExecutorSettings,
    history: Mutex<VecDeque<ActionResult>>,
}

impl Executor {
    pub fn new(
        broker: Arc<ResourceBroker>,
        handlers: HandlerRegistry,
        sink: Arc<dyn EventSink>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            broker,
            handlers,
            sink,
            settings,
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn broker(&self) -> &Arc<ResourceBroker> {
        &self.broker
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        self.handlers.capabilities()
    }

    /// 最近 `limit` 条结果，按时间先后
    pub fn history(&self, limit: usize) -> Vec<ActionResult> {
        let history = self.history.lock();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    /// 执行一个已批准的 proposal；返回时其所有租约均已归还
    pub async fn execute(&self, proposal: &ActionProposal, cancel: &CancellationToken) -> ActionResult {
        let started = std::time::Instant::now();
        let mut guard = LeaseGuard::new(Arc::clone(&self.broker));
        let (status, payload) = self.run_guarded(proposal, &mut guard, cancel).await;
        let leases = guard.release_all();

        let result = ActionResult {
            proposal_id: proposal.id().clone(),
            lineage_id: proposal.lineage().clone(),
            status,
            payload,
            attempt: proposal.attempt(),
            leases,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        tracing::info!(
            lineage = %result.lineage_id,
            attempt = result.attempt,
            kind = %proposal.kind(),
            operation = %proposal.operation(),
            status = result.status.label(),
            leases = result.leases.len(),
            duration_ms = result.duration_ms,
            "Action finished"
        );
        self.sink.emit(CoreEvent::ActionResult {
            lineage_id: result.lineage_id.clone(),
            proposal_id: result.proposal_id.clone(),
            attempt: result.attempt,
            status: result.status.clone(),
            duration_ms: result.duration_ms,
        });
        self.record(result.clone());
        result
    }

    async fn run_guarded(
        &self,
        proposal: &ActionProposal,
        guard: &mut LeaseGuard,
        cancel: &CancellationToken,
    ) -> (ActionStatus, Value) {
        let Some(handler) = self.handlers.get(proposal.kind()) else {
            return fatal(FailureCause::NoHandler(proposal.kind()));
        };

        let demands = match self.demands_for(proposal) {
            Ok(d) => d,
            Err(cause) => return fatal(cause),
        };
        // 被拒时已得的租约由调用方统一归还
        if let Err(reason) = self.acquire(proposal, &demands, guard, cancel).await {
            return match reason {
                DenialReason::Cancelled => fatal(FailureCause::Cancelled),
                other => (
                    ActionStatus::RetryableFailure(FailureCause::ResourceUnavailable(other)),
                    Value::Null,
                ),
            };
        }

        let operation = proposal.operation().to_string();
        let params = proposal.params().clone();
        let mut task = tokio::spawn(async move { handler.run(&operation, params).await });

        tokio::select! {
            _ = cancel.cancelled() => {
                task.abort();
                fatal(FailureCause::Cancelled)
            }
            joined = tokio::time::timeout(self.settings.handler_timeout, &mut task) => match joined {
                Err(_) => {
                    task.abort();
                    tracing::warn!(
                        lineage = %proposal.lineage(),
                        operation = %proposal.operation(),
                        timeout = ?self.settings.handler_timeout,
                        "Handler timed out"
                    );
                    (ActionStatus::RetryableFailure(FailureCause::HandlerTimeout), Value::Null)
                }
                Ok(Ok(Ok(payload))) => (ActionStatus::Success, payload),
                Ok(Ok(Err(e))) => (classify(e), Value::Null),
                Ok(Err(join_err)) if join_err.is_panic() => {
                    tracing::error!(
                        lineage = %proposal.lineage(),
                        operation = %proposal.operation(),
                        "Handler panicked"
                    );
                    fatal(FailureCause::HandlerPanicked)
                }
                Ok(Err(_)) => fatal(FailureCause::Cancelled),
            }
        }
    }

    /// 显式声明优先，否则取该种类的默认需求；非资源型动作不申请
    fn demands_for(&self, proposal: &ActionProposal) -> Result<Vec<ResourceDemand>, FailureCause> {
        if !proposal.kind().is_resource_bearing() {
            return Ok(Vec::new());
        }
        if proposal.params().get("resources").is_some() {
            return proposal.resource_demands();
        }
        let mut demands = self
            .settings
            .default_demands
            .get(&proposal.kind())
            .cloned()
            .unwrap_or_default();
        demands.retain(|d| d.quantity > 0);
        demands.sort_by_key(|d| d.kind);
        Ok(demands)
    }

    async fn acquire(
        &self,
        proposal: &ActionProposal,
        demands: &[ResourceDemand],
        guard: &mut LeaseGuard,
        cancel: &CancellationToken,
    ) -> Result<(), DenialReason> {
        if demands.is_empty() {
            return Ok(());
        }
        let deadline = proposal
            .params()
            .get("deadline_ms")
            .and_then(|v| v.as_u64())
            .map(Duration::from_millis)
            .or(self.settings.default_deadline)
            .map(|d| Instant::now() + d);
        let requester = format!("{}#{}", proposal.lineage(), proposal.attempt());

        for demand in demands {
            let mut request = ResourceRequest::new(demand.kind, demand.quantity, requester.clone());
            if let Some(deadline) = deadline {
                request = request.with_deadline(deadline);
            }
            let grant = self.broker.request(request, cancel).await?;
            guard.push(grant);
        }
        Ok(())
    }

    fn record(&self, result: ActionResult) {
        let cap = self.settings.history_size;
        if cap == 0 {
            return;
        }
        let mut history = self.history.lock();
        history.push_back(result);
        if history.len() > cap {
            let excess = history.len() - cap / 2;
            history.drain(..excess);
        }
    }
}

fn fatal(cause: FailureCause) -> (ActionStatus, Value) {
    (ActionStatus::FatalFailure(cause), Value::Null)
}

fn classify(e: HandlerError) -> ActionStatus {
    match e {
        HandlerError::Retryable(msg) => ActionStatus::RetryableFailure(FailureCause::Operation(msg)),
        HandlerError::Fatal(msg) => ActionStatus::FatalFailure(FailureCause::Operation(msg)),
        HandlerError::InvalidParameters(msg) => {
            ActionStatus::FatalFailure(FailureCause::InvalidParameters(msg))
        }
        HandlerError::UnsupportedOperation(op) => ActionStatus::FatalFailure(
            FailureCause::InvalidParameters(format!("unsupported operation '{op}'")),
        ),
    }
}
