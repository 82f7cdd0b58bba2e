//! 可观测性：tracing 初始化与结构化核心事件
//!
//! 核心只向 EventSink 发出 CoreEvent，不关心落地格式；
//! 默认的 TracingSink 把事件渲染为一行 JSON 审计日志。

use parking_lot::Mutex;
use serde::Serialize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingSection;
use crate::core::error::DenialReason;
use crate::core::types::{ActionKind, ActionStatus, EvaluationVerdict, LineageId, LineageReport, ProposalId};
use crate::resource::{LeaseId, ResourceKind};

/// 初始化日志：RUST_LOG 优先，否则使用配置中的级别
pub fn init(logging: &LoggingSection) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));
    let registry = tracing_subscriber::registry().with(filter);
    if logging.json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// 核心发出的结构化事件
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoreEvent {
    ProposalEvaluated {
        lineage_id: LineageId,
        proposal_id: ProposalId,
        attempt: u32,
        kind: ActionKind,
        operation: String,
        verdict: EvaluationVerdict,
    },
    ResourceGranted {
        requester: String,
        kind: ResourceKind,
        quantity: u64,
        lease: LeaseId,
        /// 是否经过排队
        queued: bool,
    },
    ResourceDenied {
        requester: String,
        kind: ResourceKind,
        quantity: u64,
        reason: DenialReason,
    },
    ResourceReleased {
        lease: LeaseId,
        kind: ResourceKind,
        quantity: u64,
    },
    LeaseExpired {
        lease: LeaseId,
        kind: ResourceKind,
        quantity: u64,
        requester: String,
    },
    ActionResult {
        lineage_id: LineageId,
        proposal_id: ProposalId,
        attempt: u32,
        status: ActionStatus,
        duration_ms: u64,
    },
    LineageTerminal {
        report: LineageReport,
    },
}

impl CoreEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CoreEvent::ProposalEvaluated { .. } => "proposal_evaluated",
            CoreEvent::ResourceGranted { .. } => "resource_granted",
            CoreEvent::ResourceDenied { .. } => "resource_denied",
            CoreEvent::ResourceReleased { .. } => "resource_released",
            CoreEvent::LeaseExpired { .. } => "lease_expired",
            CoreEvent::ActionResult { .. } => "action_result",
            CoreEvent::LineageTerminal { .. } => "lineage_terminal",
        }
    }
}

/// 外部事件汇
pub trait EventSink: Send + Sync {
    fn emit(&self, event: CoreEvent);
}

/// 丢弃所有事件
#[derive(Debug, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: CoreEvent) {}
}

/// 以 JSON 审计行写入 tracing
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: CoreEvent) {
        let audit = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        match &event {
            CoreEvent::ResourceDenied { .. } | CoreEvent::LeaseExpired { .. } => {
                tracing::warn!(audit = %audit, "{}", event.name())
            }
            CoreEvent::LineageTerminal { .. } | CoreEvent::ProposalEvaluated { .. } => {
                tracing::info!(audit = %audit, "{}", event.name())
            }
            _ => tracing::debug!(audit = %audit, "{}", event.name()),
        }
    }
}

/// 内存记录（测试与诊断用）
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<CoreEvent>>,
}

impl MemorySink {
    pub fn events(&self) -> Vec<CoreEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: CoreEvent) {
        self.events.lock().push(event);
    }
}
