//! Orchestrator 构建器：统一的初始化逻辑
//!
//! 从校验后的 RuntimeConfig 组装 Ledger、Broker、handler、Supervisor、Executor 与调度器；
//! 二进制与集成测试共用同一套组装方式。

use std::sync::Arc;

use crate::agents::{Executor, ExecutorSettings, JsonPlanner, PlanGenerator, Supervisor};
use crate::config::RuntimeConfig;
use crate::core::orchestrator::Orchestrator;
use crate::core::recovery::{BackoffPolicy, RecoveryEngine};
use crate::core::shutdown::ShutdownManager;
use crate::core::task_scheduler::TaskScheduler;
use crate::handlers::{self, HandlerRegistry, OperationHandler};
use crate::observability::{EventSink, TracingSink};
use crate::resource::{Ledger, ResourceBroker};

pub struct OrchestratorBuilder {
    config: RuntimeConfig,
    planner: Arc<dyn PlanGenerator>,
    sink: Arc<dyn EventSink>,
    shutdown: Arc<ShutdownManager>,
    extra_handlers: Vec<Arc<dyn OperationHandler>>,
    builtin_handlers: bool,
    spawn_reaper: bool,
}

impl OrchestratorBuilder {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            planner: Arc::new(JsonPlanner),
            sink: Arc::new(TracingSink),
            shutdown: Arc::new(ShutdownManager::new()),
            extra_handlers: Vec::new(),
            builtin_handlers: true,
            spawn_reaper: true,
        }
    }

    pub fn with_planner(mut self, planner: Arc<dyn PlanGenerator>) -> Self {
        self.planner = planner;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_shutdown(mut self, shutdown: Arc<ShutdownManager>) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// 追加（或替换同种类的）handler
    pub fn with_handler(mut self, handler: Arc<dyn OperationHandler>) -> Self {
        self.extra_handlers.push(handler);
        self
    }

    /// 是否注册内置 handler
    pub fn with_builtin_handlers(mut self, enable: bool) -> Self {
        self.builtin_handlers = enable;
        self
    }

    /// 是否启动后台租约回收任务（需在 tokio 运行时内构建）
    pub fn with_reaper(mut self, enable: bool) -> Self {
        self.spawn_reaper = enable;
        self
    }

    pub fn build(self) -> Arc<Orchestrator> {
        let cfg = self.config;
        let ledger = Ledger::new(cfg.capacities.iter().copied(), cfg.lease_ttl);
        let broker = Arc::new(ResourceBroker::new(ledger, cfg.max_queue_depth, Arc::clone(&self.sink)));

        if self.spawn_reaper {
            if let Some(interval) = cfg.reaper_interval {
                broker.spawn_reaper(interval, self.shutdown.token());
            }
        }

        let mut registry = if self.builtin_handlers {
            handlers::default_registry(&cfg.handlers, Arc::clone(&broker))
        } else {
            HandlerRegistry::new()
        };
        for handler in self.extra_handlers {
            registry.register_arc(handler);
        }
        tracing::info!(kinds = ?registry.kinds(), "Operation handlers registered");

        let supervisor = Supervisor::new(
            cfg.policy.clone(),
            Arc::clone(&self.planner),
            cfg.refine_limit,
            Arc::clone(&self.sink),
        );
        let executor = Executor::new(
            broker,
            registry,
            Arc::clone(&self.sink),
            ExecutorSettings::from_runtime(&cfg),
        );
        let recovery = RecoveryEngine::new(cfg.max_retries, BackoffPolicy::new(cfg.backoff_base, cfg.backoff_cap));

        Arc::new(Orchestrator::new(
            supervisor,
            executor,
            self.planner,
            recovery,
            TaskScheduler::new(cfg.max_concurrent_lineages),
            self.shutdown,
            self.sink,
        ))
    }
}
