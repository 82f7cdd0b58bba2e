//! 内置操作处理器：file / process / query / resource；window_op 无内置实现
//!
//! process 与 query 共享同一个 HostMonitor。

pub mod filesystem;
pub mod host;
pub mod process;
pub mod query;
pub mod registry;
pub mod resource;

use std::sync::Arc;

pub use filesystem::FileOpHandler;
pub use host::HostMonitor;
pub use process::ProcessOpHandler;
pub use query::QueryOpHandler;
pub use registry::{Capability, HandlerError, HandlerRegistry, OperationHandler};
pub use resource::ResourceOpHandler;

use crate::config::HandlersSection;
use crate::resource::ResourceBroker;

/// 注册全部内置 handler
pub fn default_registry(cfg: &HandlersSection, broker: Arc<ResourceBroker>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(FileOpHandler::new(&cfg.file));
    let host = HostMonitor::new();
    registry.register(ProcessOpHandler::new(&cfg.process, host.clone()));
    registry.register(QueryOpHandler::new(broker, host, cfg.thresholds.clone()));
    registry.register(ResourceOpHandler);
    registry
}
