//! Hive - 多智能体编排与资源代理
//!
//! 模块划分：
//! - **agents**: Supervisor（安全评估与精炼）、Executor（资源申请与执行）、规划器边界、安全策略
//! - **config**: 应用配置加载（TOML + 环境变量）与启动时校验
//! - **core**: 值类型与错误、失败恢复、lineage 调度、关闭管理、主控循环
//! - **handlers**: 内置操作处理器（文件、进程、查询、资源）
//! - **observability**: 日志初始化与结构化事件汇
//! - **resource**: Resource Ledger 与 Resource Broker

pub mod agents;
pub mod config;
pub mod core;
pub mod handlers;
pub mod observability;
pub mod resource;

pub use crate::core::{Orchestrator, OrchestratorBuilder};
