//! Hive 命令行入口
//!
//! `hive [tasks.json]`：加载并校验配置，读取任务草稿数组，并发运行全部 lineage，
//! 每条 lineage 的终态报告以一行 JSON 输出到 stdout。Ctrl+C / SIGTERM 取消全部 lineage。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use hive::agents::TaskDraft;
use hive::config::load_config;
use hive::core::{ShutdownManager, ShutdownReason};
use hive::observability;
use hive::OrchestratorBuilder;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let tasks_path = std::env::args().nth(1).map(PathBuf::from);
    let config_path = std::env::var("HIVE_CONFIG").ok().map(PathBuf::from);

    let app_config = load_config(config_path).context("Failed to load configuration")?;
    observability::init(&app_config.logging);
    let runtime = app_config.validate().context("Invalid configuration")?;

    let drafts: Vec<TaskDraft> = match tasks_path {
        Some(ref path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))?
        }
        None => {
            tracing::info!("No task file given, nothing to run");
            Vec::new()
        }
    };

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let orchestrator = OrchestratorBuilder::new(runtime)
        .with_shutdown(Arc::clone(&shutdown))
        .build();
    tracing::info!(
        app = %app_config.app.name,
        tasks = drafts.len(),
        capabilities = %serde_json::to_string(&orchestrator.executor().capabilities()).unwrap_or_default(),
        "Hive started"
    );

    let handles: Vec<_> = drafts
        .into_iter()
        .map(|draft| orchestrator.spawn(draft.into_proposal()))
        .collect();

    let mut succeeded = 0usize;
    let total = handles.len();
    for handle in handles {
        let report = handle.join().await;
        if report.is_success() {
            succeeded += 1;
        }
        println!("{}", serde_json::to_string(&report).context("Failed to encode report")?);
    }

    tracing::info!(
        succeeded,
        failed = total - succeeded,
        stats = ?orchestrator.executor().broker().stats(),
        "All lineages finished"
    );
    orchestrator.shutdown(ShutdownReason::Completed);
    Ok(())
}
