//! 查询 handler（query_op）：不占用资源，读取 Broker 账本与主机指标

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::ThresholdsSection;
use crate::core::types::ActionKind;
use crate::handlers::host::{HostMonitor, ProcessSort};
use crate::handlers::registry::{str_param, HandlerError, OperationHandler};
use crate::resource::{ResourceBroker, ResourceKind};

const OPERATIONS: &[&str] = &[
    "resource_usage",
    "check_resource_thresholds",
    "system_info",
    "get_cpu_info",
    "get_memory_info",
    "get_disk_info",
    "get_network_info",
    "get_top_processes",
];

const DEFAULT_TOP_PROCESSES: usize = 10;

pub struct QueryOpHandler {
    broker: Arc<ResourceBroker>,
    host: HostMonitor,
    thresholds: ThresholdsSection,
}

impl QueryOpHandler {
    pub fn new(broker: Arc<ResourceBroker>, host: HostMonitor, thresholds: ThresholdsSection) -> Self {
        Self {
            broker,
            host,
            thresholds,
        }
    }

    fn resource_usage(&self) -> Value {
        let usage: Vec<Value> = self
            .broker
            .snapshot()
            .into_iter()
            .map(|u| {
                let percent = u.utilisation_percent();
                let mut v = serde_json::to_value(&u).unwrap_or(Value::Null);
                v["utilisation_percent"] = json!(percent);
                v
            })
            .collect();
        json!({ "kinds": usage, "broker": self.broker.stats() })
    }

    fn threshold(&self, params: &Value, kind: ResourceKind) -> f64 {
        params
            .get(threshold_key(kind))
            .and_then(|v| v.as_f64())
            .unwrap_or_else(|| self.thresholds.for_kind(kind))
    }

    /// 主机实际占用（CPU / 内存 / 根分区）与 Broker 预留占用分别对照阈值；
    /// 参数 `{"cpu_percent": 50}` 等可覆盖配置阈值
    async fn check_thresholds(&self, params: &Value) -> Result<Value, HandlerError> {
        let mut alerts = Vec::new();
        let mut check = |scope: &str, label: &str, percent: f64, threshold: f64| {
            let ok = percent <= threshold;
            if !ok {
                alerts.push(format!("{scope} {label} usage high: {percent:.1}% (threshold: {threshold}%)"));
            }
            json!({ "ok": ok, "percent": percent, "threshold": threshold })
        };

        let metrics = self.host.metrics().await?;
        let host = json!({
            "cpu": check("host", "cpu", metrics.cpu_percent, self.threshold(params, ResourceKind::CpuShare)),
            "memory": check("host", "memory", metrics.memory_percent, self.threshold(params, ResourceKind::MemoryBytes)),
            "disk": check("host", "disk", metrics.disk_percent, self.threshold(params, ResourceKind::DiskBytes)),
        });

        let mut reservations = serde_json::Map::new();
        for usage in self.broker.snapshot() {
            if usage.capacity == 0 {
                continue;
            }
            let threshold = self.threshold(params, usage.kind);
            reservations.insert(
                usage.kind.as_str().to_string(),
                check("reserved", usage.kind.as_str(), usage.utilisation_percent(), threshold),
            );
        }

        if alerts.is_empty() {
            tracing::debug!("All resources within thresholds");
        } else {
            tracing::warn!(alerts = %alerts.join(", "), "Resource threshold alerts");
        }
        Ok(json!({
            "all_ok": alerts.is_empty(),
            "alerts": alerts,
            "host": host,
            "reservations": reservations,
        }))
    }

    fn system_info(&self) -> Value {
        json!({
            "system": sysinfo::System::name(),
            "os_version": sysinfo::System::os_version(),
            "kernel_version": sysinfo::System::kernel_version(),
            "host_name": sysinfo::System::host_name(),
            "arch": std::env::consts::ARCH,
            "boot_time": sysinfo::System::boot_time(),
            "uptime_seconds": sysinfo::System::uptime(),
            "pid": std::process::id(),
            "version": env!("CARGO_PKG_VERSION"),
        })
    }

    async fn disk_info(&self, params: &Value) -> Result<Value, HandlerError> {
        match params.get("path") {
            Some(_) => {
                let path = str_param(params, "path")?;
                Ok(json!(self.host.disk_for(path).await?))
            }
            None => {
                let disks = self.host.disks().await?;
                Ok(json!({ "count": disks.len(), "disks": disks }))
            }
        }
    }

    async fn top_processes(&self, params: &Value) -> Result<Value, HandlerError> {
        let limit = params
            .get("limit")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_TOP_PROCESSES);
        let sort = match params.get("sort_by").and_then(|v| v.as_str()) {
            None => ProcessSort::Cpu,
            Some(s) => ProcessSort::parse(s)
                .ok_or_else(|| HandlerError::InvalidParameters(format!("unknown sort_by '{s}'")))?,
        };
        let processes = self.host.top_processes(limit, sort).await?;
        Ok(json!({ "count": processes.len(), "processes": processes }))
    }
}

fn threshold_key(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::CpuShare => "cpu_percent",
        ResourceKind::MemoryBytes => "memory_percent",
        ResourceKind::DiskBytes => "disk_percent",
        ResourceKind::NetworkBandwidth => "network_percent",
    }
}

#[async_trait]
impl OperationHandler for QueryOpHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::QueryOp
    }

    fn operations(&self) -> Vec<&'static str> {
        OPERATIONS.to_vec()
    }

    async fn run(&self, operation: &str, params: Value) -> Result<Value, HandlerError> {
        match operation {
            "resource_usage" => Ok(self.resource_usage()),
            "check_resource_thresholds" => self.check_thresholds(&params).await,
            "system_info" => Ok(self.system_info()),
            "get_cpu_info" => Ok(json!(self.host.cpu_info().await?)),
            "get_memory_info" => Ok(json!(self.host.memory_info().await?)),
            "get_disk_info" => self.disk_info(&params).await,
            "get_network_info" => Ok(json!(self.host.network_info().await?)),
            "get_top_processes" => self.top_processes(&params).await,
            other => Err(HandlerError::UnsupportedOperation(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::NoopSink;
    use crate::resource::{Ledger, ResourceRequest};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn broker() -> Arc<ResourceBroker> {
        let ledger = Ledger::new([(ResourceKind::CpuShare, 10)], Duration::from_secs(60));
        Arc::new(ResourceBroker::new(ledger, 8, Arc::new(NoopSink)))
    }

    fn handler(broker: Arc<ResourceBroker>) -> QueryOpHandler {
        QueryOpHandler::new(broker, HostMonitor::new(), ThresholdsSection::default())
    }

    #[tokio::test]
    async fn test_reservation_threshold_alert_when_committed_high() {
        let broker = broker();
        let handler = handler(broker.clone());
        let before = handler.run("check_resource_thresholds", json!({})).await.unwrap();
        assert_eq!(before["reservations"]["cpu_share"]["ok"], true);

        broker
            .request(ResourceRequest::new(ResourceKind::CpuShare, 9, "test"), &CancellationToken::new())
            .await
            .unwrap();
        let high = handler.run("check_resource_thresholds", json!({})).await.unwrap();
        assert_eq!(high["all_ok"], false);
        assert_eq!(high["reservations"]["cpu_share"]["ok"], false);
        assert!(high["alerts"]
            .as_array()
            .unwrap()
            .iter()
            .any(|a| a.as_str().unwrap().starts_with("reserved cpu_share")));
    }

    #[tokio::test]
    async fn test_host_thresholds_use_real_metrics() {
        let handler = handler(broker());
        let relaxed = json!({"cpu_percent": 100.0, "memory_percent": 100.0, "disk_percent": 100.0});
        let out = handler.run("check_resource_thresholds", relaxed).await.unwrap();
        assert_eq!(out["all_ok"], true);
        for key in ["cpu", "memory", "disk"] {
            assert_eq!(out["host"][key]["threshold"], 100.0);
            assert!(out["host"][key]["percent"].as_f64().unwrap() >= 0.0);
        }

        let strict = json!({"memory_percent": 0.0});
        let out = handler.run("check_resource_thresholds", strict).await.unwrap();
        assert_eq!(out["host"]["memory"]["ok"], false);
        assert_eq!(out["all_ok"], false);
    }

    #[tokio::test]
    async fn test_resource_usage_reports_every_kind() {
        let usage = handler(broker()).run("resource_usage", Value::Null).await.unwrap();
        assert_eq!(usage["kinds"].as_array().unwrap().len(), ResourceKind::ALL.len());
        assert_eq!(usage["kinds"][0]["capacity"], 10);
    }

    #[tokio::test]
    async fn test_host_queries() {
        let handler = handler(broker());
        let info = handler.run("system_info", Value::Null).await.unwrap();
        assert_eq!(info["arch"], std::env::consts::ARCH);

        let cpu = handler.run("get_cpu_info", Value::Null).await.unwrap();
        assert!(cpu["logical_cores"].as_u64().unwrap() >= 1);

        let mem = handler.run("get_memory_info", Value::Null).await.unwrap();
        assert!(mem["total_mb"].as_f64().unwrap() > 0.0);

        let net = handler.run("get_network_info", Value::Null).await.unwrap();
        assert!(net["interfaces"].is_array());

        let top = handler
            .run("get_top_processes", json!({"limit": 3, "sort_by": "memory"}))
            .await
            .unwrap();
        let processes = top["processes"].as_array().unwrap();
        assert!(processes.len() <= 3);
        assert!(processes
            .windows(2)
            .all(|w| w[0]["memory_mb"].as_f64() >= w[1]["memory_mb"].as_f64()));

        let err = handler
            .run("get_top_processes", json!({"sort_by": "io"}))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::InvalidParameters(_)));
    }
}
