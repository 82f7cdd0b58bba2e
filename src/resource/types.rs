//! 资源仲裁的数据类型：资源种类、请求、授予（租约）

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// 受约束的资源种类；声明顺序即多资源申请时的加锁顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    CpuShare,
    MemoryBytes,
    DiskBytes,
    NetworkBandwidth,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::CpuShare,
        ResourceKind::MemoryBytes,
        ResourceKind::DiskBytes,
        ResourceKind::NetworkBandwidth,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::CpuShare => "cpu_share",
            ResourceKind::MemoryBytes => "memory_bytes",
            ResourceKind::DiskBytes => "disk_bytes",
            ResourceKind::NetworkBandwidth => "network_bandwidth",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "cpu_share" | "cpu" => Some(ResourceKind::CpuShare),
            "memory_bytes" | "memory" => Some(ResourceKind::MemoryBytes),
            "disk_bytes" | "disk" => Some(ResourceKind::DiskBytes),
            "network_bandwidth" | "network" => Some(ResourceKind::NetworkBandwidth),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 租约 ID，由 Ledger 单调分配
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LeaseId(pub u64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lease-{}", self.0)
    }
}

/// Executor 发往 Broker 的资源申请
#[derive(Debug, Clone)]
pub struct ResourceRequest {
    pub kind: ResourceKind,
    pub quantity: u64,
    /// 申请方标识（通常是 proposal id）
    pub requester: String,
    /// 排队等待的截止时间；None 表示无限等待（由编排循环的重试上限兜底）
    pub deadline: Option<Instant>,
}

impl ResourceRequest {
    pub fn new(kind: ResourceKind, quantity: u64, requester: impl Into<String>) -> Self {
        Self {
            kind,
            quantity,
            requester: requester.into(),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }
}

/// 资源授予：申请方独占持有，直到显式释放或过期。
/// Ledger 只记录其数量，不持有该对象本身。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceGrant {
    pub lease: LeaseId,
    pub kind: ResourceKind,
    pub quantity: u64,
    pub expires_at: Instant,
}

/// 一项资源需求（从 proposal 参数或默认配置解析）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDemand {
    pub kind: ResourceKind,
    pub quantity: u64,
}

/// 某资源种类的占用快照
#[derive(Debug, Clone, Serialize)]
pub struct KindUsage {
    pub kind: ResourceKind,
    pub capacity: u64,
    pub committed: u64,
    pub active_leases: usize,
    pub queued: usize,
    /// 排队请求数量之和，仅供参考，从不预留
    pub queued_quantity: u64,
}

impl KindUsage {
    pub fn utilisation_percent(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.committed as f64 * 100.0 / self.capacity as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parse_aliases() {
        assert_eq!(ResourceKind::parse("cpu"), Some(ResourceKind::CpuShare));
        assert_eq!(ResourceKind::parse("CPU-share"), Some(ResourceKind::CpuShare));
        assert_eq!(ResourceKind::parse("network_bandwidth"), Some(ResourceKind::NetworkBandwidth));
        assert_eq!(ResourceKind::parse("gpu"), None);
    }

    #[test]
    fn test_kind_order_is_declaration_order() {
        let mut kinds = vec![ResourceKind::NetworkBandwidth, ResourceKind::CpuShare, ResourceKind::DiskBytes];
        kinds.sort();
        assert_eq!(
            kinds,
            vec![ResourceKind::CpuShare, ResourceKind::DiskBytes, ResourceKind::NetworkBandwidth]
        );
    }
}
