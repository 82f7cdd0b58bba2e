//! 主机指标采集：CPU、内存、磁盘、网络与进程
//!
//! 基于 sysinfo；`System` 由 query_op 与 process_op 两个 handler 共享，
//! 每次采集在 blocking 线程中刷新所需部分。

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::{Disks, Networks, Pid, Process, System, MINIMUM_CPU_UPDATE_INTERVAL};

use crate::handlers::registry::HandlerError;

const MB: f64 = 1024.0 * 1024.0;
const GB: f64 = MB * 1024.0;

#[derive(Debug, Clone, Serialize)]
pub struct CpuInfo {
    pub logical_cores: usize,
    pub brand: String,
    pub frequency_mhz: u64,
    pub cpu_percent: f32,
    pub per_cpu_percent: Vec<f32>,
    pub architecture: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryInfo {
    pub total_mb: f64,
    pub available_mb: f64,
    pub used_mb: f64,
    pub percent: f64,
    pub swap_total_mb: f64,
    pub swap_used_mb: f64,
    pub swap_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskInfo {
    pub name: String,
    pub mount_point: String,
    pub removable: bool,
    pub total_gb: f64,
    pub used_gb: f64,
    pub free_gb: f64,
    pub percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct InterfaceInfo {
    pub name: String,
    pub bytes_recv_mb: f64,
    pub bytes_sent_mb: f64,
    pub packets_recv: u64,
    pub packets_sent: u64,
    pub errors_in: u64,
    pub errors_out: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkInfo {
    pub bytes_recv_mb: f64,
    pub bytes_sent_mb: f64,
    pub packets_recv: u64,
    pub packets_sent: u64,
    pub errors_in: u64,
    pub errors_out: u64,
    pub interfaces: Vec<InterfaceInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessSummary {
    pub pid: u32,
    pub parent_pid: Option<u32>,
    pub name: String,
    pub status: String,
    pub cpu_percent: f32,
    pub memory_mb: f64,
    /// 秒级 Unix 时间戳
    pub start_time: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessDetail {
    #[serde(flatten)]
    pub summary: ProcessSummary,
    pub run_time_secs: u64,
    pub cmdline: String,
}

/// 阈值检查用的主机占用率快照
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HostMetrics {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSort {
    Cpu,
    Memory,
}

impl ProcessSort {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "cpu" => Some(ProcessSort::Cpu),
            "memory" | "mem" => Some(ProcessSort::Memory),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct HostMonitor {
    system: Arc<Mutex<System>>,
}

impl Default for HostMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HostMonitor {
    pub fn new() -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
        }
    }

    /// 在 blocking 线程中持锁刷新并读取
    async fn with_system<T, F>(&self, f: F) -> Result<T, HandlerError>
    where
        T: Send + 'static,
        F: FnOnce(&mut System) -> T + Send + 'static,
    {
        let system = Arc::clone(&self.system);
        tokio::task::spawn_blocking(move || f(&mut system.lock()))
            .await
            .map_err(|e| HandlerError::Retryable(format!("Host sampling interrupted: {e}")))
    }

    /// CPU 使用率需要间隔两次刷新
    async fn sample_cpu(&self) -> Result<(), HandlerError> {
        self.with_system(|sys| sys.refresh_cpu()).await?;
        tokio::time::sleep(MINIMUM_CPU_UPDATE_INTERVAL).await;
        self.with_system(|sys| sys.refresh_cpu()).await
    }

    pub async fn cpu_info(&self) -> Result<CpuInfo, HandlerError> {
        self.sample_cpu().await?;
        self.with_system(|sys| {
            let cpus = sys.cpus();
            CpuInfo {
                logical_cores: cpus.len(),
                brand: cpus.first().map(|c| c.brand().trim().to_string()).unwrap_or_default(),
                frequency_mhz: cpus.first().map(|c| c.frequency()).unwrap_or(0),
                cpu_percent: sys.global_cpu_info().cpu_usage(),
                per_cpu_percent: cpus.iter().map(|c| c.cpu_usage()).collect(),
                architecture: std::env::consts::ARCH,
            }
        })
        .await
    }

    pub async fn memory_info(&self) -> Result<MemoryInfo, HandlerError> {
        self.with_system(|sys| {
            sys.refresh_memory();
            let total = sys.total_memory();
            let used = sys.used_memory();
            let swap_total = sys.total_swap();
            let swap_used = sys.used_swap();
            MemoryInfo {
                total_mb: total as f64 / MB,
                available_mb: sys.available_memory() as f64 / MB,
                used_mb: used as f64 / MB,
                percent: percent(used, total),
                swap_total_mb: swap_total as f64 / MB,
                swap_used_mb: swap_used as f64 / MB,
                swap_percent: percent(swap_used, swap_total),
            }
        })
        .await
    }

    /// 全部挂载点
    pub async fn disks(&self) -> Result<Vec<DiskInfo>, HandlerError> {
        tokio::task::spawn_blocking(|| {
            let disks = Disks::new_with_refreshed_list();
            disks.list().iter().map(disk_info).collect::<Vec<_>>()
        })
        .await
        .map_err(|e| HandlerError::Retryable(format!("Disk sampling interrupted: {e}")))
    }

    /// 包含 `path` 的挂载点（最长前缀匹配）
    pub async fn disk_for(&self, path: &str) -> Result<DiskInfo, HandlerError> {
        let target = Path::new(path);
        self.disks()
            .await?
            .into_iter()
            .filter(|d| target.starts_with(&d.mount_point))
            .max_by_key(|d| d.mount_point.len())
            .ok_or_else(|| HandlerError::Fatal(format!("No mounted disk contains {path}")))
    }

    pub async fn network_info(&self) -> Result<NetworkInfo, HandlerError> {
        tokio::task::spawn_blocking(|| {
            let networks = Networks::new_with_refreshed_list();
            let mut interfaces: Vec<InterfaceInfo> = networks
                .list()
                .iter()
                .map(|(name, data)| InterfaceInfo {
                    name: name.clone(),
                    bytes_recv_mb: data.total_received() as f64 / MB,
                    bytes_sent_mb: data.total_transmitted() as f64 / MB,
                    packets_recv: data.total_packets_received(),
                    packets_sent: data.total_packets_transmitted(),
                    errors_in: data.total_errors_on_received(),
                    errors_out: data.total_errors_on_transmitted(),
                })
                .collect();
            interfaces.sort_by(|a, b| a.name.cmp(&b.name));
            NetworkInfo {
                bytes_recv_mb: interfaces.iter().map(|i| i.bytes_recv_mb).sum(),
                bytes_sent_mb: interfaces.iter().map(|i| i.bytes_sent_mb).sum(),
                packets_recv: interfaces.iter().map(|i| i.packets_recv).sum(),
                packets_sent: interfaces.iter().map(|i| i.packets_sent).sum(),
                errors_in: interfaces.iter().map(|i| i.errors_in).sum(),
                errors_out: interfaces.iter().map(|i| i.errors_out).sum(),
                interfaces,
            }
        })
        .await
        .map_err(|e| HandlerError::Retryable(format!("Network sampling interrupted: {e}")))
    }

    /// 按名称过滤（忽略大小写）的进程列表，按 pid 排序
    pub async fn processes(&self, name_filter: Option<String>) -> Result<Vec<ProcessSummary>, HandlerError> {
        let filter = name_filter.map(|f| f.to_lowercase());
        self.with_system(move |sys| {
            sys.refresh_processes();
            let mut list: Vec<ProcessSummary> = sys
                .processes()
                .values()
                .filter(|p| {
                    filter
                        .as_deref()
                        .map_or(true, |f| p.name().to_lowercase().contains(f))
                })
                .map(summary)
                .collect();
            list.sort_by_key(|p| p.pid);
            list
        })
        .await
    }

    pub async fn top_processes(&self, limit: usize, sort: ProcessSort) -> Result<Vec<ProcessSummary>, HandlerError> {
        // 进程 CPU 占用同样需要两次刷新
        self.with_system(|sys| sys.refresh_processes()).await?;
        tokio::time::sleep(MINIMUM_CPU_UPDATE_INTERVAL).await;
        let mut list = self.processes(None).await?;
        match sort {
            ProcessSort::Cpu => list.sort_by(|a, b| b.cpu_percent.total_cmp(&a.cpu_percent)),
            ProcessSort::Memory => list.sort_by(|a, b| b.memory_mb.total_cmp(&a.memory_mb)),
        }
        list.truncate(limit);
        Ok(list)
    }

    pub async fn process_info(&self, pid: u32) -> Result<ProcessDetail, HandlerError> {
        self.with_system(move |sys| {
            let pid = Pid::from_u32(pid);
            if !sys.refresh_process(pid) {
                return None;
            }
            sys.process(pid).map(|p| ProcessDetail {
                summary: summary(p),
                run_time_secs: p.run_time(),
                cmdline: p.cmd().join(" "),
            })
        })
        .await?
        .ok_or_else(|| HandlerError::Fatal(format!("Process {pid} not found")))
    }

    /// 阈值检查用：CPU 全局占用、内存占用、根分区占用
    pub async fn metrics(&self) -> Result<HostMetrics, HandlerError> {
        self.sample_cpu().await?;
        let (cpu_percent, memory_percent) = self
            .with_system(|sys| {
                sys.refresh_memory();
                (
                    sys.global_cpu_info().cpu_usage() as f64,
                    percent(sys.used_memory(), sys.total_memory()),
                )
            })
            .await?;
        let root = if cfg!(target_os = "windows") { "C:\\" } else { "/" };
        let disk_percent = self.disk_for(root).await.map(|d| d.percent).unwrap_or(0.0);
        Ok(HostMetrics {
            cpu_percent,
            memory_percent,
            disk_percent,
        })
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    used as f64 * 100.0 / total as f64
}

fn disk_info(disk: &sysinfo::Disk) -> DiskInfo {
    let total = disk.total_space();
    let free = disk.available_space();
    let used = total.saturating_sub(free);
    DiskInfo {
        name: disk.name().to_string_lossy().to_string(),
        mount_point: disk.mount_point().to_string_lossy().to_string(),
        removable: disk.is_removable(),
        total_gb: total as f64 / GB,
        used_gb: used as f64 / GB,
        free_gb: free as f64 / GB,
        percent: percent(used, total),
    }
}

fn summary(p: &Process) -> ProcessSummary {
    ProcessSummary {
        pid: p.pid().as_u32(),
        parent_pid: p.parent().map(|pid| pid.as_u32()),
        name: p.name().to_string(),
        status: p.status().to_string(),
        cpu_percent: p.cpu_usage(),
        memory_mb: p.memory() as f64 / MB,
        start_time: p.start_time(),
    }
}
