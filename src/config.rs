//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__RESOURCES__CPU_SHARE=16`）。
//! 所有选项只在启动时读取一次；`AppConfig::validate` 把原始配置校验为 RuntimeConfig，
//! 容量 <= 0、非法上限或非法正则都在这里以 ConfigurationError 失败。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::agents::policy::{SafetyPolicy, DEFAULT_DENIED_OPERATIONS, DEFAULT_DENIED_PATTERNS};
use crate::core::error::ConfigurationError;
use crate::core::types::ActionKind;
use crate::resource::{ResourceDemand, ResourceKind};

/// 重试 / 精炼次数的上限（防止退避指数溢出与无界委托）
pub const MAX_LIMIT: u32 = 32;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub logging: LoggingSection,
    pub resources: ResourcesSection,
    pub supervisor: SupervisorSection,
    pub orchestrator: OrchestratorSection,
    pub executor: ExecutorSection,
    pub handlers: HandlersSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "hive".to_string(),
        }
    }
}

/// [logging] 段：级别（可被 RUST_LOG 覆盖）与是否输出 JSON 行
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// [resources] 段：各资源种类容量（有符号，便于识别负数配置）与租约参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResourcesSection {
    pub cpu_share: i64,
    pub memory_bytes: i64,
    pub disk_bytes: i64,
    pub network_bandwidth: i64,
    /// 租约有效期（秒）
    pub lease_ttl_secs: u64,
    /// 每种资源的最大排队数
    pub max_queue_depth: usize,
    /// 过期租约回收周期（毫秒），0 表示不启动后台回收
    pub reaper_interval_ms: u64,
}

impl Default for ResourcesSection {
    fn default() -> Self {
        Self {
            cpu_share: 100,
            memory_bytes: 8 * 1024 * 1024 * 1024,
            disk_bytes: 10 * 1024 * 1024 * 1024,
            network_bandwidth: 100 * 1024 * 1024,
            lease_ttl_secs: 300,
            max_queue_depth: 64,
            reaper_interval_ms: 1000,
        }
    }
}

impl ResourcesSection {
    fn raw_capacities(&self) -> [(ResourceKind, i64); 4] {
        [
            (ResourceKind::CpuShare, self.cpu_share),
            (ResourceKind::MemoryBytes, self.memory_bytes),
            (ResourceKind::DiskBytes, self.disk_bytes),
            (ResourceKind::NetworkBandwidth, self.network_bandwidth),
        ]
    }
}

/// [supervisor] 段：拒绝名单与精炼上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    pub denied_kinds: Vec<String>,
    pub denied_operations: Vec<String>,
    pub denied_patterns: Vec<String>,
    /// 每条 lineage 最多调用 refine 的次数
    pub refine_limit: u32,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            denied_kinds: Vec::new(),
            denied_operations: DEFAULT_DENIED_OPERATIONS.iter().map(|s| s.to_string()).collect(),
            denied_patterns: DEFAULT_DENIED_PATTERNS.iter().map(|s| s.to_string()).collect(),
            refine_limit: 2,
        }
    }
}

/// [orchestrator] 段：重试、退避、并发 lineage 数、默认资源截止时间
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub max_concurrent_lineages: usize,
    /// 资源申请默认截止时间（毫秒），0 表示无限等待
    pub default_deadline_ms: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 100,
            backoff_cap_ms: 5_000,
            max_concurrent_lineages: 5,
            default_deadline_ms: 30_000,
        }
    }
}

/// [executor] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    /// 单次 handler 调用超时（秒）
    pub handler_timeout_secs: u64,
    /// 动作历史保留条数
    pub history_size: usize,
    /// 未显式声明 resources 时各动作种类的默认资源需求：`[executor.default_demands.process_op] cpu_share = 1`
    pub default_demands: HashMap<String, HashMap<String, u64>>,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        let mut default_demands = HashMap::new();
        default_demands.insert(
            "process_op".to_string(),
            HashMap::from([("cpu_share".to_string(), 1)]),
        );
        default_demands.insert(
            "file_op".to_string(),
            HashMap::from([("disk_bytes".to_string(), 1024 * 1024)]),
        );
        Self {
            handler_timeout_secs: 30,
            history_size: 1000,
            default_demands,
        }
    }
}

/// [handlers] 段：内置 handler 的参数
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct HandlersSection {
    pub file: FileHandlerSection,
    pub process: ProcessHandlerSection,
    pub thresholds: ThresholdsSection,
}

/// [handlers.file] 段：允许目录（为空则不限制）、禁止目录、文件大小上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FileHandlerSection {
    pub allowed_paths: Vec<PathBuf>,
    /// 未设置时使用系统目录默认值
    pub restricted_paths: Option<Vec<PathBuf>>,
    pub max_file_size_mb: u64,
}

impl Default for FileHandlerSection {
    fn default() -> Self {
        Self {
            allowed_paths: Vec::new(),
            restricted_paths: None,
            max_file_size_mb: 100,
        }
    }
}

/// [handlers.process] 段：允许执行的命令名（仅首词）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessHandlerSection {
    pub allowed_commands: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ProcessHandlerSection {
    fn default() -> Self {
        Self {
            allowed_commands: ["ls", "cat", "echo", "grep", "head", "tail", "wc", "find", "ps", "df", "uname"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            timeout_secs: 30,
        }
    }
}

/// [handlers.thresholds] 段：资源占用告警阈值（百分比）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThresholdsSection {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub network_percent: f64,
}

impl Default for ThresholdsSection {
    fn default() -> Self {
        Self {
            cpu_percent: 80.0,
            memory_percent: 75.0,
            disk_percent: 90.0,
            network_percent: 90.0,
        }
    }
}

impl ThresholdsSection {
    pub fn for_kind(&self, kind: ResourceKind) -> f64 {
        match kind {
            ResourceKind::CpuShare => self.cpu_percent,
            ResourceKind::MemoryBytes => self.memory_percent,
            ResourceKind::DiskBytes => self.disk_percent,
            ResourceKind::NetworkBandwidth => self.network_percent,
        }
    }
}

/// 校验后的运行时配置
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub capacities: Vec<(ResourceKind, u64)>,
    pub lease_ttl: Duration,
    pub max_queue_depth: usize,
    pub reaper_interval: Option<Duration>,
    pub policy: SafetyPolicy,
    pub refine_limit: u32,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub max_concurrent_lineages: usize,
    pub default_deadline: Option<Duration>,
    pub handler_timeout: Duration,
    pub history_size: usize,
    pub default_demands: HashMap<ActionKind, Vec<ResourceDemand>>,
    pub handlers: HandlersSection,
    pub logging: LoggingSection,
}

fn check_limit(name: &'static str, value: u64, ok: bool, reason: &'static str) -> Result<(), ConfigurationError> {
    if ok {
        Ok(())
    } else {
        Err(ConfigurationError::InvalidLimit { name, value, reason })
    }
}

impl AppConfig {
    /// 从 TOML 字符串解析（测试与嵌入场景）
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigurationError> {
        let c = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?;
        Ok(c.try_deserialize()?)
    }

    /// 启动时一次性校验
    pub fn validate(&self) -> Result<RuntimeConfig, ConfigurationError> {
        let mut capacities = Vec::with_capacity(4);
        for (kind, value) in self.resources.raw_capacities() {
            if value <= 0 {
                return Err(ConfigurationError::InvalidCapacity { kind, value });
            }
            capacities.push((kind, value as u64));
        }

        let r = &self.resources;
        check_limit("resources.lease_ttl_secs", r.lease_ttl_secs, r.lease_ttl_secs > 0, "must be > 0")?;
        check_limit(
            "resources.max_queue_depth",
            r.max_queue_depth as u64,
            r.max_queue_depth > 0,
            "must be > 0",
        )?;

        let s = &self.supervisor;
        check_limit(
            "supervisor.refine_limit",
            s.refine_limit as u64,
            s.refine_limit <= MAX_LIMIT,
            "must be <= 32",
        )?;
        let denied_kinds = s
            .denied_kinds
            .iter()
            .map(|k| ActionKind::parse(k).ok_or_else(|| ConfigurationError::UnknownActionKind(k.clone())))
            .collect::<Result<Vec<_>, _>>()?;
        let policy = SafetyPolicy::new(denied_kinds, s.denied_operations.clone(), &s.denied_patterns)?;

        let o = &self.orchestrator;
        check_limit(
            "orchestrator.max_retries",
            o.max_retries as u64,
            o.max_retries <= MAX_LIMIT,
            "must be <= 32",
        )?;
        check_limit("orchestrator.backoff_base_ms", o.backoff_base_ms, o.backoff_base_ms > 0, "must be > 0")?;
        check_limit(
            "orchestrator.backoff_cap_ms",
            o.backoff_cap_ms,
            o.backoff_cap_ms >= o.backoff_base_ms,
            "must be >= backoff_base_ms",
        )?;
        check_limit(
            "orchestrator.max_concurrent_lineages",
            o.max_concurrent_lineages as u64,
            o.max_concurrent_lineages > 0,
            "must be > 0",
        )?;

        let e = &self.executor;
        check_limit(
            "executor.handler_timeout_secs",
            e.handler_timeout_secs,
            e.handler_timeout_secs > 0,
            "must be > 0",
        )?;
        let mut default_demands = HashMap::new();
        for (kind_name, demands) in &e.default_demands {
            let kind = ActionKind::parse(kind_name)
                .ok_or_else(|| ConfigurationError::UnknownActionKind(kind_name.clone()))?;
            let mut parsed = demands
                .iter()
                .filter(|(_, quantity)| **quantity > 0)
                .map(|(res, quantity)| {
                    ResourceKind::parse(res)
                        .map(|kind| ResourceDemand { kind, quantity: *quantity })
                        .ok_or_else(|| ConfigurationError::UnknownResourceKind(res.clone()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            parsed.sort_by_key(|d| d.kind);
            default_demands.insert(kind, parsed);
        }

        Ok(RuntimeConfig {
            capacities,
            lease_ttl: Duration::from_secs(r.lease_ttl_secs),
            max_queue_depth: r.max_queue_depth,
            reaper_interval: (r.reaper_interval_ms > 0).then(|| Duration::from_millis(r.reaper_interval_ms)),
            policy,
            refine_limit: s.refine_limit,
            max_retries: o.max_retries,
            backoff_base: Duration::from_millis(o.backoff_base_ms),
            backoff_cap: Duration::from_millis(o.backoff_cap_ms),
            max_concurrent_lineages: o.max_concurrent_lineages,
            default_deadline: (o.default_deadline_ms > 0).then(|| Duration::from_millis(o.default_deadline_ms)),
            handler_timeout: Duration::from_secs(e.handler_timeout_secs),
            history_size: e.history_size,
            default_demands,
            handlers: self.handlers.clone(),
            logging: self.logging.clone(),
        })
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, ConfigurationError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "Config file not found, ignoring");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    Ok(c.try_deserialize()?)
}
