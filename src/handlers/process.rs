//! 进程操作 handler（process_op）：白名单命令、启动与关闭应用、查看主机进程
//!
//! 仅允许配置中的命令名（首词）；run_command 通过 sh -c / cmd /C 执行，带超时。
//! 非零退出为 Fatal，超时为 Retryable。launch_app 启动的子进程按名称跟踪，供 close_app 关闭。

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::process::{Child, Command};

use crate::config::ProcessHandlerSection;
use crate::core::types::ActionKind;
use crate::handlers::host::HostMonitor;
use crate::handlers::registry::{bool_param, str_param, HandlerError, OperationHandler};

const OPERATIONS: &[&str] = &[
    "run_command",
    "launch_app",
    "close_app",
    "list_launched",
    "list_processes",
    "get_process_info",
];

pub struct ProcessOpHandler {
    allowed_commands: HashSet<String>,
    timeout: Duration,
    launched: Mutex<HashMap<String, Child>>,
    host: HostMonitor,
}

impl ProcessOpHandler {
    pub fn new(cfg: &ProcessHandlerSection, host: HostMonitor) -> Self {
        Self {
            allowed_commands: cfg.allowed_commands.iter().map(|s| s.to_lowercase()).collect(),
            timeout: Duration::from_secs(cfg.timeout_secs.max(1)),
            launched: Mutex::new(HashMap::new()),
            host,
        }
    }

    /// 只看首词
    fn check_allowed(&self, raw: &str) -> Result<(), HandlerError> {
        let name = raw.split_whitespace().next().unwrap_or("").to_lowercase();
        if name.is_empty() {
            return Err(HandlerError::InvalidParameters("Empty command".into()));
        }
        let base = Path::new(&name)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or(name);
        if self.allowed_commands.contains(&base) {
            Ok(())
        } else {
            Err(HandlerError::Fatal(format!("Command '{base}' not in allowlist")))
        }
    }

    async fn run_command(&self, params: &Value) -> Result<Value, HandlerError> {
        let command = str_param(params, "command")?.trim();
        self.check_allowed(command)?;
        tracing::info!(command = %command, "run_command");

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        // Executor 中止任务时一并结束子进程
        cmd.kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| HandlerError::Retryable(format!("Command timed out after {:?}", self.timeout)))?
            .map_err(|e| HandlerError::Fatal(format!("Execution failed: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            return Err(HandlerError::Fatal(format!(
                "Exit {:?}: {}",
                output.status.code(),
                stderr.trim()
            )));
        }
        Ok(json!({
            "command": command,
            "exit_code": output.status.code(),
            "stdout": stdout,
            "stderr": stderr,
        }))
    }

    async fn launch_app(&self, params: &Value) -> Result<Value, HandlerError> {
        let app_path = str_param(params, "app_path")?;
        self.check_allowed(app_path)?;
        let args: Vec<String> = match params.get("args") {
            None | Some(Value::Null) => Vec::new(),
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| HandlerError::InvalidParameters(format!("'args' must be a string array: {e}")))?,
        };
        let app_name = Path::new(app_path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| app_path.to_string());

        let mut cmd = Command::new(app_path);
        cmd.args(&args);

        if bool_param(params, "wait", false) {
            cmd.kill_on_drop(true);
            let output = tokio::time::timeout(self.timeout, cmd.output())
                .await
                .map_err(|_| HandlerError::Retryable(format!("Application launch timed out after {:?}", self.timeout)))?
                .map_err(|e| spawn_error(app_path, e))?;
            if !output.status.success() {
                return Err(HandlerError::Fatal(format!(
                    "{app_name} exited with {:?}: {}",
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            return Ok(json!({
                "app_name": app_name,
                "exit_code": output.status.code(),
                "stdout": String::from_utf8_lossy(&output.stdout),
            }));
        }

        let child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| spawn_error(app_path, e))?;
        let pid = child.id();
        let replaced = self.launched.lock().insert(app_name.clone(), child);
        if replaced.is_some() {
            tracing::warn!(app = %app_name, "Previously launched instance is no longer tracked");
        }
        tracing::info!(app = %app_name, pid = ?pid, "Application launched");
        Ok(json!({
            "app_name": app_name,
            "pid": pid,
            "command": std::iter::once(app_path.to_string()).chain(args).collect::<Vec<_>>().join(" "),
        }))
    }

    async fn close_app(&self, params: &Value) -> Result<Value, HandlerError> {
        let app_name = str_param(params, "app_name")?;
        let child = self.launched.lock().remove(app_name);
        let Some(mut child) = child else {
            return Err(HandlerError::Fatal(format!("No launched application named '{app_name}'")));
        };
        let pid = child.id();
        match child.try_wait() {
            Ok(Some(status)) => {
                return Ok(json!({"app_name": app_name, "pid": pid, "already_exited": true, "exit_code": status.code()}));
            }
            Ok(None) => {}
            Err(e) => return Err(HandlerError::Fatal(format!("Cannot query {app_name}: {e}"))),
        }
        child
            .kill()
            .await
            .map_err(|e| HandlerError::Fatal(format!("Failed to close {app_name}: {e}")))?;
        tracing::info!(app = %app_name, pid = ?pid, "Application closed");
        Ok(json!({"app_name": app_name, "pid": pid, "already_exited": false}))
    }

    fn list_launched(&self) -> Value {
        let launched = self.launched.lock();
        let mut apps: Vec<_> = launched
            .iter()
            .map(|(name, child)| json!({"app_name": name, "pid": child.id()}))
            .collect();
        apps.sort_by(|a, b| a["app_name"].as_str().cmp(&b["app_name"].as_str()));
        json!({ "count": apps.len(), "apps": apps })
    }

    /// 主机进程列表；`filter_name` 按名称子串过滤（忽略大小写）
    async fn list_processes(&self, params: &Value) -> Result<Value, HandlerError> {
        let filter = params
            .get("filter_name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string);
        let processes = self.host.processes(filter.clone()).await?;
        Ok(json!({ "count": processes.len(), "filter": filter, "processes": processes }))
    }

    async fn get_process_info(&self, params: &Value) -> Result<Value, HandlerError> {
        let pid = params
            .get("pid")
            .and_then(|v| v.as_u64())
            .and_then(|p| u32::try_from(p).ok())
            .ok_or_else(|| HandlerError::InvalidParameters("missing integer 'pid'".into()))?;
        Ok(json!(self.host.process_info(pid).await?))
    }
}

fn spawn_error(app: &str, e: std::io::Error) -> HandlerError {
    if e.kind() == std::io::ErrorKind::NotFound {
        HandlerError::Fatal(format!("Application not found: {app}"))
    } else {
        HandlerError::Fatal(format!("Error launching {app}: {e}"))
    }
}

#[async_trait]
impl OperationHandler for ProcessOpHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::ProcessOp
    }

    fn operations(&self) -> Vec<&'static str> {
        OPERATIONS.to_vec()
    }

    async fn run(&self, operation: &str, params: Value) -> Result<Value, HandlerError> {
        match operation {
            "run_command" => self.run_command(&params).await,
            "launch_app" => self.launch_app(&params).await,
            "close_app" => self.close_app(&params).await,
            "list_launched" => Ok(self.list_launched()),
            "list_processes" => self.list_processes(&params).await,
            "get_process_info" => self.get_process_info(&params).await,
            other => Err(HandlerError::UnsupportedOperation(other.to_string())),
        }
    }
}
