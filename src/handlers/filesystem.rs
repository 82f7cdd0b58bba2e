//! 文件操作 handler（file_op）
//!
//! 所有路径先解析为绝对路径（`..` 按词法折叠，已存在的祖先目录做 canonicalize），
//! 再检查禁止目录与允许目录；文件大小受 `max_file_size_mb` 限制。
//! 校验失败与文件不存在为 Fatal，I/O 中断或超时为 Retryable。

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::FileHandlerSection;
use crate::core::types::ActionKind;
use crate::handlers::registry::{bool_param, str_param, HandlerError, OperationHandler};

/// 未配置时的禁止目录
pub const DEFAULT_RESTRICTED_PATHS: &[&str] = &["/bin", "/sbin", "/usr/bin", "/usr/sbin", "/etc", "/sys", "/proc"];

const OPERATIONS: &[&str] = &["read_file", "write_file", "delete_file", "list_directory", "get_file_info"];

#[derive(Debug, Clone)]
pub struct FileOpHandler {
    allowed: Vec<PathBuf>,
    restricted: Vec<PathBuf>,
    max_file_size_bytes: u64,
}

impl FileOpHandler {
    pub fn new(cfg: &FileHandlerSection) -> Self {
        let restricted = match &cfg.restricted_paths {
            Some(paths) => paths.clone(),
            None => DEFAULT_RESTRICTED_PATHS.iter().map(PathBuf::from).collect(),
        };
        let resolve_all = |paths: Vec<PathBuf>| -> Vec<PathBuf> {
            paths
                .into_iter()
                .map(|p| resolve(&p).unwrap_or(p))
                .collect()
        };
        let handler = Self {
            allowed: resolve_all(cfg.allowed_paths.clone()),
            restricted: resolve_all(restricted),
            max_file_size_bytes: cfg.max_file_size_mb.saturating_mul(1024 * 1024),
        };
        tracing::info!(
            allowed = handler.allowed.len(),
            restricted = handler.restricted.len(),
            "File handler initialized"
        );
        handler
    }

    /// 校验路径：先禁止目录，再允许目录（为空则不限制）
    pub fn validate(&self, raw: &str) -> Result<PathBuf, HandlerError> {
        let path = resolve(Path::new(raw))?;
        if let Some(restricted) = self.restricted.iter().find(|r| path.starts_with(r)) {
            return Err(HandlerError::Fatal(format!(
                "Path is in restricted directory: {}",
                restricted.display()
            )));
        }
        if !self.allowed.is_empty() && !self.allowed.iter().any(|a| path.starts_with(a)) {
            return Err(HandlerError::Fatal(format!(
                "Path is not in allowed directories: {}",
                path.display()
            )));
        }
        Ok(path)
    }

    fn check_size(&self, size: u64, what: &str) -> Result<(), HandlerError> {
        if size > self.max_file_size_bytes {
            return Err(HandlerError::Fatal(format!(
                "{what} too large: {:.2} MB (max: {} MB)",
                size as f64 / 1024.0 / 1024.0,
                self.max_file_size_bytes / 1024 / 1024
            )));
        }
        Ok(())
    }

    async fn read_file(&self, params: &Value) -> Result<Value, HandlerError> {
        let path = self.validate(path_param(params, "file_path")?)?;
        let meta = metadata(&path, "File").await?;
        if !meta.is_file() {
            return Err(HandlerError::Fatal(format!("Path is not a file: {}", path.display())));
        }
        self.check_size(meta.len(), "File")?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| io_error("Error reading file", e))?;
        tracing::info!(path = %path.display(), bytes = meta.len(), "Read file");
        Ok(json!({
            "path": path,
            "content": content,
            "size_bytes": meta.len(),
        }))
    }

    async fn write_file(&self, params: &Value) -> Result<Value, HandlerError> {
        let path = self.validate(path_param(params, "file_path")?)?;
        let content = params
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HandlerError::InvalidParameters("missing string 'content'".into()))?;
        let overwrite = bool_param(params, "overwrite", false);
        let create_dirs = bool_param(params, "create_dirs", true);

        let existed = tokio::fs::try_exists(&path)
            .await
            .map_err(|e| io_error("Error checking file", e))?;
        if existed && !overwrite {
            return Err(HandlerError::Fatal(format!(
                "File already exists and overwrite=false: {}",
                path.display()
            )));
        }
        self.check_size(content.len() as u64, "Content")?;
        if create_dirs {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| io_error("Error creating directories", e))?;
            }
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| io_error("Error writing file", e))?;
        tracing::info!(path = %path.display(), bytes = content.len(), overwritten = existed, "Wrote file");
        Ok(json!({
            "path": path,
            "size_bytes": content.len(),
            "overwritten": existed,
        }))
    }

    async fn delete_file(&self, params: &Value) -> Result<Value, HandlerError> {
        if !bool_param(params, "confirm", true) {
            return Err(HandlerError::InvalidParameters(
                "Delete operation requires confirmation".into(),
            ));
        }
        let path = self.validate(path_param(params, "file_path")?)?;
        let meta = metadata(&path, "File").await?;
        if !meta.is_file() {
            return Err(HandlerError::Fatal(format!("Path is not a file: {}", path.display())));
        }
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| io_error("Error deleting file", e))?;
        tracing::info!(path = %path.display(), "Deleted file");
        Ok(json!({ "path": path, "size_bytes": meta.len() }))
    }

    async fn list_directory(&self, params: &Value) -> Result<Value, HandlerError> {
        let dir = self.validate(path_param(params, "dir_path")?)?;
        let pattern = params.get("pattern").and_then(|v| v.as_str()).unwrap_or("*");
        let meta = metadata(&dir, "Directory").await?;
        if !meta.is_dir() {
            return Err(HandlerError::Fatal(format!("Path is not a directory: {}", dir.display())));
        }

        // 目录部分按字面匹配，只有 pattern 参与通配
        let full = format!("{}/{}", glob::Pattern::escape(&dir.to_string_lossy()), pattern);
        let paths = glob::glob(&full)
            .map_err(|e| HandlerError::InvalidParameters(format!("Invalid pattern '{pattern}': {e}")))?;

        let mut files = Vec::new();
        for entry in paths {
            let item = entry.map_err(|e| io_error("Error listing directory", e.into_error()))?;
            let Ok(meta) = std::fs::metadata(&item) else {
                continue;
            };
            files.push(json!({
                "name": item.file_name().map(|n| n.to_string_lossy().to_string()),
                "path": item,
                "is_file": meta.is_file(),
                "is_dir": meta.is_dir(),
                "size_bytes": if meta.is_file() { Some(meta.len()) } else { None },
                "modified": timestamp(meta.modified()),
            }));
        }
        tracing::info!(path = %dir.display(), count = files.len(), "Listed directory");
        Ok(json!({
            "path": dir,
            "count": files.len(),
            "pattern": pattern,
            "files": files,
        }))
    }

    async fn get_file_info(&self, params: &Value) -> Result<Value, HandlerError> {
        let path = self.validate(path_param(params, "file_path")?)?;
        let meta = metadata(&path, "Path").await?;
        Ok(json!({
            "name": path.file_name().map(|n| n.to_string_lossy().to_string()),
            "path": path,
            "is_file": meta.is_file(),
            "is_dir": meta.is_dir(),
            "size_bytes": meta.len(),
            "created": timestamp(meta.created()),
            "modified": timestamp(meta.modified()),
            "accessed": timestamp(meta.accessed()),
            "readonly": meta.permissions().readonly(),
        }))
    }
}

#[async_trait]
impl OperationHandler for FileOpHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::FileOp
    }

    fn operations(&self) -> Vec<&'static str> {
        OPERATIONS.to_vec()
    }

    async fn run(&self, operation: &str, params: Value) -> Result<Value, HandlerError> {
        match operation {
            "read_file" => self.read_file(&params).await,
            "write_file" => self.write_file(&params).await,
            "delete_file" => self.delete_file(&params).await,
            "list_directory" => self.list_directory(&params).await,
            "get_file_info" => self.get_file_info(&params).await,
            other => Err(HandlerError::UnsupportedOperation(other.to_string())),
        }
    }
}

/// `file_path` / `dir_path`，兼容通用的 `path`
fn path_param<'a>(params: &'a Value, key: &str) -> Result<&'a str, HandlerError> {
    str_param(params, key).or_else(|_| str_param(params, "path"))
}

/// 绝对化 + 词法折叠 `..`，再对最长的已存在前缀做 canonicalize（目标可以尚不存在）
fn resolve(path: &Path) -> Result<PathBuf, HandlerError> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| io_error("Cannot determine working directory", e))?
            .join(path)
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }

    let mut existing = normalized.as_path();
    let mut tail = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            let mut out = canonical;
            out.extend(tail.iter().rev());
            return Ok(out);
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent;
            }
            _ => return Ok(normalized),
        }
    }
}

async fn metadata(path: &Path, what: &str) -> Result<std::fs::Metadata, HandlerError> {
    tokio::fs::metadata(path).await.map_err(|e| match e.kind() {
        ErrorKind::NotFound => HandlerError::Fatal(format!("{what} does not exist: {}", path.display())),
        _ => io_error("Error reading metadata", e),
    })
}

fn io_error(context: &str, e: std::io::Error) -> HandlerError {
    match e.kind() {
        ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock => {
            HandlerError::Retryable(format!("{context}: {e}"))
        }
        _ => HandlerError::Fatal(format!("{context}: {e}")),
    }
}

fn timestamp(t: std::io::Result<SystemTime>) -> Value {
    match t {
        Ok(t) => Value::String(chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339()),
        Err(_) => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler_in(dir: &Path) -> FileOpHandler {
        FileOpHandler::new(&FileHandlerSection {
            allowed_paths: vec![dir.to_path_buf()],
            restricted_paths: None,
            max_file_size_mb: 1,
        })
    }

    #[tokio::test]
    async fn test_write_read_delete() {
        let dir = tempfile::tempdir().unwrap();
        let fs = handler_in(dir.path());
        let file = dir.path().join("nested/a.txt");
        let file = file.to_string_lossy();

        let written = fs
            .run("write_file", json!({"file_path": file, "content": "hello"}))
            .await
            .unwrap();
        assert_eq!(written["size_bytes"], 5);
        assert_eq!(written["overwritten"], false);

        let err = fs
            .run("write_file", json!({"file_path": file, "content": "again"}))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Fatal(_)));

        let read = fs.run("read_file", json!({"file_path": file})).await.unwrap();
        assert_eq!(read["content"], "hello");

        fs.run("delete_file", json!({"file_path": file})).await.unwrap();
        let err = fs.run("read_file", json!({"file_path": file})).await.unwrap_err();
        assert!(matches!(err, HandlerError::Fatal(msg) if msg.contains("does not exist")));
    }

    #[tokio::test]
    async fn test_path_outside_allowed_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let fs = handler_in(dir.path());
        let escape = format!("{}/../../outside.txt", dir.path().display());
        let err = fs.run("read_file", json!({"file_path": escape})).await.unwrap_err();
        assert!(matches!(err, HandlerError::Fatal(msg) if msg.contains("not in allowed")));
    }

    #[tokio::test]
    async fn test_restricted_directory_rejected() {
        let fs = FileOpHandler::new(&FileHandlerSection::default());
        let err = fs.run("read_file", json!({"file_path": "/etc/passwd"})).await.unwrap_err();
        assert!(matches!(err, HandlerError::Fatal(msg) if msg.contains("restricted")));
    }

    #[tokio::test]
    async fn test_list_directory_with_pattern() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.log"), "1").unwrap();
        std::fs::write(dir.path().join("b.log"), "22").unwrap();
        std::fs::write(dir.path().join("c.txt"), "333").unwrap();
        let fs = handler_in(dir.path());

        let listed = fs
            .run("list_directory", json!({"dir_path": dir.path(), "pattern": "*.log"}))
            .await
            .unwrap();
        assert_eq!(listed["count"], 2);
        let names: Vec<_> = listed["files"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a.log", "b.log"]);
    }

    #[tokio::test]
    async fn test_size_limit_and_unknown_operation() {
        let dir = tempfile::tempdir().unwrap();
        let fs = handler_in(dir.path());
        let big = "x".repeat(1024 * 1024 + 1);
        let file = dir.path().join("big.txt");
        let err = fs
            .run("write_file", json!({"file_path": file, "content": big}))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Fatal(msg) if msg.contains("too large")));

        let err = fs.run("truncate", json!({})).await.unwrap_err();
        assert_eq!(err, HandlerError::UnsupportedOperation("truncate".into()));
    }

    #[tokio::test]
    async fn test_delete_requires_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let fs = handler_in(dir.path());
        let err = fs
            .run("delete_file", json!({"file_path": dir.path().join("x"), "confirm": false}))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::InvalidParameters(_)));
    }
}
