//! 安全策略：确定性的拒绝名单
//!
//! 三类规则按顺序检查：动作种类 → 操作名 → 参数中字符串值的正则匹配。
//! 命中任意一条即拒绝，与 attempt 数无关。

use std::collections::HashSet;

use regex::Regex;
use serde_json::Value;

use crate::core::error::{ConfigurationError, RejectReason};
use crate::core::types::{ActionKind, ActionProposal};

/// 默认禁止的操作名
pub const DEFAULT_DENIED_OPERATIONS: &[&str] = &["delete-system-root", "format-disk"];

/// 默认禁止的参数模式（危险命令片段）
pub const DEFAULT_DENIED_PATTERNS: &[&str] = &[
    r"rm\s+-(rf|fr|r)\b",
    r"\bwget\s",
    r"curl[^|]*\|\s*(ba)?sh",
    r"chmod\s+(777|\+s)",
    r"\bmkfs",
    r"\bdd\s+if=",
    r">\s*/dev/sd",
    r":\(\)\s*\{\s*:\|:&\s*\};:", // fork bomb
];

#[derive(Debug, Clone)]
pub struct SafetyPolicy {
    denied_kinds: HashSet<ActionKind>,
    denied_operations: HashSet<String>,
    denied_patterns: Vec<Regex>,
}

impl SafetyPolicy {
    /// 从配置构造；正则编译失败为配置错误
    pub fn new(
        denied_kinds: impl IntoIterator<Item = ActionKind>,
        denied_operations: impl IntoIterator<Item = String>,
        denied_patterns: &[String],
    ) -> Result<Self, ConfigurationError> {
        let denied_patterns = denied_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|source| ConfigurationError::InvalidPattern {
                    pattern: p.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            denied_kinds: denied_kinds.into_iter().collect(),
            denied_operations: denied_operations
                .into_iter()
                .map(|op| normalize_operation(&op))
                .collect(),
            denied_patterns,
        })
    }

    /// 不拒绝任何动作
    pub fn permissive() -> Self {
        Self {
            denied_kinds: HashSet::new(),
            denied_operations: HashSet::new(),
            denied_patterns: Vec::new(),
        }
    }

    /// 检查一个 proposal；命中拒绝名单时返回原因
    pub fn check(&self, proposal: &ActionProposal) -> Result<(), RejectReason> {
        if self.denied_kinds.contains(&proposal.kind()) {
            return Err(RejectReason::DeniedKind {
                kind: proposal.kind(),
            });
        }
        if self
            .denied_operations
            .contains(&normalize_operation(proposal.operation()))
        {
            return Err(RejectReason::DeniedOperation {
                operation: proposal.operation().to_string(),
            });
        }
        let mut strings = Vec::new();
        collect_strings(proposal.params(), &mut strings);
        for re in &self.denied_patterns {
            if strings.iter().any(|s| re.is_match(s)) {
                return Err(RejectReason::DeniedPattern {
                    pattern: re.as_str().to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn denied_kinds(&self) -> impl Iterator<Item = &ActionKind> {
        self.denied_kinds.iter()
    }
}

/// 操作名比较忽略大小写，`-` 与 `_` 视为相同
fn normalize_operation(op: &str) -> String {
    op.trim().to_lowercase().replace('_', "-")
}

fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}
