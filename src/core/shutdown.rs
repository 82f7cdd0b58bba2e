//! 优雅关闭
//!
//! 根 CancellationToken 由 ShutdownManager 持有，每条 lineage 使用它的子 token；
//! Ctrl+C / SIGTERM 触发后所有 lineage 被取消，但每条仍会给出自己的终态报告。

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_token: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 任务全部完成
    Completed,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            shutdown_token: CancellationToken::new(),
        }
    }

    /// 根 token
    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// 根 token 的子 token：随关闭一起取消，也可以单独取消
    pub fn child_token(&self) -> CancellationToken {
        self.shutdown_token.child_token()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        if self.is_shutdown() {
            return;
        }
        tracing::info!(reason = ?reason, "Shutting down");
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, cancelling all lineages...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, cancelling all lineages...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_token_follows_root() {
        let manager = ShutdownManager::new();
        let child = manager.child_token();
        let sibling = manager.child_token();
        sibling.cancel();
        assert!(!child.is_cancelled());
        assert!(!manager.is_shutdown());

        manager.shutdown(ShutdownReason::UserInitiated);
        assert!(child.is_cancelled());
        assert!(manager.token().is_cancelled());
    }

    #[test]
    fn test_repeated_shutdown_is_noop() {
        let manager = ShutdownManager::new();
        let child = manager.child_token();
        manager.shutdown(ShutdownReason::Signal);
        manager.shutdown(ShutdownReason::UserInitiated);
        assert!(manager.is_shutdown());
        assert!(child.is_cancelled());
        assert!(manager.child_token().is_cancelled());
    }
}
