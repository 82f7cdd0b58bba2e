//! 任务调度：限制同时运行的 lineage 数
//!
//! 每条 lineage 运行前取得一个 Semaphore 许可；等待许可可被取消。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

pub struct TaskScheduler {
    semaphore: Arc<Semaphore>,
}

impl TaskScheduler {
    pub fn new(max_concurrent_lineages: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent_lineages.max(1))),
        }
    }

    /// 获取 lineage 许可；取消或调度器已关闭时返回 None
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            _ = cancel.cancelled() => None,
            permit = Arc::clone(&self.semaphore).acquire_owned() => permit.ok(),
        }
    }

    /// 不再发放新许可
    pub fn close(&self) {
        self.semaphore.close();
    }
}
