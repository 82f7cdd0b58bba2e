//! Resource Broker：立即授予、按种类 FIFO 排队或拒绝
//!
//! 所有 reserve / release / 队列变更都在同一把锁内完成，不会基于过期的容量快照做判断。
//! 公平性：严格 FIFO。队列非空时新请求一律排到队尾，即使它更小、当前就能满足；
//! 队首满足不了时后面的请求也不会被越过。
//! 释放与过期只按腾出的数量出队：一次释放不会连带授予它没有腾出的容量，
//! 未用完的部分留给下一次出队；该种类已无租约时队首直接授予。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::error::{DenialReason, LedgerError};
use crate::observability::{CoreEvent, EventSink};
use crate::resource::{KindUsage, LeaseId, Ledger, ResourceGrant, ResourceKind, ResourceRequest};

/// 排队中的请求
struct Waiter {
    ticket: u64,
    quantity: u64,
    requester: String,
    tx: oneshot::Sender<ResourceGrant>,
}

/// 一次出队可用的额度
#[derive(Debug, Clone, Copy)]
enum Budget {
    /// 释放或过期腾出的数量（连同此前未用完的部分）：队首需求不超过它才授予
    Freed(u64),
    /// 队首离开（取消、超时、调用方离开）：授予所有依次放得下的队首
    HeadChanged,
}

/// Broker 累计计数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub granted: u64,
    pub granted_after_queue: u64,
    pub released: u64,
    pub expired: u64,
    pub denied_deadline: u64,
    pub denied_capacity: u64,
    pub denied_cancelled: u64,
    pub lease_not_found: u64,
}

impl BrokerStats {
    fn count_denial(&mut self, reason: DenialReason) {
        match reason {
            DenialReason::DeadlineExceeded => self.denied_deadline += 1,
            DenialReason::CapacityUnavailable => self.denied_capacity += 1,
            DenialReason::Cancelled => self.denied_cancelled += 1,
        }
    }
}

struct BrokerState {
    ledger: Ledger,
    queues: HashMap<ResourceKind, VecDeque<Waiter>>,
    /// 队列非空期间已释放但尚未授予出去的数量
    freed: HashMap<ResourceKind, u64>,
    next_ticket: u64,
    stats: BrokerStats,
}

impl BrokerState {
    fn queue(&mut self, kind: ResourceKind) -> &mut VecDeque<Waiter> {
        self.queues.entry(kind).or_default()
    }

    fn queue_len(&self, kind: ResourceKind) -> usize {
        self.queues.get(&kind).map(|q| q.len()).unwrap_or(0)
    }

    /// 移除仍在排队的 ticket；返回 false 表示已被出队授予
    fn withdraw(&mut self, kind: ResourceKind, ticket: u64) -> bool {
        let queue = self.queue(kind);
        match queue.iter().position(|w| w.ticket == ticket) {
            Some(idx) => {
                queue.remove(idx);
                true
            }
            None => false,
        }
    }

    /// 清除调用方已离开的排队项；返回是否有移除
    fn prune_closed(&mut self, kind: ResourceKind) -> bool {
        let queue = self.queue(kind);
        let before = queue.len();
        queue.retain(|w| !w.tx.is_closed());
        queue.len() != before
    }

    /// 按到达顺序授予队首；队首满足不了即停止
    fn drain(&mut self, kind: ResourceKind, budget: Budget, events: &mut Vec<CoreEvent>) {
        let budget = match budget {
            Budget::Freed(quantity) => {
                Budget::Freed(self.freed.get(&kind).copied().unwrap_or(0).saturating_add(quantity))
            }
            Budget::HeadChanged => Budget::HeadChanged,
        };
        let mut granted_total = 0u64;
        loop {
            let head = self
                .queues
                .get(&kind)
                .and_then(|q| q.front())
                .map(|h| (h.tx.is_closed(), h.quantity));
            let quantity = match head {
                None => break,
                Some((true, _)) => {
                    // 调用方已离开
                    self.queue(kind).pop_front();
                    continue;
                }
                Some((false, quantity)) => quantity,
            };
            if !self.ledger.fits(kind, quantity) {
                break;
            }
            // 已无租约可释放时，不再等待后续释放事件
            if let Budget::Freed(total) = budget {
                if granted_total + quantity > total && self.ledger.committed(kind) > 0 {
                    break;
                }
            }
            let Some(waiter) = self.queue(kind).pop_front() else {
                break;
            };
            let grant = match self.ledger.reserve(kind, waiter.quantity, &waiter.requester) {
                Ok(grant) => grant,
                Err(_) => {
                    self.queue(kind).push_front(waiter);
                    break;
                }
            };
            let lease = grant.lease;
            match waiter.tx.send(grant) {
                Ok(()) => {
                    self.stats.granted += 1;
                    self.stats.granted_after_queue += 1;
                    granted_total += waiter.quantity;
                    events.push(CoreEvent::ResourceGranted {
                        requester: waiter.requester,
                        kind,
                        quantity: waiter.quantity,
                        lease,
                        queued: true,
                    });
                }
                Err(grant) => {
                    // 接收端恰好关闭：回滚这次预留
                    let _ = self.ledger.release(grant.lease);
                }
            }
        }
        if self.queue_len(kind) == 0 {
            self.freed.remove(&kind);
            return;
        }
        let credit = match budget {
            Budget::Freed(total) => total,
            Budget::HeadChanged => self.freed.get(&kind).copied().unwrap_or(0),
        };
        self.freed.insert(kind, credit.saturating_sub(granted_total));
    }

    fn reap(&mut self, now: Instant, events: &mut Vec<CoreEvent>) {
        let reaped = self.ledger.reap_expired(now);
        if reaped.is_empty() {
            return;
        }
        let mut freed: Vec<(ResourceKind, u64)> = Vec::new();
        for expired in reaped {
            self.stats.expired += 1;
            match freed.iter_mut().find(|(k, _)| *k == expired.kind) {
                Some((_, total)) => *total += expired.quantity,
                None => freed.push((expired.kind, expired.quantity)),
            }
            events.push(CoreEvent::LeaseExpired {
                lease: expired.lease,
                kind: expired.kind,
                quantity: expired.quantity,
                requester: expired.requester,
            });
        }
        for (kind, quantity) in freed {
            self.drain(kind, Budget::Freed(quantity), events);
        }
    }
}

pub struct ResourceBroker {
    state: Mutex<BrokerState>,
    max_queue_depth: usize,
    sink: Arc<dyn EventSink>,
}

impl ResourceBroker {
    pub fn new(ledger: Ledger, max_queue_depth: usize, sink: Arc<dyn EventSink>) -> Self {
        Self {
            state: Mutex::new(BrokerState {
                ledger,
                queues: HashMap::new(),
                freed: HashMap::new(),
                next_ticket: 0,
                stats: BrokerStats::default(),
            }),
            max_queue_depth: max_queue_depth.max(1),
            sink,
        }
    }

    fn emit_all(&self, events: Vec<CoreEvent>) {
        for event in events {
            self.sink.emit(event);
        }
    }

    fn deny(&self, request: &ResourceRequest, reason: DenialReason) -> DenialReason {
        self.sink.emit(CoreEvent::ResourceDenied {
            requester: request.requester.clone(),
            kind: request.kind,
            quantity: request.quantity,
            reason,
        });
        reason
    }

    /// 申请资源：能立即满足则授予，否则排队直到被授予、截止时间到达或取消
    pub async fn request(
        &self,
        request: ResourceRequest,
        cancel: &CancellationToken,
    ) -> Result<ResourceGrant, DenialReason> {
        let kind = request.kind;
        if cancel.is_cancelled() {
            self.state.lock().stats.count_denial(DenialReason::Cancelled);
            return Err(self.deny(&request, DenialReason::Cancelled));
        }

        let mut events = Vec::new();
        let enqueued = {
            let mut st = self.state.lock();
            st.reap(Instant::now(), &mut events);
            if st.prune_closed(kind) {
                st.drain(kind, Budget::HeadChanged, &mut events);
            }

            if request.quantity > st.ledger.capacity(kind) {
                Err(DenialReason::CapacityUnavailable)
            } else if st.queue_len(kind) == 0 && st.ledger.fits(kind, request.quantity) {
                let reserved = st.ledger.reserve(kind, request.quantity, &request.requester);
                match reserved {
                    Ok(grant) => {
                        st.stats.granted += 1;
                        drop(st);
                        events.push(CoreEvent::ResourceGranted {
                            requester: request.requester.clone(),
                            kind,
                            quantity: request.quantity,
                            lease: grant.lease,
                            queued: false,
                        });
                        self.emit_all(events);
                        return Ok(grant);
                    }
                    Err(_) => Err(DenialReason::CapacityUnavailable),
                }
            } else if st.queue_len(kind) >= self.max_queue_depth {
                Err(DenialReason::CapacityUnavailable)
            } else if request.deadline.is_some_and(|d| d <= Instant::now()) {
                Err(DenialReason::DeadlineExceeded)
            } else {
                let ticket = st.next_ticket;
                st.next_ticket += 1;
                let (tx, rx) = oneshot::channel();
                st.queue(kind).push_back(Waiter {
                    ticket,
                    quantity: request.quantity,
                    requester: request.requester.clone(),
                    tx,
                });
                tracing::debug!(
                    requester = %request.requester,
                    kind = %kind,
                    quantity = request.quantity,
                    position = st.queue_len(kind),
                    "resource request queued"
                );
                Ok((ticket, rx))
            }
        };
        self.emit_all(events);

        let (ticket, mut rx) = match enqueued {
            Ok(slot) => slot,
            Err(reason) => {
                self.state.lock().stats.count_denial(reason);
                return Err(self.deny(&request, reason));
            }
        };

        let reason = tokio::select! {
            biased;
            res = &mut rx => match res {
                Ok(grant) => return Ok(grant),
                // 发送端只会随 Broker 一起被丢弃
                Err(_) => DenialReason::CapacityUnavailable,
            },
            _ = cancel.cancelled() => DenialReason::Cancelled,
            _ = sleep_until_deadline(request.deadline) => DenialReason::DeadlineExceeded,
        };

        let mut events = Vec::new();
        let withdrawn = {
            let mut st = self.state.lock();
            let withdrawn = st.withdraw(kind, ticket);
            if withdrawn {
                st.stats.count_denial(reason);
                // 队首离开后，后面的请求可能已可满足
                st.drain(kind, Budget::HeadChanged, &mut events);
            }
            withdrawn
        };
        self.emit_all(events);

        if withdrawn {
            return Err(self.deny(&request, reason));
        }

        // 授予与超时 / 取消同时发生：授予已在锁内送达
        match rx.try_recv() {
            Ok(grant) if reason == DenialReason::Cancelled => {
                let _ = self.release(grant.lease);
                self.state.lock().stats.count_denial(reason);
                Err(self.deny(&request, reason))
            }
            Ok(grant) => Ok(grant),
            Err(_) => {
                self.state.lock().stats.count_denial(reason);
                Err(self.deny(&request, reason))
            }
        }
    }

    /// 释放租约并唤醒该种类队列中可满足的请求
    pub fn release(&self, lease: LeaseId) -> Result<(), LedgerError> {
        let mut events = Vec::new();
        let result = {
            let mut st = self.state.lock();
            match st.ledger.release(lease) {
                Ok((kind, quantity)) => {
                    st.stats.released += 1;
                    events.push(CoreEvent::ResourceReleased {
                        lease,
                        kind,
                        quantity,
                    });
                    st.drain(kind, Budget::Freed(quantity), &mut events);
                    Ok(())
                }
                Err(e) => {
                    st.stats.lease_not_found += 1;
                    Err(e)
                }
            }
        };
        self.emit_all(events);
        if let Err(ref e) = result {
            tracing::warn!(lease = %lease, "Release rejected: {}", e);
        }
        result
    }

    /// 回收过期租约，返回回收数量
    pub fn reap_expired(&self) -> usize {
        let mut events = Vec::new();
        {
            let mut st = self.state.lock();
            st.reap(Instant::now(), &mut events);
        }
        let count = events
            .iter()
            .filter(|e| matches!(e, CoreEvent::LeaseExpired { .. }))
            .count();
        if count > 0 {
            tracing::info!(count, "Reclaimed expired leases");
        }
        self.emit_all(events);
        count
    }

    /// 后台周期回收过期租约，token 取消时退出
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        broker.reap_expired();
                    }
                }
            }
            tracing::debug!("Lease reaper stopped");
        })
    }

    pub fn capacity(&self, kind: ResourceKind) -> u64 {
        self.state.lock().ledger.capacity(kind)
    }

    pub fn committed(&self, kind: ResourceKind) -> u64 {
        self.state.lock().ledger.committed(kind)
    }

    pub fn queue_len(&self, kind: ResourceKind) -> usize {
        self.state.lock().queue_len(kind)
    }

    pub fn is_active(&self, lease: LeaseId) -> bool {
        self.state.lock().ledger.is_active(lease)
    }

    pub fn stats(&self) -> BrokerStats {
        self.state.lock().stats.clone()
    }

    /// 各资源种类的占用快照
    pub fn snapshot(&self) -> Vec<KindUsage> {
        let st = self.state.lock();
        ResourceKind::ALL
            .into_iter()
            .map(|kind| {
                let mut usage = st.ledger.usage(kind);
                if let Some(queue) = st.queues.get(&kind) {
                    usage.queued = queue.len();
                    usage.queued_quantity = queue.iter().map(|w| w.quantity).sum();
                }
                usage
            })
            .collect()
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// 持有一组授予；显式 `release_all` 或 Drop 时归还，覆盖成功、失败与 panic 展开等所有退出路径
pub struct LeaseGuard {
    broker: Arc<ResourceBroker>,
    grants: Vec<ResourceGrant>,
}

impl LeaseGuard {
    pub fn new(broker: Arc<ResourceBroker>) -> Self {
        Self {
            broker,
            grants: Vec::new(),
        }
    }

    pub fn push(&mut self, grant: ResourceGrant) {
        self.grants.push(grant);
    }

    pub fn grants(&self) -> &[ResourceGrant] {
        &self.grants
    }

    pub fn leases(&self) -> Vec<LeaseId> {
        self.grants.iter().map(|g| g.lease).collect()
    }

    /// 逆序释放全部租约；已过期回收的租约只记日志
    pub fn release_all(&mut self) -> Vec<LeaseId> {
        let mut released = Vec::with_capacity(self.grants.len());
        while let Some(grant) = self.grants.pop() {
            match self.broker.release(grant.lease) {
                Ok(()) => {}
                Err(LedgerError::LeaseNotFound(_)) => {
                    tracing::debug!(lease = %grant.lease, "Lease already reclaimed before release");
                }
                Err(e) => tracing::warn!(lease = %grant.lease, "Lease release failed: {}", e),
            }
            released.push(grant.lease);
        }
        released.reverse();
        released
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if !self.grants.is_empty() {
            self.release_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::{MemorySink, NoopSink};

    fn broker(cpu: u64) -> Arc<ResourceBroker> {
        let ledger = Ledger::new([(ResourceKind::CpuShare, cpu)], Duration::from_secs(60));
        Arc::new(ResourceBroker::new(ledger, 16, Arc::new(NoopSink)))
    }

    async fn wait_queued(broker: &ResourceBroker, kind: ResourceKind, n: usize) {
        for _ in 0..1000 {
            if broker.queue_len(kind) == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("queue never reached {n}");
    }

    #[tokio::test]
    async fn test_immediate_grant() {
        let b = broker(10);
        let token = CancellationToken::new();
        let g = b
            .request(ResourceRequest::new(ResourceKind::CpuShare, 4, "a"), &token)
            .await
            .unwrap();
        assert_eq!(b.committed(ResourceKind::CpuShare), 4);
        b.release(g.lease).unwrap();
        assert_eq!(b.committed(ResourceKind::CpuShare), 0);
        assert_eq!(b.stats().granted, 1);
        assert_eq!(b.stats().released, 1);
    }

    #[tokio::test]
    async fn test_oversized_request_denied_capacity_unavailable() {
        let b = broker(10);
        let token = CancellationToken::new();
        let err = b
            .request(ResourceRequest::new(ResourceKind::CpuShare, 11, "a"), &token)
            .await
            .unwrap_err();
        assert_eq!(err, DenialReason::CapacityUnavailable);
        assert_eq!(b.queue_len(ResourceKind::CpuShare), 0);
    }

    #[tokio::test]
    async fn test_release_unknown_lease_is_reported() {
        let b = broker(10);
        assert_eq!(b.release(LeaseId(42)), Err(LedgerError::LeaseNotFound(LeaseId(42))));
        assert_eq!(b.stats().lease_not_found, 1);
    }

    #[tokio::test]
    async fn test_deadline_exceeded_dequeues() {
        let b = broker(10);
        let token = CancellationToken::new();
        let holder = b
            .request(ResourceRequest::new(ResourceKind::CpuShare, 10, "holder"), &token)
            .await
            .unwrap();

        let req = ResourceRequest::new(ResourceKind::CpuShare, 1, "late").with_timeout(Duration::from_millis(20));
        let err = b.request(req, &token).await.unwrap_err();
        assert_eq!(err, DenialReason::DeadlineExceeded);
        assert_eq!(b.queue_len(ResourceKind::CpuShare), 0);
        assert_eq!(b.stats().denied_deadline, 1);

        b.release(holder.lease).unwrap();
        assert_eq!(b.committed(ResourceKind::CpuShare), 0);
    }

    #[tokio::test]
    async fn test_cancel_unblocks_queued_request() {
        let b = broker(10);
        let root = CancellationToken::new();
        let _holder = b
            .request(ResourceRequest::new(ResourceKind::CpuShare, 10, "holder"), &root)
            .await
            .unwrap();

        let lineage = root.child_token();
        let waiter = {
            let b = Arc::clone(&b);
            let lineage = lineage.clone();
            tokio::spawn(async move {
                b.request(ResourceRequest::new(ResourceKind::CpuShare, 3, "w"), &lineage)
                    .await
            })
        };
        wait_queued(&b, ResourceKind::CpuShare, 1).await;
        lineage.cancel();
        let res = waiter.await.unwrap();
        assert_eq!(res, Err(DenialReason::Cancelled));
        assert_eq!(b.queue_len(ResourceKind::CpuShare), 0);
    }

    #[tokio::test]
    async fn test_queue_depth_limit() {
        let ledger = Ledger::new([(ResourceKind::CpuShare, 1)], Duration::from_secs(60));
        let b = Arc::new(ResourceBroker::new(ledger, 1, Arc::new(NoopSink)));
        let token = CancellationToken::new();
        let _held = b
            .request(ResourceRequest::new(ResourceKind::CpuShare, 1, "h"), &token)
            .await
            .unwrap();

        let queued = {
            let b = Arc::clone(&b);
            let token = token.clone();
            tokio::spawn(async move {
                b.request(ResourceRequest::new(ResourceKind::CpuShare, 1, "q"), &token).await
            })
        };
        wait_queued(&b, ResourceKind::CpuShare, 1).await;

        let err = b
            .request(ResourceRequest::new(ResourceKind::CpuShare, 1, "overflow"), &token)
            .await
            .unwrap_err();
        assert_eq!(err, DenialReason::CapacityUnavailable);
        token.cancel();
        assert_eq!(queued.await.unwrap(), Err(DenialReason::Cancelled));
    }

    #[tokio::test]
    async fn test_departed_waiter_does_not_count_toward_queue_depth() {
        let ledger = Ledger::new([(ResourceKind::CpuShare, 1)], Duration::from_secs(60));
        let b = Arc::new(ResourceBroker::new(ledger, 1, Arc::new(NoopSink)));
        let token = CancellationToken::new();
        let held = b
            .request(ResourceRequest::new(ResourceKind::CpuShare, 1, "h"), &token)
            .await
            .unwrap();

        let gone = {
            let b = Arc::clone(&b);
            let token = token.clone();
            tokio::spawn(async move {
                b.request(ResourceRequest::new(ResourceKind::CpuShare, 1, "gone"), &token).await
            })
        };
        wait_queued(&b, ResourceKind::CpuShare, 1).await;
        gone.abort();
        assert!(gone.await.unwrap_err().is_cancelled());

        let next = {
            let b = Arc::clone(&b);
            let token = token.clone();
            tokio::spawn(async move {
                b.request(ResourceRequest::new(ResourceKind::CpuShare, 1, "next"), &token).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!next.is_finished());
        assert_eq!(b.queue_len(ResourceKind::CpuShare), 1);

        b.release(held.lease).unwrap();
        let grant = next.await.unwrap().unwrap();
        assert_eq!(grant.quantity, 1);
        assert_eq!(b.stats().denied_capacity, 0);
    }

    #[tokio::test]
    async fn test_release_grants_only_freed_capacity() {
        let b = broker(10);
        let token = CancellationToken::new();
        let mut held = Vec::new();
        for name in ["x", "y", "z"] {
            held.push(
                b.request(ResourceRequest::new(ResourceKind::CpuShare, 3, name), &token)
                    .await
                    .unwrap(),
            );
        }

        let waiter = {
            let b = Arc::clone(&b);
            let token = token.clone();
            tokio::spawn(async move {
                b.request(ResourceRequest::new(ResourceKind::CpuShare, 4, "w"), &token).await
            })
        };
        wait_queued(&b, ResourceKind::CpuShare, 1).await;

        // 6 + 4 <= 10 放得下，但这次只腾出 3
        b.release(held[0].lease).unwrap();
        assert_eq!(b.queue_len(ResourceKind::CpuShare), 1);
        assert_eq!(b.committed(ResourceKind::CpuShare), 6);

        // 未用完的 3 与这次的 3 合计 6，足够授予
        b.release(held[1].lease).unwrap();
        let grant = waiter.await.unwrap().unwrap();
        assert_eq!(grant.quantity, 4);
        assert_eq!(b.committed(ResourceKind::CpuShare), 7);
        assert_eq!(b.queue_len(ResourceKind::CpuShare), 0);
    }

    #[tokio::test]
    async fn test_expired_lease_is_reaped_and_wakes_queue() {
        let ledger = Ledger::new([(ResourceKind::CpuShare, 10)], Duration::from_millis(30));
        let sink = Arc::new(MemorySink::default());
        let b = Arc::new(ResourceBroker::new(ledger, 16, sink.clone()));
        let token = CancellationToken::new();
        let stale = b
            .request(ResourceRequest::new(ResourceKind::CpuShare, 10, "stale"), &token)
            .await
            .unwrap();

        let reaper = b.spawn_reaper(Duration::from_millis(5), token.clone());
        let g = b
            .request(
                ResourceRequest::new(ResourceKind::CpuShare, 5, "next").with_timeout(Duration::from_secs(2)),
                &token,
            )
            .await
            .unwrap();
        assert_eq!(g.quantity, 5);
        assert!(b.stats().expired >= 1);
        assert_eq!(b.release(stale.lease), Err(LedgerError::LeaseNotFound(stale.lease)));
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, CoreEvent::LeaseExpired { lease, .. } if *lease == stale.lease)));

        token.cancel();
        reaper.await.unwrap();
    }

    #[tokio::test]
    async fn test_lease_guard_releases_on_drop() {
        let b = broker(10);
        let token = CancellationToken::new();
        {
            let mut guard = LeaseGuard::new(Arc::clone(&b));
            guard.push(
                b.request(ResourceRequest::new(ResourceKind::CpuShare, 7, "g"), &token)
                    .await
                    .unwrap(),
            );
            assert_eq!(b.committed(ResourceKind::CpuShare), 7);
        }
        assert_eq!(b.committed(ResourceKind::CpuShare), 0);
        assert_eq!(b.stats().released, 1);
    }
}
