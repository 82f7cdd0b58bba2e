//! Resource Ledger：每种资源的容量、已承诺量与未释放租约
//!
//! Ledger 本身不加锁，只能经由 ResourceBroker 的单一临界区访问；
//! 不变量：任意时刻 committed <= capacity。

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::core::error::LedgerError;
use crate::resource::{KindUsage, LeaseId, ResourceGrant, ResourceKind};

/// 租约记录：只保存数量与到期时间，不引用 ResourceGrant 对象
#[derive(Debug, Clone)]
struct LeaseRecord {
    kind: ResourceKind,
    quantity: u64,
    requester: String,
    expires_at: Instant,
}

#[derive(Debug, Clone)]
struct KindAccount {
    capacity: u64,
    committed: u64,
}

/// 被回收的过期租约
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredLease {
    pub lease: LeaseId,
    pub kind: ResourceKind,
    pub quantity: u64,
    pub requester: String,
}

#[derive(Debug)]
pub struct Ledger {
    accounts: HashMap<ResourceKind, KindAccount>,
    leases: HashMap<LeaseId, LeaseRecord>,
    lease_ttl: Duration,
    next_lease: u64,
}

impl Ledger {
    /// `capacities` 须已通过配置校验（每项 > 0）；未列出的种类容量为 0，任何申请都会被拒绝
    pub fn new(capacities: impl IntoIterator<Item = (ResourceKind, u64)>, lease_ttl: Duration) -> Self {
        let mut accounts: HashMap<ResourceKind, KindAccount> = ResourceKind::ALL
            .into_iter()
            .map(|k| (k, KindAccount { capacity: 0, committed: 0 }))
            .collect();
        for (kind, capacity) in capacities {
            if let Some(acc) = accounts.get_mut(&kind) {
                acc.capacity = capacity;
            }
        }
        Self {
            accounts,
            leases: HashMap::new(),
            lease_ttl,
            next_lease: 1,
        }
    }

    fn account(&self, kind: ResourceKind) -> &KindAccount {
        // 构造时已为全部种类建账
        &self.accounts[&kind]
    }

    pub fn capacity(&self, kind: ResourceKind) -> u64 {
        self.account(kind).capacity
    }

    pub fn committed(&self, kind: ResourceKind) -> u64 {
        self.account(kind).committed
    }

    pub fn available(&self, kind: ResourceKind) -> u64 {
        let acc = self.account(kind);
        acc.capacity - acc.committed
    }

    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    /// 是否可以立即满足该数量
    pub fn fits(&self, kind: ResourceKind, quantity: u64) -> bool {
        quantity <= self.available(kind)
    }

    /// 原子预留：成功时承诺量增加并返回租约
    pub fn reserve(
        &mut self,
        kind: ResourceKind,
        quantity: u64,
        requester: &str,
    ) -> Result<ResourceGrant, LedgerError> {
        let available = self.available(kind);
        if quantity > available {
            return Err(LedgerError::Insufficient {
                kind,
                requested: quantity,
                available,
            });
        }

        let lease = LeaseId(self.next_lease);
        self.next_lease += 1;
        let expires_at = Instant::now() + self.lease_ttl;

        if let Some(acc) = self.accounts.get_mut(&kind) {
            acc.committed += quantity;
            debug_assert!(acc.committed <= acc.capacity);
        }
        self.leases.insert(
            lease,
            LeaseRecord {
                kind,
                quantity,
                requester: requester.to_string(),
                expires_at,
            },
        );

        Ok(ResourceGrant {
            lease,
            kind,
            quantity,
            expires_at,
        })
    }

    /// 释放租约；未知或已释放（含已过期回收）的租约返回 LeaseNotFound
    pub fn release(&mut self, lease: LeaseId) -> Result<(ResourceKind, u64), LedgerError> {
        let record = self
            .leases
            .remove(&lease)
            .ok_or(LedgerError::LeaseNotFound(lease))?;
        if let Some(acc) = self.accounts.get_mut(&record.kind) {
            acc.committed = acc.committed.saturating_sub(record.quantity);
        }
        Ok((record.kind, record.quantity))
    }

    /// 回收 `now` 时刻已过期的租约
    pub fn reap_expired(&mut self, now: Instant) -> Vec<ExpiredLease> {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, r)| r.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();

        let mut reaped = Vec::with_capacity(expired.len());
        for lease in expired {
            if let Some(record) = self.leases.remove(&lease) {
                if let Some(acc) = self.accounts.get_mut(&record.kind) {
                    acc.committed = acc.committed.saturating_sub(record.quantity);
                }
                reaped.push(ExpiredLease {
                    lease,
                    kind: record.kind,
                    quantity: record.quantity,
                    requester: record.requester,
                });
            }
        }
        reaped.sort_by_key(|e| e.lease);
        reaped
    }

    pub fn active_leases(&self, kind: ResourceKind) -> usize {
        self.leases.values().filter(|r| r.kind == kind).count()
    }

    pub fn is_active(&self, lease: LeaseId) -> bool {
        self.leases.contains_key(&lease)
    }

    pub fn usage(&self, kind: ResourceKind) -> KindUsage {
        let acc = self.account(kind);
        KindUsage {
            kind,
            capacity: acc.capacity,
            committed: acc.committed,
            active_leases: self.active_leases(kind),
            queued: 0,
            queued_quantity: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(cpu: u64) -> Ledger {
        Ledger::new([(ResourceKind::CpuShare, cpu)], Duration::from_secs(60))
    }

    #[test]
    fn test_reserve_and_release() {
        let mut l = ledger(10);
        let g = l.reserve(ResourceKind::CpuShare, 6, "a").unwrap();
        assert_eq!(l.committed(ResourceKind::CpuShare), 6);
        assert_eq!(g.quantity, 6);

        let err = l.reserve(ResourceKind::CpuShare, 6, "b").unwrap_err();
        assert_eq!(
            err,
            LedgerError::Insufficient {
                kind: ResourceKind::CpuShare,
                requested: 6,
                available: 4
            }
        );

        assert_eq!(l.release(g.lease).unwrap(), (ResourceKind::CpuShare, 6));
        assert_eq!(l.committed(ResourceKind::CpuShare), 0);
    }

    #[test]
    fn test_double_release_is_lease_not_found() {
        let mut l = ledger(10);
        let g = l.reserve(ResourceKind::CpuShare, 1, "a").unwrap();
        l.release(g.lease).unwrap();
        assert_eq!(l.release(g.lease), Err(LedgerError::LeaseNotFound(g.lease)));
        assert_eq!(l.release(LeaseId(999)), Err(LedgerError::LeaseNotFound(LeaseId(999))));
    }

    #[test]
    fn test_unconfigured_kind_has_zero_capacity() {
        let mut l = ledger(10);
        assert_eq!(l.capacity(ResourceKind::DiskBytes), 0);
        assert!(l.reserve(ResourceKind::DiskBytes, 1, "a").is_err());
    }

    #[test]
    fn test_reap_expired_returns_quantity() {
        let mut l = Ledger::new([(ResourceKind::CpuShare, 10)], Duration::from_millis(10));
        let g = l.reserve(ResourceKind::CpuShare, 4, "a").unwrap();
        assert!(l.reap_expired(Instant::now()).is_empty());

        let reaped = l.reap_expired(g.expires_at);
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].lease, g.lease);
        assert_eq!(reaped[0].quantity, 4);
        assert_eq!(l.committed(ResourceKind::CpuShare), 0);
        assert!(!l.is_active(g.lease));
        assert_eq!(l.release(g.lease), Err(LedgerError::LeaseNotFound(g.lease)));
    }

    #[test]
    fn test_exact_fit_is_allowed() {
        let mut l = ledger(10);
        l.reserve(ResourceKind::CpuShare, 10, "a").unwrap();
        assert_eq!(l.available(ResourceKind::CpuShare), 0);
        assert!(!l.fits(ResourceKind::CpuShare, 1));
        assert!(l.fits(ResourceKind::CpuShare, 0));
    }
}
