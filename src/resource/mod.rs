//! 资源仲裁：Ledger（容量与租约账本）+ Broker（授予 / 排队 / 拒绝）

pub mod broker;
pub mod ledger;
pub mod types;

pub use broker::{BrokerStats, LeaseGuard, ResourceBroker};
pub use ledger::{ExpiredLease, Ledger};
pub use types::{KindUsage, LeaseId, ResourceDemand, ResourceGrant, ResourceKind, ResourceRequest};
