//! Parent / Child 角色：Supervisor 评估与精炼，Executor 申请资源并执行；规划器在边界之外

pub mod executor;
pub mod planner;
pub mod policy;
pub mod supervisor;

pub use executor::{Executor, ExecutorSettings};
pub use planner::{JsonPlanner, PlanGenerator, ScriptedPlanner, TaskDraft};
pub use policy::SafetyPolicy;
pub use supervisor::{ProposalState, Review, Supervisor};
