//! Single-workflow reconciliation engine.
//!
//! One `Operator::operate` call advances a workflow one step toward
//! completion: it assesses observed pods, walks the template tree from the
//! entrypoint, applies retry/backoff and parallelism rules, and persists the
//! mutated status with optimistic concurrency. Pod construction, queueing,
//! caching, and locking are delegated to the collaborator traits in
//! `foreman-backends-core`.

pub mod conditions;
pub mod config;
pub mod error;
pub mod items;
pub mod operation;
pub mod progress;
pub mod scope;
pub mod template;

pub use self::config::OperatorConfig;
pub use self::error::OperateError;
pub use self::operation::{Collaborators, OperationResult, Operator};
