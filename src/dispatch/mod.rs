//! Planning and execution of sub-agent work.
//!
//! [`policy`] turns a directive into a [`Plan`], [`Dispatcher`] runs the
//! plan under the concurrency limit and the budget ledger, and [`task`]
//! holds the types both sides share.

pub mod dispatcher;
pub mod policy;
pub mod task;

pub use dispatcher::Dispatcher;
pub use policy::{plan, replan, DelegationMode, Plan};
pub use task::{TaskFailure, TaskFailureKind, TaskOutcome, TaskResult, TaskSpec};
