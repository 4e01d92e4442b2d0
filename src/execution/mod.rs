// Order execution module
pub mod coordinator;
pub mod retry;

pub use coordinator::{ExecutionAction, ExecutionDecision, OrderCoordinator};
pub use retry::RetryPolicy;
