pub mod controller;
pub mod decision_loop;
pub mod executor;

pub use controller::{LoopController, LoopStatus};
pub use decision_loop::{DecisionLoop, LoopSettings};
pub use executor::{ExecutionReport, PlanExecutor};
