pub mod error;
pub mod planner;
pub mod reconciler;

pub use error::EngineError;
pub use planner::{current_state_from, plan, Step};
pub use reconciler::{Reconciler, ReconcileReport};
