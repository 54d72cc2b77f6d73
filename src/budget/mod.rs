//! Cost governance: token/cost accounting and per-user budget enforcement.

pub mod cost;
pub mod enforcer;

pub use cost::{CostAccountant, GuidanceTokenCounter, SystemUsage};
pub use enforcer::{BudgetCheck, BudgetEnforcer};
