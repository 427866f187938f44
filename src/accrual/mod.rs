//! Yield accrual: the pure calculator and the eligible-position registry

pub mod calculator;
pub mod registry;

pub use calculator::{accrued_yield, SECONDS_PER_DAY};
pub use registry::PositionRegistry;
