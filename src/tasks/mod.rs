//! Background tasks.

mod maintenance;

pub use maintenance::{MaintenanceConfig, MaintenanceTask};
