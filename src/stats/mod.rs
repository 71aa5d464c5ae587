//! Statistics and health diagnostics over queue entries.

pub mod calculator;
pub mod health;

pub use calculator::{format_age, QueueStatistics, QueueStatisticsCalculator};
pub use health::{HealthLevel, HealthStatus, HealthThresholds, QueueHealthMonitor};
