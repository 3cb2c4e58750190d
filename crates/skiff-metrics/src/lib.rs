pub mod collector;

pub use collector::{MetricsCollector, MetricsSnapshot, NetworkInterface, ProcessInfo};
