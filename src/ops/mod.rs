//! Operational tooling: broker counters.

pub mod observability;

pub use observability::{BrokerMetrics, MetricsSnapshot};
